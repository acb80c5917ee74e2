//! Logging: tracing initialization and secret redaction.

pub mod logger;
pub mod redaction;

pub use logger::LoggerImpl;
pub use redaction::{redact, Redactor};
