//! Infrastructure: concrete adapters behind the domain ports.

pub mod cache;
pub mod config;
pub mod kube;
pub mod log_service;
pub mod logging;
pub mod preferences;
pub mod project;
pub mod status;
pub mod store;

pub use cache::FileSystemCache;
pub use config::{ConfigError, ConfigLoader};
pub use log_service::RemoteProgressLog;
pub use logging::LoggerImpl;
pub use preferences::FilePreferences;
pub use project::LocalProjectReader;
pub use status::HttpStatusPublisher;
