//! Domain layer: models and ports.
//!
//! Models are plain data types shared across the delivery core; ports are
//! the async traits behind which all external collaborators (event store,
//! source-control provider, Kubernetes API, preferences) live.

pub mod models;
pub mod ports;
