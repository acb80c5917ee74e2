//! Ports: async traits behind which external collaborators live.

pub mod goal_store;
pub mod kube_client;
pub mod preferences;
pub mod project_reader;
pub mod resource_providers;
pub mod status_publisher;

pub use goal_store::{GoalStore, StoreError};
pub use kube_client::{JobSummary, KubeClient, KubeError};
pub use preferences::{deploy_enabled_key, InMemoryPreferences, PreferencesError, PreferencesStore};
pub use project_reader::{ProjectError, ProjectReader};
pub use resource_providers::{
    ConfiguredProviders, ResourceProviderError, ResourceProviderRegistry,
};
pub use status_publisher::{
    external_status_for, CommitStatus, CommitStatusState, StatusError, StatusPublisher,
};
