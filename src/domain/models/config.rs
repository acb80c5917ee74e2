//! Configuration model for the delivery core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure for Stevedore.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// This SDM's registration name in the workspace; used for relevance
    /// filtering of goal events.
    #[serde(default = "default_registration")]
    pub registration: String,

    /// Registration version recorded in provenance entries.
    #[serde(default = "default_version")]
    pub version: String,

    /// Workspace this registration runs in.
    #[serde(default = "default_workspace_id")]
    pub workspace_id: String,

    /// Optional human-readable workspace name.
    #[serde(default)]
    pub workspace_name: Option<String>,

    /// How goals from multiple matching plan rules combine.
    #[serde(default)]
    pub merge_policy: MergePolicy,

    /// External goal/job store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Source-control commit status endpoint.
    #[serde(default)]
    pub status: StatusConfig,

    /// Goal-event signing and verification.
    #[serde(default)]
    pub signing: SigningConfig,

    /// Isolated-goal scheduling.
    #[serde(default)]
    pub scheduling: SchedulingConfig,

    /// Kubernetes scheduler settings.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Progress log buffering.
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Filesystem artifact cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Resource providers configured for this workspace.
    #[serde(default)]
    pub resource_providers: Vec<ResourceProviderConfig>,
}

fn default_registration() -> String {
    "stevedore".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_workspace_id() -> String {
    "local".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registration: default_registration(),
            version: default_version(),
            workspace_id: default_workspace_id(),
            workspace_name: None,
            merge_policy: MergePolicy::default(),
            store: StoreConfig::default(),
            status: StatusConfig::default(),
            signing: SigningConfig::default(),
            scheduling: SchedulingConfig::default(),
            kubernetes: KubernetesConfig::default(),
            progress: ProgressConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            resource_providers: vec![],
        }
    }
}

/// How goals from multiple matching plan rules combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Every matching rule contributes its goals.
    #[default]
    Additive,
    /// The first matching rule wins.
    Replace,
}

/// External goal/job store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StoreConfig {
    /// Base URL of the external store API. Unset means the in-memory store
    /// (local mode / tests).
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token for the store API.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Commit status endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StatusConfig {
    /// Whether commit statuses are published at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the source-control status API.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token for the status API.
    #[serde(default)]
    pub token: Option<String>,
}

const fn default_true() -> bool {
    true
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            token: None,
        }
    }
}

/// Goal-event signing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SigningConfig {
    /// When enabled, outbound goal events are signed and inbound events
    /// without a valid signature are rejected.
    #[serde(default)]
    pub enabled: bool,

    /// PKCS#8 PEM private signing key.
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,

    /// PKCS#1 PEM public verification keys. The published platform key is
    /// always included in addition to these.
    #[serde(default)]
    pub verification_key_paths: Vec<PathBuf>,
}

/// Which isolated-goal scheduler to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Run every goal in-process.
    #[default]
    InProcess,
    /// Fork isolated goals as subprocess workers.
    Subprocess,
    /// Schedule isolated goals as Kubernetes Jobs.
    Kubernetes,
}

/// Isolated-goal scheduling configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SchedulingConfig {
    #[serde(default)]
    pub mode: SchedulerMode,
}

/// Kubernetes scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KubernetesConfig {
    /// Deployment to clone the worker pod spec from. Overridden by
    /// `ATOMIST_DEPLOYMENT_NAME`.
    #[serde(default)]
    pub deployment_name: Option<String>,

    /// Namespace of the deployment. Overridden by
    /// `ATOMIST_DEPLOYMENT_NAMESPACE`.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Seconds between sweeps deleting succeeded jobs.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}

const fn default_cleanup_interval_secs() -> u64 {
    7200
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            deployment_name: None,
            namespace: default_namespace(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Progress log buffering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProgressConfig {
    /// Flush once this many bytes are buffered.
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,

    /// Flush at least this often, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

const fn default_flush_bytes() -> usize {
    1000
}

const fn default_flush_interval_ms() -> u64 {
    2000
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            flush_bytes: default_flush_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Filesystem artifact cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Cache root; archives live at `<root>/<classifier>/<sha>-cache.tar.gz`.
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("/opt/data")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: default_cache_root(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty.
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional directory for rolling file output.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
        }
    }
}

/// A resource provider configured for the workspace, looked up by the
/// `hasResourceProvider` push test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceProviderConfig {
    pub provider_type: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.registration, "stevedore");
        assert_eq!(config.merge_policy, MergePolicy::Additive);
        assert_eq!(config.scheduling.mode, SchedulerMode::InProcess);
        assert_eq!(config.kubernetes.namespace, "default");
        assert_eq!(config.kubernetes.cleanup_interval_secs, 7200);
        assert_eq!(config.progress.flush_bytes, 1000);
        assert_eq!(config.progress.flush_interval_ms, 2000);
        assert_eq!(config.cache.root, PathBuf::from("/opt/data"));
        assert!(!config.signing.enabled);
    }

    #[test]
    fn yaml_parsing() {
        let yaml = r"
registration: my-sdm
merge_policy: replace
scheduling:
  mode: kubernetes
kubernetes:
  deployment_name: my-sdm
  namespace: sdm
signing:
  enabled: true
  signing_key_path: /etc/keys/sdm.pem
";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");
        assert_eq!(config.registration, "my-sdm");
        assert_eq!(config.merge_policy, MergePolicy::Replace);
        assert_eq!(config.scheduling.mode, SchedulerMode::Kubernetes);
        assert_eq!(config.kubernetes.deployment_name.as_deref(), Some("my-sdm"));
        assert_eq!(config.kubernetes.namespace, "sdm");
        assert!(config.signing.enabled);
    }
}
