//! Kubernetes manifest types and the goal-job builder.
//!
//! Only the slice of the Deployment/Job schema the scheduler touches is
//! typed; everything else passes through untouched on the wire. The job
//! builder clones the SDM's own pod spec so workers run with the exact
//! image, mounts, and service account of the master.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ports::KubeError;
use crate::services::scheduler;

/// Label carrying the goal set id, also the pod-affinity key.
pub const GOAL_SET_ID_LABEL: &str = "atomist.com/goal-set-id";
/// Label carrying the sanitized goal unique name.
pub const GOAL_NAME_LABEL: &str = "atomist.com/goal-name";
/// Label carrying the workspace id.
pub const WORKSPACE_LABEL: &str = "atomist.com/workspace-id";

/// Shared volume holding the cloned repository for the worker.
pub const HOME_VOLUME: &str = "home";
/// Mount point of the shared home volume.
pub const HOME_MOUNT_PATH: &str = "/atm/home";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Fields we do not interpret (resources, probes, security context).
    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelector {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodAffinityTerm {
    pub label_selector: LabelSelector,
    pub topology_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedPodAffinityTerm {
    pub weight: i32,
    pub pod_affinity_term: PodAffinityTerm,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodAffinity {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preferred_during_scheduling_ignored_during_execution: Vec<WeightedPodAffinityTerm>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Affinity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_affinity: Option<PodAffinity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    pub containers: Vec<Container>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodTemplateSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentSpec {
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Deployment {
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobSpec {
    pub template: PodTemplateSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

/// Parameters of one scheduled goal worker.
#[derive(Debug, Clone)]
pub struct GoalJobParams {
    pub goal_set_id: String,
    pub goal_unique_name: String,
    pub goal_environment: String,
    pub workspace_id: String,
    pub workspace_name: Option<String>,
    pub correlation_id: Uuid,
}

/// Sanitize a string into a DNS-1123 label fragment.
fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_string()
}

/// Job name rule: `<deployment>-job-<goalSetId[:7]>-<goalName>`, sanitized
/// and clipped to the Kubernetes 63-character name limit. Deterministic for
/// the same inputs, which makes re-scheduling idempotent.
pub fn job_name(deployment: &str, goal_set_id: &str, goal_unique_name: &str) -> String {
    let id_prefix = &goal_set_id[..goal_set_id.len().min(7)];
    let name = sanitize(&format!("{deployment}-job-{id_prefix}-{goal_unique_name}"));
    name.chars().take(63).collect::<String>().trim_matches('-').to_string()
}

/// Build the worker Job manifest by cloning the SDM deployment's pod spec.
pub fn job_for_goal(
    deployment: &Deployment,
    namespace: &str,
    params: &GoalJobParams,
) -> Result<JobManifest, KubeError> {
    let pod = &deployment.spec.template.spec;
    let Some(container) = pod.containers.first() else {
        return Err(KubeError::InvalidManifest(format!(
            "deployment {} has no containers",
            deployment.metadata.name
        )));
    };

    let goal_env = vec![
        EnvVar::new(scheduler::ISOLATED_GOAL_ENV, "true"),
        EnvVar::new(scheduler::GOAL_SET_ID_ENV, params.goal_set_id.clone()),
        EnvVar::new(
            scheduler::GOAL_UNIQUE_NAME_ENV,
            params.goal_unique_name.clone(),
        ),
        EnvVar::new(
            scheduler::GOAL_ENVIRONMENT_ENV,
            params.goal_environment.clone(),
        ),
        EnvVar::new(
            scheduler::CORRELATION_ID_ENV,
            params.correlation_id.to_string(),
        ),
        EnvVar::new(scheduler::GOAL_TEAM_ENV, params.workspace_id.clone()),
        EnvVar::new(
            scheduler::GOAL_TEAM_NAME_ENV,
            params
                .workspace_name
                .clone()
                .unwrap_or_else(|| params.workspace_id.clone()),
        ),
    ];

    let home_mount = VolumeMount {
        name: HOME_VOLUME.to_string(),
        mount_path: HOME_MOUNT_PATH.to_string(),
    };

    let mut worker = container.clone();
    worker.env.extend(goal_env.clone());
    if !worker.volume_mounts.iter().any(|m| m.name == HOME_VOLUME) {
        worker.volume_mounts.push(home_mount.clone());
    }

    // Init container clones the repository into the shared home volume.
    let mut init = container.clone();
    init.name = format!("{}-init", sanitize(&container.name));
    init.env.extend(goal_env);
    init.env
        .push(EnvVar::new(scheduler::ISOLATED_GOAL_INIT_ENV, "true"));
    if !init.volume_mounts.iter().any(|m| m.name == HOME_VOLUME) {
        init.volume_mounts.push(home_mount);
    }

    let mut volumes = pod.volumes.clone();
    if !volumes.iter().any(|v| v.name == HOME_VOLUME) {
        volumes.push(Volume {
            name: HOME_VOLUME.to_string(),
            source: BTreeMap::from([(
                "emptyDir".to_string(),
                serde_json::Value::Object(serde_json::Map::new()),
            )]),
        });
    }

    let name = job_name(
        &deployment.metadata.name,
        &params.goal_set_id,
        &params.goal_unique_name,
    );

    let mut labels = BTreeMap::new();
    labels.insert(
        GOAL_SET_ID_LABEL.to_string(),
        sanitize(&params.goal_set_id),
    );
    labels.insert(
        GOAL_NAME_LABEL.to_string(),
        sanitize(&params.goal_unique_name),
    );
    labels.insert(WORKSPACE_LABEL.to_string(), sanitize(&params.workspace_id));

    // Goals of the same set prefer co-location.
    let affinity = Affinity {
        pod_affinity: Some(PodAffinity {
            preferred_during_scheduling_ignored_during_execution: vec![WeightedPodAffinityTerm {
                weight: 100,
                pod_affinity_term: PodAffinityTerm {
                    label_selector: LabelSelector {
                        match_labels: BTreeMap::from([(
                            GOAL_SET_ID_LABEL.to_string(),
                            sanitize(&params.goal_set_id),
                        )]),
                    },
                    topology_key: "kubernetes.io/hostname".to_string(),
                },
            }],
        }),
    };

    Ok(JobManifest {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        metadata: ObjectMeta {
            name,
            namespace: namespace.to_string(),
            labels: labels.clone(),
        },
        spec: JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: String::new(),
                    namespace: String::new(),
                    labels,
                }),
                spec: PodSpec {
                    containers: vec![worker],
                    init_containers: vec![init],
                    volumes,
                    restart_policy: Some("Never".to_string()),
                    service_account_name: pod.service_account_name.clone(),
                    affinity: Some(affinity),
                },
            },
        },
    })
}
