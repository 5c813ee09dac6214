use std::fmt;

use kube::{CELSchema, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::workspacekinds::PodMetadata;

/// Workspace is a user's request for an interactive development environment.
/// It selects one imageConfig and one podConfig from a WorkspaceKind and carries the
/// per-instance volumes.
#[derive(CustomResource, CELSchema, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[kube(
    kind = "Workspace",
    group = "kubeflow.org",
    version = "v1beta1",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state", "description":"The current state of the Workspace"}"#,
    printcolumn = r#"{"name":"Kind", "type":"string", "jsonPath":".spec.kind", "description":"The WorkspaceKind of the Workspace"}"#,
    printcolumn = r#"{"name":"Paused", "type":"boolean", "jsonPath":".spec.paused", "description":"If the Workspace is paused"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.stateMessage", "description":"The current state message of the Workspace", "priority": 1}"#
)]
#[kube(status = "WorkspaceStatus", shortname = "ws")]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// If the Workspace is paused; a paused Workspace runs no Pod
    #[serde(default)]
    pub paused: bool,
    /// If true, pending updates are not applied when the Workspace is paused
    #[serde(default)]
    pub defer_updates: bool,
    /// The WorkspaceKind of this Workspace. This field is immutable
    #[cel_validate(rule = Rule::new("self == oldSelf").message("Workspace 'kind' is immutable"))]
    pub kind: String,
    pub pod_template: WorkspacePodTemplate,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePodTemplate {
    /// Labels and annotations merged on top of the WorkspaceKind's pod metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<PodMetadata>,
    #[serde(default)]
    pub volumes: WorkspacePodVolumes,
    pub options: WorkspacePodOptions,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct WorkspacePodVolumes {
    /// Name of a PersistentVolumeClaim mounted at the WorkspaceKind's home path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    /// Additional PersistentVolumeClaims
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<PodVolumeMount>,
    /// Secrets mounted as volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<PodSecretMount>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeMount {
    pub pvc_name: String,
    #[schemars(regex(pattern = r"^/[^/].*$"))]
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSecretMount {
    pub secret_name: String,
    #[schemars(regex(pattern = r"^/[^/].*$"))]
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePodOptions {
    /// The id of an imageConfig value of the WorkspaceKind
    pub image_config: String,
    /// The id of a podConfig value of the WorkspaceKind
    pub pod_config: String,
}

/// Observed state of a Workspace
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    /// Activity reported by the culling collaborator
    #[serde(default)]
    pub activity: WorkspaceActivity,
    /// Unix seconds at which the Workspace was paused, 0 when it is not paused
    #[serde(default)]
    pub pause_time: i64,
    /// True when a selected option redirects to a different option
    #[serde(default)]
    pub pending_restart: bool,
    #[serde(default)]
    pub pod_template_options: WorkspacePodOptionsStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template_pod: Option<WorkspacePodStatus>,
    #[serde(default)]
    pub resources: WorkspaceResources,
    #[serde(default)]
    pub state: WorkspaceState,
    #[serde(default)]
    pub state_message: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceActivity {
    #[serde(default)]
    pub last_activity: i64,
    #[serde(default)]
    pub last_update: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePodOptionsStatus {
    #[serde(default)]
    pub image_config: WorkspacePodOptionInfo,
    #[serde(default)]
    pub pod_config: WorkspacePodOptionInfo,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePodOptionInfo {
    /// The option the selected one resolves to after following redirects
    #[serde(default)]
    pub desired: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_chain: Vec<RedirectStep>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct RedirectStep {
    pub source: String,
    pub target: String,
}

/// The Pod backing the Workspace
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePodStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<NamedContainer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<NamedContainer>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NamedContainer {
    pub name: String,
}

/// Names of the objects owned by the Workspace
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_service: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum WorkspaceState {
    Running,
    Terminating,
    Paused,
    Pending,
    Error,
    #[default]
    Unknown,
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceState::Running => "Running",
            WorkspaceState::Terminating => "Terminating",
            WorkspaceState::Paused => "Paused",
            WorkspaceState::Pending => "Pending",
            WorkspaceState::Error => "Error",
            WorkspaceState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_defaults_when_fields_are_missing() {
        let status: WorkspaceStatus = serde_json::from_value(json!({
            "state": "Running",
            "stateMessage": "Workspace is running"
        }))
        .unwrap();
        assert_eq!(status.state, WorkspaceState::Running);
        assert_eq!(status.pause_time, 0);
        assert!(!status.pending_restart);
        assert!(status.pod_template_options.image_config.redirect_chain.is_empty());
    }

    #[test]
    fn spec_uses_camel_case_on_the_wire() {
        let ws = fixtures::workspace("default", "jupyter", "jupyterlab");
        let value = serde_json::to_value(&ws.spec).unwrap();
        assert_eq!(
            value["podTemplate"]["options"]["imageConfig"],
            json!("jupyterlab_scipy_180")
        );
        assert_eq!(
            value["podTemplate"]["volumes"]["data"][0]["pvcName"],
            json!("workspace-data-pvc")
        );
        assert_eq!(value["deferUpdates"], json!(false));
    }
}
