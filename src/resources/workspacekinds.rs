use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, PodSecurityContext, Probe, ResourceRequirements,
    SecurityContext, Toleration, Volume, VolumeMount,
};
use kube::{CELSchema, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Held by a WorkspaceKind while at least one Workspace references it
pub static WORKSPACE_KIND_FINALIZER: &str = "notebooks.kubeflow.org/workspacekind-protection";

/// WorkspaceKind is a cluster-wide template catalog for Workspaces.
/// It declares the imageConfig and podConfig options a Workspace may pick from, and the
/// shape of the Pod that runs every Workspace of this kind.
#[derive(CustomResource, CELSchema, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[kube(
    kind = "WorkspaceKind",
    group = "kubeflow.org",
    version = "v1beta1",
    printcolumn = r#"{"name":"Workspaces", "type":"integer", "jsonPath":".status.workspaces", "description":"The number of Workspaces using this WorkspaceKind"}"#,
    printcolumn = r#"{"name":"Deprecated", "type":"boolean", "jsonPath":".spec.spawner.deprecated", "description":"If this WorkspaceKind is deprecated"}"#,
    printcolumn = r#"{"name":"Hidden", "type":"boolean", "jsonPath":".spec.spawner.hidden", "description":"If this WorkspaceKind is hidden from the spawner UI"}"#
)]
#[kube(status = "WorkspaceKindStatus", shortname = "wsk")]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindSpec {
    /// How the WorkspaceKind is displayed in the Workspace Spawner UI
    pub spawner: WorkspaceKindSpawner,
    /// The template used to spawn Pods for Workspaces of this kind
    pub pod_template: WorkspaceKindPodTemplate,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindSpawner {
    /// The display name of the WorkspaceKind
    #[schemars(length(min = 2, max = 128))]
    pub display_name: String,
    /// The description of the WorkspaceKind
    #[schemars(length(min = 2, max = 4096))]
    pub description: String,
    /// If this WorkspaceKind should be hidden from the Workspace Spawner UI
    #[serde(default)]
    pub hidden: bool,
    /// If this WorkspaceKind is deprecated
    #[serde(default)]
    pub deprecated: bool,
    /// A message to show in the Workspace Spawner UI when the WorkspaceKind is deprecated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecation_message: Option<String>,
    /// A small (favicon-sized) icon used in the Workspaces overview table
    pub icon: WorkspaceKindIcon,
    /// A 1:1 (card size) logo used in the Workspace Spawner UI
    pub logo: WorkspaceKindIcon,
}

/// Exactly one of `url` or `configMap`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, CELSchema)]
#[cel_validate(rule = Rule::new("has(self.url) != has(self.configMap)").message("must specify exactly one of 'url' or 'configMap'"))]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindIcon {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<WorkspaceKindConfigMap>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct WorkspaceKindConfigMap {
    pub name: String,
    pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindPodTemplate {
    /// Labels and annotations for Workspace Pods. Workspace-level values win on collision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<PodMetadata>,
    /// The ServiceAccount Workspace Pods run as
    pub service_account: WorkspaceKindServiceAccount,
    /// Culling configuration for pausing inactive Workspaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culling: Option<WorkspaceKindCullingConfig>,
    /// Probes for the "main" container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<WorkspaceKindProbes>,
    /// Volume mount paths
    pub volume_mounts: WorkspaceKindVolumeMounts,
    /// Kind-wide HTTP proxy configuration, used by ports without their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<HttpProxy>,
    /// Per-port routing configuration, keyed by image port id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<WorkspaceKindPort>>,
    /// Environment variables for the "main" container.
    /// Values are templates; `{{ httpPathPrefix("<port id>") }}` expands to the connect path of a port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_env: Option<Vec<EnvVar>>,
    /// Volumes appended to the Pod when their name is free
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_volumes: Option<Vec<Volume>>,
    /// Mounts appended to the "main" container when their path is free and their volume exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_volume_mounts: Option<Vec<VolumeMount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_security_context: Option<SecurityContext>,
    /// The user-selectable options
    pub options: WorkspaceKindPodOptions,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, CELSchema)]
pub struct WorkspaceKindServiceAccount {
    /// The ServiceAccount must already exist in the namespace of each Workspace.
    /// This field is immutable
    #[cel_validate(rule = Rule::new("self == oldSelf").message("ServiceAccount 'name' is immutable"))]
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindCullingConfig {
    /// If the culling feature is enabled
    #[serde(default = "default_culling_enabled")]
    pub enabled: bool,
    /// The maximum number of seconds a Workspace can be inactive
    #[serde(default = "default_max_inactive_seconds")]
    #[schemars(range(min = 60))]
    pub max_inactive_seconds: i64,
    /// The probe used to determine if the Workspace is active
    pub activity_probe: ActivityProbe,
}

fn default_culling_enabled() -> bool {
    true
}

fn default_max_inactive_seconds() -> i64 {
    86400
}

/// Exactly one of `exec` or `jupyter`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, CELSchema)]
#[cel_validate(rule = Rule::new("has(self.exec) != has(self.jupyter)").message("must specify exactly one of 'exec' or 'jupyter'"))]
pub struct ActivityProbe {
    /// A command that exits 0 if the Workspace had activity in the last 60 seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ActivityProbeExec>,
    /// Poll the Jupyter `/api/status` endpoint and use its `last_activity` field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jupyter: Option<ActivityProbeJupyter>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ActivityProbeExec {
    #[schemars(length(min = 1))]
    pub command: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, CELSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivityProbeJupyter {
    #[cel_validate(rule = Rule::new("self").message("'lastActivity' must be true"))]
    pub last_activity: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindProbes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, CELSchema)]
pub struct WorkspaceKindVolumeMounts {
    /// Where the home volume of a Workspace is mounted. This field is immutable
    #[schemars(length(min = 2, max = 4096), regex(pattern = r"^/[^/].*$"))]
    #[cel_validate(rule = Rule::new("self == oldSelf").message("mount path of 'home' is immutable"))]
    pub home: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxy {
    /// Strip the connect path from incoming requests before they reach the Workspace.
    /// Only works for applications that serve relative URLs.
    #[serde(default)]
    pub remove_path_prefix: bool,
    /// Header manipulation for incoming requests. `set` and `add` values are templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HeaderOperations>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HeaderOperations {
    /// Overwrite the headers specified by key with the given values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<BTreeMap<String, String>>,
    /// Append the given values to the headers specified by key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add: Option<BTreeMap<String, String>>,
    /// Remove the specified headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindPort {
    /// The image port id this configuration applies to
    pub id: String,
    pub protocol: PortProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<HttpProxy>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum PortProtocol {
    #[default]
    #[serde(rename = "HTTP")]
    Http,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindPodOptions {
    /// Options that determine the container image
    pub image_config: ImageConfig,
    /// Options that determine affinity, nodeSelector, tolerations and resources
    pub pod_config: PodConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct OptionsSpawner {
    /// The id of the value preselected in the Spawner UI
    pub default: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ImageConfig {
    pub spawner: OptionsSpawner,
    #[schemars(length(min = 1))]
    pub values: Vec<ImageConfigValue>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ImageConfigValue {
    pub id: String,
    pub spawner: OptionSpawnerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<OptionRedirect>,
    pub spec: ImageConfigSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfigSpec {
    /// The container image to use
    #[schemars(length(min = 2))]
    pub image: String,
    /// The pull policy for the container image. Defaults to IfNotPresent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<ImagePullPolicy>,
    /// Ports the container listens on
    #[schemars(length(min = 1))]
    pub ports: Vec<ImagePort>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ImagePullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::IfNotPresent => "IfNotPresent",
            ImagePullPolicy::Never => "Never",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImagePort {
    pub id: String,
    #[schemars(length(min = 2, max = 64))]
    pub display_name: String,
    #[schemars(range(min = 1, max = 65535))]
    pub port: i32,
    pub protocol: PortProtocol,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodConfig {
    pub spawner: OptionsSpawner,
    #[schemars(length(min = 1))]
    pub values: Vec<PodConfigValue>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodConfigValue {
    pub id: String,
    pub spawner: OptionSpawnerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<OptionRedirect>,
    pub spec: PodConfigSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    /// Resources of the "main" container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptionSpawnerInfo {
    #[schemars(length(min = 2, max = 128))]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<OptionSpawnerLabel>>,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct OptionSpawnerLabel {
    pub key: String,
    pub value: String,
}

/// Marks an option as superseded by another one of the same list
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptionRedirect {
    pub to: String,
    #[serde(default)]
    pub wait_for_restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<RedirectMessage>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RedirectMessage {
    pub level: RedirectMessageLevel,
    #[schemars(length(min = 2, max = 1024))]
    pub text: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RedirectMessageLevel {
    #[default]
    Info,
    Warning,
    Danger,
}

/// Observed state of a WorkspaceKind
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindStatus {
    /// The number of Workspaces using this WorkspaceKind
    #[serde(default)]
    pub workspaces: i64,
    #[serde(default)]
    pub pod_template_options: PodTemplateOptionsMetrics,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateOptionsMetrics {
    #[serde(default)]
    pub image_config: Vec<OptionMetric>,
    #[serde(default)]
    pub pod_config: Vec<OptionMetric>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct OptionMetric {
    pub id: String,
    /// The number of Workspaces currently using the option
    pub workspaces: i64,
}

impl WorkspaceKind {
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == WORKSPACE_KIND_FINALIZER))
    }

    pub fn image_config_values(&self) -> &[ImageConfigValue] {
        &self.spec.pod_template.options.image_config.values
    }

    pub fn pod_config_values(&self) -> &[PodConfigValue] {
        &self.spec.pod_template.options.pod_config.values
    }

    /// Routing configuration for an image port; `None` when the kind does not route it
    pub fn port_config(&self, port_id: &str) -> Option<&WorkspaceKindPort> {
        self.spec
            .pod_template
            .ports
            .iter()
            .flatten()
            .find(|p| p.id == port_id)
    }

    /// The proxy settings in effect for a port: its own, else the kind-wide ones
    pub fn http_proxy_for(&self, port_id: &str) -> Option<&HttpProxy> {
        self.port_config(port_id)
            .and_then(|p| p.http_proxy.as_ref())
            .or(self.spec.pod_template.http_proxy.as_ref())
    }

    /// True once deletion of the kind has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use k8s_openapi::api::core::v1::{Capabilities, EmptyDirVolumeSource, VolumeMount};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn image_value(id: &str, image: &str, redirect_to: Option<&str>) -> ImageConfigValue {
        ImageConfigValue {
            id: id.into(),
            spawner: OptionSpawnerInfo {
                display_name: format!("JupyterLab {id}"),
                ..Default::default()
            },
            redirect: redirect_to.map(|to| OptionRedirect {
                to: to.into(),
                wait_for_restart: true,
                message: Some(RedirectMessage {
                    level: RedirectMessageLevel::Info,
                    text: format!("{id} is superseded by {to}"),
                }),
            }),
            spec: ImageConfigSpec {
                image: image.into(),
                image_pull_policy: Some(ImagePullPolicy::IfNotPresent),
                ports: vec![ImagePort {
                    id: "jupyterlab".into(),
                    display_name: "JupyterLab".into(),
                    port: 8888,
                    protocol: PortProtocol::Http,
                }],
            },
        }
    }

    fn pod_value(id: &str, cpu: &str, memory: &str) -> PodConfigValue {
        PodConfigValue {
            id: id.into(),
            spawner: OptionSpawnerInfo {
                display_name: id.into(),
                ..Default::default()
            },
            redirect: None,
            spec: PodConfigSpec {
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity(cpu.into())),
                        ("memory".to_string(), Quantity(memory.into())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    /// A JupyterLab kind with one redirected image and three pod sizes
    pub fn jupyterlab_kind(name: &str) -> WorkspaceKind {
        let spec = WorkspaceKindSpec {
            spawner: WorkspaceKindSpawner {
                display_name: "JupyterLab Notebook".into(),
                description: "A Workspace which runs JupyterLab in a Pod".into(),
                icon: WorkspaceKindIcon {
                    url: Some("https://jupyter.org/assets/favicons/apple-touch-icon-152x152.png".into()),
                    config_map: None,
                },
                logo: WorkspaceKindIcon {
                    url: Some("https://upload.wikimedia.org/wikipedia/commons/3/38/Jupyter_logo.svg".into()),
                    config_map: None,
                },
                ..Default::default()
            },
            pod_template: WorkspaceKindPodTemplate {
                pod_metadata: Some(PodMetadata {
                    labels: Some(BTreeMap::from([("my-kind-label".into(), "kind".into())])),
                    annotations: Some(BTreeMap::from([(
                        "my-kind-annotation".into(),
                        "kind".into(),
                    )])),
                }),
                service_account: WorkspaceKindServiceAccount {
                    name: "default-editor".into(),
                },
                volume_mounts: WorkspaceKindVolumeMounts {
                    home: "/home/jovyan".into(),
                },
                ports: Some(vec![WorkspaceKindPort {
                    id: "jupyterlab".into(),
                    protocol: PortProtocol::Http,
                    http_proxy: None,
                }]),
                extra_env: Some(vec![EnvVar {
                    name: "NB_PREFIX".into(),
                    value: Some(r#"{{ httpPathPrefix("jupyterlab") }}"#.into()),
                    value_from: None,
                }]),
                extra_volumes: Some(vec![Volume {
                    name: "dshm".into(),
                    empty_dir: Some(EmptyDirVolumeSource {
                        medium: Some("Memory".into()),
                        size_limit: None,
                    }),
                    ..Default::default()
                }]),
                extra_volume_mounts: Some(vec![VolumeMount {
                    name: "dshm".into(),
                    mount_path: "/dev/shm".into(),
                    ..Default::default()
                }]),
                container_security_context: Some(SecurityContext {
                    allow_privilege_escalation: Some(false),
                    capabilities: Some(Capabilities {
                        drop: Some(vec!["ALL".into()]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                options: WorkspaceKindPodOptions {
                    image_config: ImageConfig {
                        spawner: OptionsSpawner {
                            default: "jupyterlab_scipy_190".into(),
                        },
                        values: vec![
                            image_value(
                                "jupyterlab_scipy_180",
                                "ghcr.io/kubeflow/kubeflow/notebook-servers/jupyter-scipy:v1.8.0",
                                Some("jupyterlab_scipy_190"),
                            ),
                            image_value(
                                "jupyterlab_scipy_190",
                                "ghcr.io/kubeflow/kubeflow/notebook-servers/jupyter-scipy:v1.9.0",
                                None,
                            ),
                        ],
                    },
                    pod_config: PodConfig {
                        spawner: OptionsSpawner {
                            default: "tiny_cpu".into(),
                        },
                        values: vec![
                            pod_value("tiny_cpu", "100m", "128Mi"),
                            pod_value("small_cpu", "1", "2Gi"),
                            pod_value("big_gpu", "4", "16Gi"),
                        ],
                    },
                },
                ..Default::default()
            },
        };
        WorkspaceKind::new(name, spec)
    }
}
