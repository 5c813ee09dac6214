use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::resources::workspacekinds::{
    ImageConfigSpec, ImagePullPolicy, PodConfigSpec, PodMetadata, WorkspaceKind,
};
use crate::resources::workspaces::Workspace;
use crate::template;

use super::{
    child_meta, http_path_prefix, label_selector, merge_labels, selector_labels, sync, OwnedChild,
    SynthError, MAX_STATEFULSET_NAME_LEN,
};

pub const MAIN_CONTAINER: &str = "main";

/// Name of the container port (and service port) serving `port`
pub fn port_name(port: i32) -> String {
    format!("http-{port}")
}

fn merge_metadata(kind: Option<&PodMetadata>, ws: Option<&PodMetadata>) -> PodMetadata {
    let mut labels = BTreeMap::new();
    let mut annotations = BTreeMap::new();
    for meta in [kind, ws].into_iter().flatten() {
        labels.extend(meta.labels.iter().flatten().map(|(k, v)| (k.clone(), v.clone())));
        annotations.extend(
            meta.annotations
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
    PodMetadata {
        labels: Some(labels),
        annotations: Some(annotations),
    }
}

fn container_ports(image: &ImageConfigSpec) -> Result<Vec<ContainerPort>, SynthError> {
    let mut seen = HashSet::new();
    image
        .ports
        .iter()
        .map(|p| {
            if !seen.insert(p.port) {
                return Err(SynthError::DuplicatePort(p.port));
            }
            Ok(ContainerPort {
                name: Some(port_name(p.port)),
                container_port: p.port,
                protocol: Some("TCP".into()),
                ..Default::default()
            })
        })
        .collect()
}

fn env(ws: &Workspace, kind: &WorkspaceKind, image: &ImageConfigSpec) -> Result<Vec<EnvVar>, SynthError> {
    let extra_env = kind.spec.pod_template.extra_env.iter().flatten();
    let mut out = Vec::new();
    for var in extra_env {
        let mut var = var.clone();
        if let Some(value) = var.value.as_deref() {
            let rendered = template::render(value, http_path_prefix(ws, image)).map_err(|source| {
                SynthError::BadEnvTemplate {
                    name: var.name.clone(),
                    source,
                }
            })?;
            var.value = Some(rendered);
        }
        out.push(var);
    }
    Ok(out)
}

/// Volumes and mounts of the main container, skipping duplicate mount paths and volume names
#[derive(Default)]
struct Volumes {
    volumes: Vec<Volume>,
    mounts: Vec<VolumeMount>,
}

impl Volumes {
    fn has_volume(&self, name: &str) -> bool {
        self.volumes.iter().any(|v| v.name == name)
    }

    fn has_mount_path(&self, path: &str) -> bool {
        self.mounts.iter().any(|m| m.mount_path == path)
    }

    fn add(&mut self, volume: Volume, mount: VolumeMount) {
        if self.has_mount_path(&mount.mount_path) {
            return;
        }
        self.volumes.push(volume);
        self.mounts.push(mount);
    }
}

fn volumes(ws: &Workspace, kind: &WorkspaceKind) -> Volumes {
    let mut out = Volumes::default();
    let ws_volumes = &ws.spec.pod_template.volumes;

    if let Some(home) = ws_volumes.home.as_deref() {
        out.add(
            Volume {
                name: "home-volume".into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: home.into(),
                    read_only: None,
                }),
                ..Default::default()
            },
            VolumeMount {
                name: "home-volume".into(),
                mount_path: kind.spec.pod_template.volume_mounts.home.clone(),
                ..Default::default()
            },
        );
    }

    for (i, data) in ws_volumes.data.iter().enumerate() {
        let name = format!("data-volume-{i}");
        out.add(
            Volume {
                name: name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: data.pvc_name.clone(),
                    read_only: Some(data.read_only),
                }),
                ..Default::default()
            },
            VolumeMount {
                name,
                mount_path: data.mount_path.clone(),
                read_only: Some(data.read_only),
                ..Default::default()
            },
        );
    }

    for (i, secret) in ws_volumes.secrets.iter().enumerate() {
        let name = format!("secret-volume-{i}");
        out.add(
            Volume {
                name: name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.secret_name.clone()),
                    default_mode: secret.default_mode,
                    ..Default::default()
                }),
                ..Default::default()
            },
            VolumeMount {
                name,
                mount_path: secret.mount_path.clone(),
                ..Default::default()
            },
        );
    }

    for volume in kind.spec.pod_template.extra_volumes.iter().flatten() {
        if !out.has_volume(&volume.name) {
            out.volumes.push(volume.clone());
        }
    }

    for mount in kind.spec.pod_template.extra_volume_mounts.iter().flatten() {
        if !out.has_mount_path(&mount.mount_path) && out.has_volume(&mount.name) {
            out.mounts.push(mount.clone());
        }
    }

    out
}

/// The desired StatefulSet running the Workspace's pod
pub fn statefulset(
    ws: &Workspace,
    kind: &WorkspaceKind,
    image: &ImageConfigSpec,
    pod: &PodConfigSpec,
) -> Result<StatefulSet, SynthError> {
    let kind_template = &kind.spec.pod_template;

    let mut pod_metadata = merge_metadata(
        kind_template.pod_metadata.as_ref(),
        ws.spec.pod_template.pod_metadata.as_ref(),
    );
    pod_metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(selector_labels(ws));

    let probes = kind_template.probes.clone().unwrap_or_default();
    let Volumes { volumes, mounts } = volumes(ws, kind);

    let container = Container {
        name: MAIN_CONTAINER.into(),
        image: Some(image.image.clone()),
        image_pull_policy: Some(
            image
                .image_pull_policy
                .unwrap_or(ImagePullPolicy::IfNotPresent)
                .as_str()
                .into(),
        ),
        ports: Some(container_ports(image)?),
        env: Some(env(ws, kind, image)?),
        resources: pod.resources.clone(),
        startup_probe: probes.startup_probe,
        liveness_probe: probes.liveness_probe,
        readiness_probe: probes.readiness_probe,
        security_context: kind_template.container_security_context.clone(),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    Ok(StatefulSet {
        metadata: child_meta(ws, MAX_STATEFULSET_NAME_LEN),
        spec: Some(StatefulSetSpec {
            replicas: Some(if ws.spec.paused { 0 } else { 1 }),
            selector: label_selector(ws),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: pod_metadata.labels,
                    annotations: pod_metadata.annotations,
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: pod.affinity.clone(),
                    node_selector: pod.node_selector.clone(),
                    tolerations: pod.tolerations.clone(),
                    security_context: kind_template.security_context.clone(),
                    service_account_name: Some(kind_template.service_account.name.clone()),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".into()),
                rolling_update: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

impl OwnedChild for StatefulSet {
    fn copy_owned_fields(desired: &Self, found: &mut Self) -> bool {
        let mut changed = merge_labels(&desired.metadata, &mut found.metadata);
        let (Some(desired_spec), Some(found_spec)) = (desired.spec.as_ref(), found.spec.as_mut())
        else {
            return sync(&desired.spec, &mut found.spec) || changed;
        };
        changed |= sync(&desired_spec.replicas, &mut found_spec.replicas);
        changed |= sync(&desired_spec.selector, &mut found_spec.selector);
        changed |= sync(&desired_spec.template, &mut found_spec.template);
        changed |= sync(&desired_spec.update_strategy, &mut found_spec.update_strategy);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::workspace::reconcilers::{WORKSPACE_NAME_LABEL, WORKSPACE_SELECTOR_LABEL};
    use crate::resources::workspacekinds::{fixtures::jupyterlab_kind, ImagePort, PortProtocol};
    use crate::resources::workspaces::{fixtures::workspace, PodSecretMount, PodVolumeMount};
    use k8s_openapi::api::apps::v1::RollingUpdateStatefulSetStrategy;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn build(ws: &Workspace, kind: &WorkspaceKind) -> Result<StatefulSet, SynthError> {
        let image = &kind.image_config_values()[0].spec;
        let pod = &kind.pod_config_values()[0].spec;
        statefulset(ws, kind, image, pod)
    }

    fn main_container(sts: &StatefulSet) -> &Container {
        &sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    fn pod_spec(sts: &StatefulSet) -> &PodSpec {
        sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    #[test]
    fn replicas_follow_pause() {
        let kind = jupyterlab_kind("jupyterlab");
        let mut ws = workspace("default", "jupyter", "jupyterlab");
        assert_eq!(build(&ws, &kind).unwrap().spec.unwrap().replicas, Some(1));
        ws.spec.paused = true;
        assert_eq!(build(&ws, &kind).unwrap().spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn pod_metadata_merges_with_workspace_winning() {
        let kind = jupyterlab_kind("jupyterlab");
        let mut ws = workspace("default", "jupyter", "jupyterlab");
        ws.spec.pod_template.pod_metadata = Some(PodMetadata {
            labels: Some(BTreeMap::from([
                ("my-kind-label".into(), "workspace".into()),
                (WORKSPACE_SELECTOR_LABEL.into(), "sneaky".into()),
            ])),
            annotations: None,
        });

        let sts = build(&ws, &kind).unwrap();
        let meta = sts.spec.unwrap().template.metadata.unwrap();
        let labels = meta.labels.unwrap();
        assert_eq!(labels["my-kind-label"], "workspace");
        assert_eq!(labels[WORKSPACE_SELECTOR_LABEL], "jupyter");
        assert_eq!(labels[WORKSPACE_NAME_LABEL], "jupyter");
        assert_eq!(meta.annotations.unwrap()["my-kind-annotation"], "kind");
    }

    #[test]
    fn main_container_is_built_from_options() {
        let kind = jupyterlab_kind("jupyterlab");
        let ws = workspace("default", "jupyter", "jupyterlab");
        let sts = build(&ws, &kind).unwrap();
        let container = main_container(&sts);

        assert_eq!(container.name, "main");
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/kubeflow/kubeflow/notebook-servers/jupyter-scipy:v1.8.0")
        );
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        let ports = container.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("http-8888"));
        assert_eq!(ports[0].container_port, 8888);
        assert_eq!(
            container.resources.as_ref().unwrap().requests.as_ref().unwrap()["cpu"].0,
            "100m"
        );
        assert_eq!(
            pod_spec(&sts).service_account_name.as_deref(),
            Some("default-editor")
        );
    }

    #[test]
    fn env_values_are_rendered() {
        let kind = jupyterlab_kind("jupyterlab");
        let ws = workspace("team-a", "jupyter", "jupyterlab");
        let sts = build(&ws, &kind).unwrap();
        let env = main_container(&sts).env.as_ref().unwrap();
        assert_eq!(env[0].name, "NB_PREFIX");
        assert_eq!(
            env[0].value.as_deref(),
            Some("/workspace/team-a/jupyter/jupyterlab/")
        );
    }

    #[test]
    fn bad_env_template_fails() {
        let mut kind = jupyterlab_kind("jupyterlab");
        kind.spec.pod_template.extra_env.as_mut().unwrap()[0].value =
            Some("{{ httpPathPrefix(".into());
        let ws = workspace("default", "jupyter", "jupyterlab");
        let err = build(&ws, &kind).unwrap_err();
        assert!(matches!(err, SynthError::BadEnvTemplate { ref name, .. } if name == "NB_PREFIX"));
    }

    #[test]
    fn duplicate_ports_fail() {
        let mut kind = jupyterlab_kind("jupyterlab");
        kind.spec.pod_template.options.image_config.values[0]
            .spec
            .ports
            .push(ImagePort {
                id: "other".into(),
                display_name: "Other".into(),
                port: 8888,
                protocol: PortProtocol::Http,
            });
        let ws = workspace("default", "jupyter", "jupyterlab");
        let err = build(&ws, &kind).unwrap_err();
        assert!(matches!(err, SynthError::DuplicatePort(8888)));
        assert_eq!(err.to_string(), "duplicate port number 8888 in imageConfig");
    }

    #[test]
    fn volumes_are_composed_in_order_without_duplicates() {
        let kind = jupyterlab_kind("jupyterlab");
        let mut ws = workspace("default", "jupyter", "jupyterlab");
        ws.spec.pod_template.volumes.data.push(PodVolumeMount {
            pvc_name: "shadowed".into(),
            mount_path: "/home/jovyan".into(),
            read_only: false,
        });
        ws.spec.pod_template.volumes.secrets.push(PodSecretMount {
            secret_name: "creds".into(),
            mount_path: "/secrets/creds".into(),
            default_mode: Some(0o420),
        });

        let sts = build(&ws, &kind).unwrap();
        let names: Vec<_> = pod_spec(&sts)
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["home-volume", "data-volume-0", "secret-volume-0", "dshm"]
        );

        let mounts: Vec<_> = main_container(&sts)
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| (m.name.as_str(), m.mount_path.as_str()))
            .collect();
        assert_eq!(
            mounts,
            vec![
                ("home-volume", "/home/jovyan"),
                ("data-volume-0", "/data/my-data"),
                ("secret-volume-0", "/secrets/creds"),
                ("dshm", "/dev/shm"),
            ]
        );
    }

    #[test]
    fn extra_mounts_need_a_volume_and_a_free_path() {
        let mut kind = jupyterlab_kind("jupyterlab");
        kind.spec
            .pod_template
            .extra_volume_mounts
            .as_mut()
            .unwrap()
            .extend([
                VolumeMount {
                    name: "missing".into(),
                    mount_path: "/missing".into(),
                    ..Default::default()
                },
                VolumeMount {
                    name: "dshm".into(),
                    mount_path: "/data/my-data".into(),
                    ..Default::default()
                },
            ]);
        let ws = workspace("default", "jupyter", "jupyterlab");
        let sts = build(&ws, &kind).unwrap();
        let paths: Vec<_> = main_container(&sts)
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert_eq!(paths, vec!["/home/jovyan", "/data/my-data", "/dev/shm"]);
    }

    #[test]
    fn drift_is_limited_to_owned_fields() {
        let kind = jupyterlab_kind("jupyterlab");
        let ws = workspace("default", "jupyter", "jupyterlab");
        let desired = build(&ws, &kind).unwrap();

        let mut found = desired.clone();
        found.metadata.name = Some("ws-jupyter-abcde".into());
        found.spec.as_mut().unwrap().revision_history_limit = Some(3);
        assert!(!StatefulSet::copy_owned_fields(&desired, &mut found));

        found.spec.as_mut().unwrap().replicas = Some(0);
        assert!(StatefulSet::copy_owned_fields(&desired, &mut found));
        assert_eq!(found.spec.as_ref().unwrap().replicas, Some(1));
        assert_eq!(found.spec.as_ref().unwrap().revision_history_limit, Some(3));
        assert_eq!(found.metadata.name.as_deref(), Some("ws-jupyter-abcde"));
    }

    /// What the apiserver hands back after defaulting `desired`
    fn defaulted(desired: &StatefulSet) -> StatefulSet {
        let mut found = desired.clone();
        found.metadata.name = Some("ws-jupyter-abcde".into());
        let spec = found.spec.as_mut().unwrap();
        spec.update_strategy = Some(StatefulSetUpdateStrategy {
            type_: Some("RollingUpdate".into()),
            rolling_update: Some(RollingUpdateStatefulSetStrategy {
                partition: Some(0),
                max_unavailable: None,
            }),
        });
        spec.pod_management_policy = Some("OrderedReady".into());
        let pod = spec.template.spec.as_mut().unwrap();
        pod.restart_policy = Some("Always".into());
        pod.dns_policy = Some("ClusterFirst".into());
        pod.termination_grace_period_seconds = Some(30);
        // readOnly: false is omitted
        pod.volumes.as_mut().unwrap()[1]
            .persistent_volume_claim
            .as_mut()
            .unwrap()
            .read_only = None;
        let container = &mut pod.containers[0];
        container.volume_mounts.as_mut().unwrap()[1].read_only = None;
        container.termination_message_path = Some("/dev/termination-log".into());
        container.termination_message_policy = Some("File".into());
        // canonical forms of 100m and 128Mi
        container.resources.as_mut().unwrap().requests = Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("0.1".into())),
            ("memory".to_string(), Quantity("134217728".into())),
        ]));
        found
    }

    #[test]
    fn server_defaults_are_not_drift() {
        let kind = jupyterlab_kind("jupyterlab");
        let ws = workspace("default", "jupyter", "jupyterlab");
        let desired = build(&ws, &kind).unwrap();

        let mut found = defaulted(&desired);
        let before = found.clone();
        assert!(!StatefulSet::copy_owned_fields(&desired, &mut found));
        assert_eq!(found, before);
    }

    #[test]
    fn drift_under_defaults_is_still_seen() {
        let kind = jupyterlab_kind("jupyterlab");
        let ws = workspace("default", "jupyter", "jupyterlab");
        let desired = build(&ws, &kind).unwrap();

        let mut found = defaulted(&desired);
        found.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].image =
            Some("ghcr.io/kubeflow/kubeflow/notebook-servers/jupyter-scipy:v1.9.0".into());
        assert!(StatefulSet::copy_owned_fields(&desired, &mut found));
        assert_eq!(main_container(&found).image, main_container(&desired).image);

        // a removed volume shortens the list
        let mut found = defaulted(&desired);
        let mut fewer = desired.clone();
        fewer.spec.as_mut().unwrap().template.spec.as_mut().unwrap().volumes.as_mut().unwrap().pop();
        assert!(StatefulSet::copy_owned_fields(&fewer, &mut found));
    }

    #[test]
    fn foreign_labels_survive_updates() {
        let kind = jupyterlab_kind("jupyterlab");
        let ws = workspace("default", "jupyter", "jupyterlab");
        let desired = build(&ws, &kind).unwrap();

        let mut found = defaulted(&desired);
        found.metadata.labels = Some(BTreeMap::from([(
            "app.kubernetes.io/managed-by".to_string(),
            "someone-else".to_string(),
        )]));
        assert!(StatefulSet::copy_owned_fields(&desired, &mut found));
        let labels = found.metadata.labels.unwrap();
        assert_eq!(labels["app.kubernetes.io/managed-by"], "someone-else");
        assert_eq!(labels[WORKSPACE_NAME_LABEL], "jupyter");
    }
}
