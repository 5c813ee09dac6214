use std::collections::HashSet;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::resources::workspacekinds::ImageConfigSpec;
use crate::resources::workspaces::Workspace;

use super::statefulset::port_name;
use super::{child_meta, merge_labels, selector_labels, sync, OwnedChild, SynthError, MAX_SERVICE_NAME_LEN};

/// The desired ClusterIP Service in front of the Workspace's pod
pub fn service(ws: &Workspace, image: &ImageConfigSpec) -> Result<Service, SynthError> {
    let mut seen = HashSet::new();
    let ports = image
        .ports
        .iter()
        .map(|p| {
            if !seen.insert(p.port) {
                return Err(SynthError::DuplicatePort(p.port));
            }
            Ok(ServicePort {
                name: Some(port_name(p.port)),
                port: p.port,
                target_port: Some(IntOrString::Int(p.port)),
                protocol: Some("TCP".into()),
                ..Default::default()
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Service {
        metadata: child_meta(ws, MAX_SERVICE_NAME_LEN),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(selector_labels(ws)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}

impl OwnedChild for Service {
    fn copy_owned_fields(desired: &Self, found: &mut Self) -> bool {
        let mut changed = merge_labels(&desired.metadata, &mut found.metadata);
        let (Some(desired_spec), Some(found_spec)) = (desired.spec.as_ref(), found.spec.as_mut())
        else {
            return sync(&desired.spec, &mut found.spec) || changed;
        };
        changed |= sync(&desired_spec.ports, &mut found_spec.ports);
        changed |= sync(&desired_spec.selector, &mut found_spec.selector);
        changed |= sync(&desired_spec.type_, &mut found_spec.type_);
        changed
    }
}
