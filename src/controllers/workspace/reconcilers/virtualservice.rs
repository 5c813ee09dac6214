use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::controllers::Settings;
use crate::resources::virtualservices::{
    Destination, HeaderOperations, Headers, HttpMatchRequest, HttpRewrite, HttpRoute,
    HttpRouteDestination, PortSelector, StringMatch, VirtualService, VirtualServiceSpec,
};
use crate::resources::workspacekinds::{self, ImageConfigSpec, PortProtocol, WorkspaceKind};
use crate::resources::workspaces::Workspace;
use crate::template::{self, connect_path};

use super::{child_meta, http_path_prefix, merge_labels, sync, OwnedChild, SynthError, MAX_VIRTUAL_SERVICE_NAME_LEN};

fn render_headers(
    ws: &Workspace,
    image: &ImageConfigSpec,
    port_id: &str,
    headers: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, SynthError> {
    headers
        .iter()
        .map(|(name, value)| {
            let rendered = template::render(value, http_path_prefix(ws, image)).map_err(|source| {
                SynthError::BadHeaderTemplate {
                    port_id: port_id.to_string(),
                    name: name.clone(),
                    source,
                }
            })?;
            Ok((name.clone(), rendered))
        })
        .collect()
}

fn request_headers(
    ws: &Workspace,
    image: &ImageConfigSpec,
    port_id: &str,
    ops: &workspacekinds::HeaderOperations,
) -> Result<Option<Headers>, SynthError> {
    let empty = BTreeMap::new();
    let request = HeaderOperations {
        set: render_headers(ws, image, port_id, ops.set.as_ref().unwrap_or(&empty))?,
        add: render_headers(ws, image, port_id, ops.add.as_ref().unwrap_or(&empty))?,
        remove: ops.remove.clone().unwrap_or_default(),
    };
    if request == HeaderOperations::default() {
        return Ok(None);
    }
    Ok(Some(Headers {
        request: Some(request),
    }))
}

/// The desired Istio VirtualService exposing the Workspace's HTTP ports under their connect paths
pub fn virtual_service(
    ws: &Workspace,
    kind: &WorkspaceKind,
    image: &ImageConfigSpec,
    service_name: &str,
    settings: &Settings,
) -> Result<VirtualService, SynthError> {
    let namespace = ws.namespace().unwrap_or_default();
    let name = ws.name_any();
    let host = format!("{service_name}.{namespace}.svc.{}", settings.cluster_domain);

    let mut http = Vec::new();
    for port in &image.ports {
        let routed = kind
            .port_config(&port.id)
            .is_some_and(|p| p.protocol == PortProtocol::Http);
        if !routed {
            continue;
        }
        let prefix = connect_path(&namespace, &name, &port.id);
        let proxy = kind.http_proxy_for(&port.id);
        let rewrite = if proxy.is_some_and(|p| p.remove_path_prefix) {
            "/".to_string()
        } else {
            prefix.clone()
        };
        let headers = match proxy.and_then(|p| p.request_headers.as_ref()) {
            Some(ops) => request_headers(ws, image, &port.id, ops)?,
            None => None,
        };

        http.push(HttpRoute {
            name: Some(port.id.clone()),
            matches: vec![HttpMatchRequest {
                uri: Some(StringMatch {
                    prefix: Some(prefix),
                }),
            }],
            rewrite: Some(HttpRewrite { uri: Some(rewrite) }),
            route: vec![HttpRouteDestination {
                destination: Destination {
                    host: host.clone(),
                    port: u32::try_from(port.port)
                        .ok()
                        .map(|number| PortSelector { number }),
                },
            }],
            headers,
        });
    }

    Ok(VirtualService {
        metadata: child_meta(ws, MAX_VIRTUAL_SERVICE_NAME_LEN),
        spec: VirtualServiceSpec {
            hosts: settings.istio_hosts.clone(),
            gateways: vec![settings.istio_gateway.clone()],
            http,
        },
    })
}

impl OwnedChild for VirtualService {
    fn copy_owned_fields(desired: &Self, found: &mut Self) -> bool {
        let labels = merge_labels(&desired.metadata, &mut found.metadata);
        sync(&desired.spec, &mut found.spec) || labels
    }
}
