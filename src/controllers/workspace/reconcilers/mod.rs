use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::reflector::Store;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::*;

use crate::controllers::index::{controlled_by_workspace, owned_by};
use crate::quantity::to_milli;
use crate::resources::workspacekinds::ImageConfigSpec;
use crate::resources::workspaces::Workspace;
use crate::template::{connect_path, TemplateError};
use crate::{Error, Result};

pub mod service;
pub mod statefulset;
pub mod virtualservice;

/// Set on every owned object and on the pod template
pub const WORKSPACE_NAME_LABEL: &str = "notebooks.kubeflow.org/workspace-name";
/// Selects the pods of a Workspace's StatefulSet
pub const WORKSPACE_SELECTOR_LABEL: &str = "statefulset";

pub const FIELD_MANAGER: &str = "workspaces-operator";

// length of the random suffix the apiserver appends to a generateName
const GENERATE_NAME_SUFFIX_LEN: usize = 6;

pub const MAX_STATEFULSET_NAME_LEN: usize = 52;
pub const MAX_SERVICE_NAME_LEN: usize = 63;
pub const MAX_VIRTUAL_SERVICE_NAME_LEN: usize = 63;

#[derive(thiserror::Error, Debug)]
pub enum SynthError {
    #[error("duplicate port number {0} in imageConfig")]
    DuplicatePort(i32),

    #[error("failed to render extraEnv {name:?}: {source}")]
    BadEnvTemplate {
        name: String,
        #[source]
        source: TemplateError,
    },

    #[error("failed to render request header {name:?} for port {port_id:?}: {source}")]
    BadHeaderTemplate {
        port_id: String,
        name: String,
        #[source]
        source: TemplateError,
    },
}

/// `generateName` for a child of `workspace_name`, short enough that the random suffix still fits in `max_len`
pub fn generate_name_prefix(workspace_name: &str, max_len: usize) -> String {
    let mut prefix: String = format!("ws-{workspace_name}")
        .chars()
        .take(max_len - GENERATE_NAME_SUFFIX_LEN - 1)
        .collect();
    if !prefix.ends_with('-') {
        prefix.push('-');
    }
    prefix
}

pub fn selector_labels(ws: &Workspace) -> BTreeMap<String, String> {
    BTreeMap::from([
        (WORKSPACE_NAME_LABEL.to_string(), ws.name_any()),
        (WORKSPACE_SELECTOR_LABEL.to_string(), ws.name_any()),
    ])
}

pub fn label_selector(ws: &Workspace) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector_labels(ws)),
        match_expressions: None,
    }
}

/// Metadata for a new child object; the owner reference is added when it is created
pub fn child_meta(ws: &Workspace, max_name_len: usize) -> ObjectMeta {
    ObjectMeta {
        generate_name: Some(generate_name_prefix(&ws.name_any(), max_name_len)),
        namespace: ws.namespace(),
        labels: Some(BTreeMap::from([(
            WORKSPACE_NAME_LABEL.to_string(),
            ws.name_any(),
        )])),
        ..Default::default()
    }
}

/// The `httpPathPrefix` function exposed to templates for this Workspace and image
pub fn http_path_prefix(
    ws: &Workspace,
    image: &ImageConfigSpec,
) -> impl Fn(&str) -> String + Send + Sync + 'static {
    let namespace = ws.namespace().unwrap_or_default();
    let name = ws.name_any();
    let paths: HashMap<String, String> = image
        .ports
        .iter()
        .map(|p| (p.id.clone(), connect_path(&namespace, &name, &p.id)))
        .collect();
    move |port_id: &str| paths.get(port_id).cloned().unwrap_or_default()
}

/// An object the Workspace controller creates and keeps in line with its desired state
pub trait OwnedChild:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + 'static
{
    /// Copy the fields the operator owns from `desired` into `found`.
    /// Returns true if `found` changed.
    fn copy_owned_fields(desired: &Self, found: &mut Self) -> bool;
}

#[derive(Debug)]
pub enum ChildOutcome<K> {
    /// The single child owned by the Workspace, as last written or observed
    Ready(K),
    /// More than one child is owned; their names, sorted
    Multiple(Vec<String>),
    /// Our copy of the child was stale
    Conflict,
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_owned()),
    }
}

/// Children are matched on their controller reference alone, labelled or not
async fn list_owned<K: OwnedChild>(api: &Api<K>, ws: &Workspace) -> Result<Vec<K>> {
    let mut owned: Vec<K> = api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|obj| controlled_by_workspace(obj, &ws.name_any()))
        .collect();
    owned.sort_by_key(|obj| obj.name_any());
    Ok(owned)
}

/// Create the child if the Workspace owns none, bring it in line if it owns exactly one
pub async fn reconcile_child<K: OwnedChild>(
    api: &Api<K>,
    store: &Store<K>,
    ws: &Workspace,
    mut desired: K,
) -> Result<ChildOutcome<K>> {
    let kind = K::kind(&());
    let mut owned: Vec<K> = owned_by(store, ws)
        .into_iter()
        .map(|obj| obj.as_ref().clone())
        .collect();
    if owned.is_empty() {
        // the cache may not have seen a child we created on a previous pass
        owned = list_owned(api, ws).await?;
    }

    match owned.len() {
        0 => {
            let owner = ws
                .controller_owner_ref(&())
                .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
            desired.meta_mut().owner_references = Some(vec![owner]);
            let created = api.create(&post_params(), &desired).await?;
            info!("Created {kind} {}", created.name_any());
            Ok(ChildOutcome::Ready(created))
        }
        1 => {
            let mut found = owned.remove(0);
            if !K::copy_owned_fields(&desired, &mut found) {
                return Ok(ChildOutcome::Ready(found));
            }
            match api.replace(&found.name_any(), &post_params(), &found).await {
                Ok(updated) => {
                    info!("Updated {kind} {}", updated.name_any());
                    Ok(ChildOutcome::Ready(updated))
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    debug!("Conflict while updating {kind} {}, will requeue", found.name_any());
                    Ok(ChildOutcome::Conflict)
                }
                Err(e) => Err(e.into()),
            }
        }
        _ => Ok(ChildOutcome::Multiple(
            owned.iter().map(|obj| obj.name_any()).collect(),
        )),
    }
}

/// Replace `found` with `desired` unless `found` already holds every value `desired` sets.
///
/// Fields defaulted by the API server are not drift.
fn sync<T: Serialize + Clone>(desired: &T, found: &mut T) -> bool {
    if let (Ok(want), Ok(have)) = (serde_json::to_value(desired), serde_json::to_value(&*found)) {
        if covers(&want, &have, false) {
            return false;
        }
    }
    *found = desired.clone();
    true
}

/// True when every value set in `want` is present in `have`; lists must match element for element
fn covers(want: &Value, have: &Value, quantities: bool) -> bool {
    match (want, have) {
        (Value::Null, _) => true,
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, w)| {
            let quantities = quantities || key == "limits" || key == "requests";
            covers(w, have.get(key).unwrap_or(&Value::Null), quantities)
        }),
        (Value::Object(want), Value::Null) => want.values().all(|w| covers(w, &Value::Null, quantities)),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| covers(w, h, quantities))
        }
        (Value::Array(want), Value::Null) => want.is_empty(),
        // zero values are dropped on the way back from the apiserver
        (Value::Bool(false), Value::Null) => true,
        (Value::String(want), Value::Null) => want.is_empty(),
        (Value::Number(want), Value::Null) => want.as_f64() == Some(0.0),
        (Value::String(want), Value::String(have)) if quantities => same_quantity(want, have),
        (want, have) => want == have,
    }
}

// the apiserver rewrites quantities into canonical form
fn same_quantity(want: &str, have: &str) -> bool {
    if want == have {
        return true;
    }
    match (
        to_milli(&Quantity(want.to_string())),
        to_milli(&Quantity(have.to_string())),
    ) {
        (Ok(want), Ok(have)) => want == have,
        _ => false,
    }
}

/// Set the labels `desired` carries on `found`, keeping labels written by others
fn merge_labels(desired: &ObjectMeta, found: &mut ObjectMeta) -> bool {
    let Some(want) = desired.labels.as_ref().filter(|l| !l.is_empty()) else {
        return false;
    };
    let have = found.labels.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in want {
        if have.get(key) != Some(value) {
            have.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}
