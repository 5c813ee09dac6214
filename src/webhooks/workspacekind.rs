use std::collections::{HashMap, HashSet};

use kube::api::{Api, ListParams};
use kube::core::admission::{AdmissionRequest, Operation};
use kube::{Client, ResourceExt};
use tracing::*;

use crate::controllers::workspacekind::usage_status;
use crate::options::{detect_cycle, redirect_map, OptionKind, OptionValue};
use crate::quantity::{normalize_pod_config_spec, ParseError};
use crate::resources::workspacekinds::{
    ImageConfigValue, PodConfigValue, WorkspaceKind, WorkspaceKindStatus,
};
use crate::resources::workspaces::Workspace;
use crate::template;

use super::{Denial, FieldErrors};

/// Admission checks for WorkspaceKinds
#[derive(Clone)]
pub struct WorkspaceKindValidator {
    workspaces: Api<Workspace>,
}

impl WorkspaceKindValidator {
    pub fn new(client: Client) -> Self {
        Self {
            workspaces: Api::all(client),
        }
    }

    pub async fn validate(&self, req: &AdmissionRequest<WorkspaceKind>) -> Result<(), Denial> {
        match req.operation {
            Operation::Create => {
                let kind = req
                    .object
                    .as_ref()
                    .ok_or_else(|| Denial::bad_request("expected a WorkspaceKind object"))?;
                debug!("validating WorkspaceKind create");
                validate_create(kind).into_result::<WorkspaceKind>(&req.name)
            }
            Operation::Update => {
                let (Some(kind), Some(old)) = (req.object.as_ref(), req.old_object.as_ref()) else {
                    return Err(Denial::bad_request(
                        "expected a WorkspaceKind object and its previous version",
                    ));
                };
                debug!("validating WorkspaceKind update");
                self.validate_update(old, kind).await
            }
            Operation::Delete => {
                let kind = req
                    .old_object
                    .as_ref()
                    .ok_or_else(|| Denial::bad_request("expected the deleted WorkspaceKind object"))?;
                debug!("validating WorkspaceKind delete");
                validate_delete(kind)
            }
            _ => Ok(()),
        }
    }

    async fn validate_update(&self, old: &WorkspaceKind, kind: &WorkspaceKind) -> Result<(), Denial> {
        let name = kind.name_any();
        let mut usage = LazyUsage::new(&self.workspaces, old);
        let mut errors = FieldErrors::default();

        if old.spec.pod_template.extra_env != kind.spec.pod_template.extra_env {
            errors.extend(validate_extra_env(kind));
        }

        let images = diff_menu(old.image_config_values(), kind.image_config_values())
            .map_err(|e| e.into_denial(&name))?;
        let pods = diff_menu(old.pod_config_values(), kind.pod_config_values())
            .map_err(|e| e.into_denial(&name))?;

        let old_options = &old.spec.pod_template.options;
        let options = &kind.spec.pod_template.options;
        if images.membership_changed() || old_options.image_config.spawner != options.image_config.spawner {
            errors.extend(validate_default(
                &options.image_config.spawner.default,
                kind.image_config_values(),
            ));
        }
        if pods.membership_changed() || old_options.pod_config.spawner != options.pod_config.spawner {
            errors.extend(validate_default(
                &options.pod_config.spawner.default,
                kind.pod_config_values(),
            ));
        }

        for value in kind.image_config_values() {
            let id = value.id.as_str();
            if images.added.contains(&id) || images.changed.contains(&id) {
                errors.extend(validate_ports(value));
            }
        }

        errors.extend(usage.in_use_errors(OptionKind::ImageConfig, &images).await?);
        errors.extend(usage.in_use_errors(OptionKind::PodConfig, &pods).await?);

        if images.redirects_dirty() {
            errors.extend(validate_redirects(kind.image_config_values()));
        }
        if pods.redirects_dirty() {
            errors.extend(validate_redirects(kind.pod_config_values()));
        }

        errors.into_result::<WorkspaceKind>(&name)
    }
}

fn values_path(option: OptionKind, id: &str) -> String {
    format!("spec.podTemplate.options.{option}.values[{id}]")
}

/// Every check applies to a new kind
pub fn validate_create(kind: &WorkspaceKind) -> FieldErrors {
    let options = &kind.spec.pod_template.options;
    let mut errors = validate_extra_env(kind);
    errors.extend(validate_default(
        &options.image_config.spawner.default,
        kind.image_config_values(),
    ));
    errors.extend(validate_default(
        &options.pod_config.spawner.default,
        kind.pod_config_values(),
    ));
    for value in kind.image_config_values() {
        errors.extend(validate_ports(value));
    }
    errors.extend(validate_redirects(kind.image_config_values()));
    errors.extend(validate_redirects(kind.pod_config_values()));
    errors
}

/// A kind in use, or still protected by its finalizer, cannot be deleted
pub fn validate_delete(kind: &WorkspaceKind) -> Result<(), Denial> {
    let name = kind.name_any();
    let used = kind.status.as_ref().map(|s| s.workspaces).unwrap_or_default();
    if used > 0 {
        return Err(Denial::conflict::<WorkspaceKind>(
            &name,
            format!("WorkspaceKind is used by {used} workspace(s)"),
        ));
    }
    // the status may lag behind a reconcile that just added a reference
    if kind.has_finalizer() {
        return Err(Denial::conflict::<WorkspaceKind>(
            &name,
            "WorkspaceKind has protection finalizer, indicating one or more workspaces are still using it",
        ));
    }
    Ok(())
}

fn validate_extra_env(kind: &WorkspaceKind) -> FieldErrors {
    let mut errors = FieldErrors::default();
    for env in kind.spec.pod_template.extra_env.iter().flatten() {
        let Some(value) = env.value.as_deref().filter(|v| !v.is_empty()) else {
            continue;
        };
        if let Err(e) = template::validate(value) {
            errors.push(
                format!("spec.podTemplate.extraEnv[{}].value", env.name),
                value,
                e.to_string(),
            );
        }
    }
    errors
}

fn validate_default<V: OptionValue>(default: &str, values: &[V]) -> FieldErrors {
    let mut errors = FieldErrors::default();
    if !values.iter().any(|v| v.id() == default) {
        let option = V::KIND;
        errors.push(
            format!("spec.podTemplate.options.{option}.spawner.default"),
            default,
            format!("default {option} {default:?} not found"),
        );
    }
    errors
}

fn validate_ports(value: &ImageConfigValue) -> FieldErrors {
    let mut errors = FieldErrors::default();
    let mut seen = HashSet::new();
    for port in &value.spec.ports {
        if !seen.insert(port.port) {
            errors.push(
                format!(
                    "{}.spec.ports[{}].port",
                    values_path(OptionKind::ImageConfig, &value.id),
                    port.id
                ),
                port.port,
                format!("port {} is defined more than once", port.port),
            );
        }
    }
    errors
}

/// Redirect targets must exist and the redirect graph must be acyclic.
///
/// Scanning stops at the first cycle.
fn validate_redirects<V: OptionValue>(values: &[V]) -> FieldErrors {
    let option = V::KIND;
    let ids: HashSet<&str> = values.iter().map(|v| v.id()).collect();
    let edges = redirect_map(values);
    let mut safe = HashSet::new();
    let mut errors = FieldErrors::default();

    for value in values {
        let Some(to) = value.redirect_to() else {
            continue;
        };
        let path = format!("{}.redirect.to", values_path(option, value.id()));
        if let Some(cycle) = detect_cycle(value.id(), &mut safe, &edges) {
            errors.push(
                path,
                to,
                format!("{option} redirect cycle detected: [{}]", cycle.join(" ")),
            );
            break;
        }
        if !ids.contains(to) {
            errors.push(path, to, format!("target {option} {to:?} does not exist"));
        }
    }
    errors
}

/// An option value whose spec can be compared across versions
trait MenuValue: OptionValue {
    fn spec_changed(old: &Self, new: &Self) -> Result<bool, SpecError>;
}

#[derive(Debug)]
enum SpecError {
    New(ParseError),
    Old(ParseError),
}

impl MenuValue for ImageConfigValue {
    fn spec_changed(old: &Self, new: &Self) -> Result<bool, SpecError> {
        Ok(old.spec != new.spec)
    }
}

impl MenuValue for PodConfigValue {
    fn spec_changed(old: &Self, new: &Self) -> Result<bool, SpecError> {
        let new = normalize_pod_config_spec(&new.spec).map_err(SpecError::New)?;
        let old = normalize_pod_config_spec(&old.spec).map_err(SpecError::Old)?;
        Ok(old != new)
    }
}

#[derive(Debug)]
struct DiffError<'a> {
    option: OptionKind,
    id: &'a str,
    error: SpecError,
}

impl DiffError<'_> {
    fn into_denial(self, name: &str) -> Denial {
        let DiffError { option, id, error } = self;
        match error {
            SpecError::New(e) => {
                let mut errors = FieldErrors::default();
                errors.push_internal(
                    format!("{}.spec", values_path(option, id)),
                    format!("failed to normalize {option} spec: {e}"),
                );
                Denial::invalid::<WorkspaceKind>(name, errors)
            }
            SpecError::Old(e) => Denial::internal(format!(
                "old {option} spec of {id:?} could not be normalized: {e}"
            )),
        }
    }
}

/// How one option menu changed in an update
#[derive(Debug, Default, PartialEq)]
struct MenuDiff<'a> {
    added: Vec<&'a str>,
    /// present before and after, with a different spec
    changed: Vec<&'a str>,
    removed: Vec<&'a str>,
    redirects_changed: bool,
}

impl MenuDiff<'_> {
    fn membership_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    fn redirects_dirty(&self) -> bool {
        self.membership_changed() || self.redirects_changed
    }
}

fn diff_menu<'a, V: MenuValue>(old: &'a [V], new: &'a [V]) -> Result<MenuDiff<'a>, DiffError<'a>> {
    let old_by_id: HashMap<&str, &V> = old.iter().map(|v| (v.id(), v)).collect();
    let new_ids: HashSet<&str> = new.iter().map(|v| v.id()).collect();
    let mut diff = MenuDiff::default();

    for value in new {
        let id = value.id();
        let Some(previous) = old_by_id.get(id) else {
            diff.added.push(id);
            continue;
        };
        if previous.redirect_to() != value.redirect_to() {
            diff.redirects_changed = true;
        }
        let changed = V::spec_changed(previous, value).map_err(|error| DiffError {
            option: V::KIND,
            id,
            error,
        })?;
        if changed {
            diff.changed.push(id);
        }
    }
    diff.removed = old
        .iter()
        .map(|v| v.id())
        .filter(|id| !new_ids.contains(id))
        .collect();
    Ok(diff)
}

/// Per-option usage of the stored kind, listed from the cluster on first use only
struct LazyUsage<'a> {
    workspaces: &'a Api<Workspace>,
    kind: &'a WorkspaceKind,
    status: Option<WorkspaceKindStatus>,
}

impl<'a> LazyUsage<'a> {
    fn new(workspaces: &'a Api<Workspace>, kind: &'a WorkspaceKind) -> Self {
        Self {
            workspaces,
            kind,
            status: None,
        }
    }

    async fn count(&mut self, option: OptionKind, id: &str) -> Result<i64, Denial> {
        let failed = |e: &dyn std::fmt::Display| {
            Denial::internal(format!(
                "failed to get usage count for {option} with id {id:?}: {e}"
            ))
        };
        let status = match self.status.take() {
            Some(status) => status,
            None => {
                let name = self.kind.name_any();
                let list = self
                    .workspaces
                    .list(&ListParams::default())
                    .await
                    .map_err(|e| failed(&e))?;
                debug!("listed {} Workspaces to count usage of \"{name}\"", list.items.len());
                usage_status(self.kind, list.items.iter().filter(|ws| ws.spec.kind == name))
            }
        };
        let metrics = match option {
            OptionKind::ImageConfig => &status.pod_template_options.image_config,
            OptionKind::PodConfig => &status.pod_template_options.pod_config,
        };
        let count = metrics.iter().find(|m| m.id == id).map(|m| m.workspaces);
        self.status = Some(status);
        count.ok_or_else(|| failed(&format!("unknown {option} id")))
    }

    async fn in_use_errors(&mut self, option: OptionKind, diff: &MenuDiff<'_>) -> Result<FieldErrors, Denial> {
        let mut errors = FieldErrors::default();
        for (ids, verb) in [(&diff.changed, "changed"), (&diff.removed, "removed")] {
            for id in ids {
                if self.count(option, id).await? > 0 {
                    errors.push(
                        values_path(option, id),
                        *id,
                        format!("{option} value {id:?} is in use and cannot be {verb}"),
                    );
                }
            }
        }
        Ok(errors)
    }
}
