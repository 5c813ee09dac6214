use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::resources::{
    workspacekinds::{ImageConfigValue, PodConfigValue},
    workspaces::RedirectStep,
};

/// The two option menus of a WorkspaceKind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionKind {
    ImageConfig,
    PodConfig,
}

impl OptionKind {
    pub fn field_name(self) -> &'static str {
        match self {
            OptionKind::ImageConfig => "imageConfig",
            OptionKind::PodConfig => "podConfig",
        }
    }
}

impl std::fmt::Display for OptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field_name())
    }
}

/// A value of an option menu that may redirect to another value of the same menu
pub trait OptionValue {
    const KIND: OptionKind;

    fn id(&self) -> &str;
    fn redirect_to(&self) -> Option<&str>;
}

impl OptionValue for ImageConfigValue {
    const KIND: OptionKind = OptionKind::ImageConfig;

    fn id(&self) -> &str {
        &self.id
    }

    fn redirect_to(&self) -> Option<&str> {
        self.redirect.as_ref().map(|r| r.to.as_str())
    }
}

impl OptionValue for PodConfigValue {
    const KIND: OptionKind = OptionKind::PodConfig;

    fn id(&self) -> &str {
        &self.id
    }

    fn redirect_to(&self) -> Option<&str> {
        self.redirect.as_ref().map(|r| r.to.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("{kind} with id {id:?} not found")]
    UnknownOption { kind: OptionKind, id: String },

    #[error("{kind} with id {id:?} has a circular redirect")]
    RedirectCycle {
        kind: OptionKind,
        id: String,
        cycle: Vec<String>,
    },

    #[error("{kind} with id {target:?} not found, was redirected from {source_id:?}")]
    MissingRedirectTarget {
        kind: OptionKind,
        target: String,
        source_id: String,
    },
}

/// The selected option and where its redirects lead
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<'a, V> {
    pub current: &'a V,
    pub desired: &'a V,
    pub chain: Vec<RedirectStep>,
}

impl<V: OptionValue> Resolution<'_, V> {
    pub fn is_redirected(&self) -> bool {
        self.current.id() != self.desired.id()
    }
}

/// Find `selected` among `values` and follow its redirects to the terminal value.
pub fn resolve<'a, V: OptionValue>(
    selected: &str,
    values: &'a [V],
) -> Result<Resolution<'a, V>, OptionError> {
    let by_id: HashMap<&str, &V> = values.iter().map(|v| (v.id(), v)).collect();

    let current = *by_id.get(selected).ok_or_else(|| OptionError::UnknownOption {
        kind: V::KIND,
        id: selected.to_string(),
    })?;

    let mut desired = current;
    let mut chain = Vec::new();
    let mut visited = vec![current.id()];
    while let Some(to) = desired.redirect_to() {
        if let Some(pos) = visited.iter().position(|id| *id == to) {
            let mut cycle: Vec<String> = visited[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(to.to_string());
            return Err(OptionError::RedirectCycle {
                kind: V::KIND,
                id: desired.id().to_string(),
                cycle,
            });
        }
        let next = *by_id
            .get(to)
            .ok_or_else(|| OptionError::MissingRedirectTarget {
                kind: V::KIND,
                target: to.to_string(),
                source_id: desired.id().to_string(),
            })?;
        chain.push(RedirectStep {
            source: desired.id().to_string(),
            target: next.id().to_string(),
        });
        visited.push(next.id());
        desired = next;
    }

    Ok(Resolution {
        current,
        desired,
        chain,
    })
}

/// Redirect edges of an option menu, `id -> to`
pub fn redirect_map<V: OptionValue>(values: &[V]) -> HashMap<&str, &str> {
    values
        .iter()
        .filter_map(|v| v.redirect_to().map(|to| (v.id(), to)))
        .collect()
}

/// Walk the redirect graph from `start` and return the first cycle reachable from it.
///
/// Nodes proven to lead to a dead end are recorded in `safe` so later walks stop early.
/// The returned cycle starts and ends with the same id.
pub fn detect_cycle<'a>(
    start: &'a str,
    safe: &mut HashSet<&'a str>,
    edges: &HashMap<&'a str, &'a str>,
) -> Option<Vec<String>> {
    let mut path: Vec<&'a str> = Vec::new();
    let mut node = start;
    loop {
        if safe.contains(node) {
            break;
        }
        if let Some(pos) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        path.push(node);
        match edges.get(node) {
            Some(next) => node = next,
            None => break,
        }
    }
    safe.extend(path);
    None
}
