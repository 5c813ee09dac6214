use std::collections::HashMap;

use crate::resources::workspacekinds::{
    OptionMetric, PodTemplateOptionsMetrics, WorkspaceKind, WorkspaceKindStatus,
};
use crate::resources::workspaces::Workspace;

pub mod controller;
pub use controller::{run, set_finalizer};

/// Workspaces using each option of a menu, in declaration order
fn option_metrics<'a>(
    ids: impl Iterator<Item = &'a str>,
    selected: impl Iterator<Item = &'a str>,
) -> Vec<OptionMetric> {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for id in selected {
        *counts.entry(id).or_default() += 1;
    }
    ids.map(|id| OptionMetric {
        id: id.to_string(),
        workspaces: counts.get(id).copied().unwrap_or_default(),
    })
    .collect()
}

/// Usage of `kind` by `workspaces`, which must all reference it
pub fn usage_status<'a>(
    kind: &WorkspaceKind,
    workspaces: impl IntoIterator<Item = &'a Workspace>,
) -> WorkspaceKindStatus {
    let options: Vec<_> = workspaces
        .into_iter()
        .map(|ws| &ws.spec.pod_template.options)
        .collect();

    WorkspaceKindStatus {
        workspaces: options.len() as i64,
        pod_template_options: PodTemplateOptionsMetrics {
            image_config: option_metrics(
                kind.image_config_values().iter().map(|v| v.id.as_str()),
                options.iter().map(|o| o.image_config.as_str()),
            ),
            pod_config: option_metrics(
                kind.pod_config_values().iter().map(|v| v.id.as_str()),
                options.iter().map(|o| o.pod_config.as_str()),
            ),
        },
    }
}
