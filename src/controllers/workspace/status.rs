use k8s_openapi::api::core::v1::{Container, Event as CoreEvent, Pod};
use kube::ResourceExt;
use tokio::time::Duration;

use crate::resources::workspaces::{NamedContainer, WorkspacePodStatus, WorkspaceState};

use super::reconcilers::statefulset::MAIN_CONTAINER;

const PENDING_REQUEUE: Duration = Duration::from_secs(15);

/// The state of a Workspace derived from its pod and the warnings seen on its children
#[derive(Debug, Clone, PartialEq)]
pub struct StateDecision {
    pub state: WorkspaceState,
    pub message: String,
    /// Look again after this long, even without a watch event
    pub requeue_after: Option<Duration>,
}

impl StateDecision {
    fn new(state: WorkspaceState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            requeue_after: None,
        }
    }

    /// An error detected before the pod was looked at
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(WorkspaceState::Error, message)
    }
}

/// The Warning event with the latest `lastTimestamp`
pub fn last_warning(events: &[CoreEvent]) -> Option<&CoreEvent> {
    events
        .iter()
        .filter(|e| e.type_.as_deref() == Some("Warning"))
        .fold(None, |last: Option<&CoreEvent>, e| match last {
            Some(last) if e.last_timestamp <= last.last_timestamp => Some(last),
            _ => Some(e),
        })
}

/// Decide the Workspace state; the first matching rule wins.
///
/// `statefulset_warning` and `pod_warning` are the messages of the last Warning event on each.
pub fn workspace_state(
    paused: bool,
    pod: Option<&Pod>,
    statefulset_warning: Option<&str>,
    pod_warning: Option<&str>,
) -> StateDecision {
    let Some(pod) = pod else {
        if paused {
            return StateDecision::new(WorkspaceState::Paused, "Workspace is paused");
        }
        if let Some(warning) = statefulset_warning {
            return StateDecision::error(format!(
                "Workspace StatefulSet has warning event: {warning}"
            ));
        }
        return StateDecision::new(WorkspaceState::Unknown, "Workspace is in an unknown state");
    };

    if pod.metadata.deletion_timestamp.is_some() {
        return StateDecision::new(WorkspaceState::Terminating, "Workspace is terminating");
    }

    let status = pod.status.clone().unwrap_or_default();
    let conditions = status.conditions.unwrap_or_default();
    let condition = |type_: &str| conditions.iter().find(|c| c.type_ == type_);

    if let Some(scheduled) = condition("PodScheduled").filter(|c| c.status != "True") {
        let message = scheduled.message.as_deref().unwrap_or_default();
        match scheduled.reason.as_deref() {
            Some("Unschedulable") => {
                return StateDecision::error(format!("Workspace Pod is unschedulable: {message}"))
            }
            Some("SchedulingGated") => {
                return StateDecision::error(format!(
                    "Workspace Pod is waiting for scheduling gate: {message}"
                ))
            }
            Some("SchedulerError") => {
                return StateDecision::error(format!("Workspace Pod has scheduler error: {message}"))
            }
            _ => {}
        }
    }

    let phase = status.phase.as_deref();
    let ready = condition("Ready").is_some_and(|c| c.status == "True");
    if phase == Some("Running") && ready {
        return StateDecision::new(WorkspaceState::Running, "Workspace is running");
    }

    let waiting_reason = status
        .container_statuses
        .iter()
        .flatten()
        .find(|c| c.name == MAIN_CONTAINER)
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.waiting.as_ref())
        .and_then(|w| w.reason.as_deref());
    match waiting_reason {
        Some("CrashLoopBackOff") => {
            return StateDecision::error("Workspace Container is not running (CrashLoopBackOff)")
        }
        Some("ImagePullBackOff") => {
            return StateDecision::error("Workspace Container is not running (ImagePullBackOff)")
        }
        _ => {}
    }

    if let Some(warning) = pod_warning {
        return StateDecision::error(format!("Workspace Pod has warning event: {warning}"));
    }

    if phase == Some("Pending") {
        return StateDecision {
            requeue_after: Some(PENDING_REQUEUE),
            ..StateDecision::new(WorkspaceState::Pending, "Workspace is pending")
        };
    }

    StateDecision::new(WorkspaceState::Unknown, "Workspace is in an unknown state")
}

/// `status.pauseTime` after this pass; stamped once when a paused Workspace has no pod left
pub fn pause_time(paused: bool, pod_exists: bool, current: i64, now: i64) -> i64 {
    match (paused, pod_exists) {
        (false, _) => 0,
        (true, false) if current == 0 => now,
        _ => current,
    }
}

pub fn pod_status(pod: &Pod) -> WorkspacePodStatus {
    let names = |containers: &[Container]| -> Vec<NamedContainer> {
        containers
            .iter()
            .map(|c| NamedContainer {
                name: c.name.clone(),
            })
            .collect()
    };
    let spec = pod.spec.clone().unwrap_or_default();
    WorkspacePodStatus {
        name: pod.name_any(),
        containers: names(&spec.containers),
        init_containers: names(spec.init_containers.as_deref().unwrap_or_default()),
    }
}
