use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Resource;
use serde_json::json;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::controllers::workspace::reconcilers::FIELD_MANAGER;
use crate::controllers::{changed_predicate, ensure_deletion_change, workspaces_of_kind};
use crate::controllers::{Diagnostics, State};
use crate::resources::workspacekinds::{WorkspaceKind, WORKSPACE_KIND_FINALIZER};
use crate::resources::workspaces::Workspace;
use crate::{telemetry, Error, Metrics, Result};

use super::usage_status;

const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    // Every Workspace in the cluster, for reference counting
    pub ws_store: Store<Workspace>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State, ws_store: Store<Workspace>) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, FIELD_MANAGER.into()),
            ws_store,
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

/// Add or remove the deletion protection finalizer of a WorkspaceKind.
///
/// The patch carries the kind's resourceVersion, so a stale copy yields a conflict.
pub async fn set_finalizer(
    api: &Api<WorkspaceKind>,
    kind: &WorkspaceKind,
    present: bool,
) -> Result<WorkspaceKind> {
    let mut finalizers: Vec<String> = kind
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != WORKSPACE_KIND_FINALIZER)
        .cloned()
        .collect();
    if present {
        finalizers.push(WORKSPACE_KIND_FINALIZER.to_string());
    }
    let patch = json!({
        "metadata": {
            "resourceVersion": kind.resource_version(),
            "finalizers": finalizers,
        }
    });
    Ok(api
        .patch(
            &kind.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?)
}

#[instrument(skip(ctx, kind), fields(trace_id))]
async fn reconcile(kind: Arc<WorkspaceKind>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<WorkspaceKind>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!("Reconciling WorkspaceKind \"{}\"", kind.name_any());
    match kind.reconcile_usage(&ctx).await {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &kind.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(kind.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy<K, C>(_kind: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

impl WorkspaceKind {
    async fn reconcile_usage(&self, ctx: &Context) -> Result<Action> {
        // an empty cache would look like "no references"
        ctx.ws_store
            .wait_until_ready()
            .await
            .map_err(|_| Error::StoreNotReady)?;

        let api: Api<WorkspaceKind> = Api::all(ctx.client.clone());
        let Some(mut kind) = api.get_opt(&self.name_any()).await? else {
            return Ok(Action::await_change());
        };

        let workspaces = workspaces_of_kind(&ctx.ws_store, &kind.name_any());
        debug!(
            "WorkspaceKind \"{}\" is used by {} Workspaces",
            kind.name_any(),
            workspaces.len()
        );

        if workspaces.is_empty() && kind.has_finalizer() {
            match set_finalizer(&api, &kind, false).await {
                Ok(updated) => {
                    info!("Removed finalizer from unused WorkspaceKind \"{}\"", kind.name_any());
                    kind = updated;
                }
                Err(e) if e.is_conflict() => return Ok(Action::requeue(CONFLICT_REQUEUE)),
                Err(e) => return Err(e),
            }
            if kind.is_deleting() {
                // the apiserver will now finish the deletion
                return Ok(Action::await_change());
            }
        }

        let status = usage_status(&kind, workspaces.iter().map(|ws| ws.as_ref()));
        if kind.status.as_ref() == Some(&status) {
            return Ok(Action::await_change());
        }

        kind.status = Some(status);
        match api
            .replace_status(
                &kind.name_any(),
                &PostParams::default(),
                serde_json::to_vec(&kind)?,
            )
            .await
            .map_err(Error::from)
        {
            Ok(_) => Ok(Action::await_change()),
            Err(e) if e.is_conflict() => Ok(Action::requeue(CONFLICT_REQUEUE)),
            Err(e) => Err(e),
        }
    }
}

/// Initialize the WorkspaceKind controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let kind_api = Api::<WorkspaceKind>::all(client.clone());
    let ws_api = Api::<Workspace>::all(client.clone());

    if let Err(e) = kind_api.list(&ListParams::default().limit(1)).await {
        error!("WorkspaceKind is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let (ws_store, ws_writer) = reflector::store();
    let ws_reflector = reflector(ws_writer, watcher(ws_api, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    Controller::new(kind_api, Config::default())
        .shutdown_on_signal()
        .watches_stream(ws_reflector, |ws| {
            Some(ObjectRef::<WorkspaceKind>::new(&ws.spec.kind))
        })
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, state, ws_store),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::fixtures::{mock_client, serve, status};
    use crate::resources::workspacekinds::fixtures::jupyterlab_kind;
    use http::Method;

    const KIND: &str = "/apis/kubeflow.org/v1beta1/workspacekinds/jupyterlab";

    fn kind_with(finalizers: &[&str]) -> WorkspaceKind {
        let mut kind = jupyterlab_kind("jupyterlab");
        kind.metadata.resource_version = Some("12".into());
        kind.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        kind
    }

    #[tokio::test]
    async fn finalizer_is_removed_and_others_kept() {
        let (client, mut handle) = mock_client();
        let kind = kind_with(&[WORKSPACE_KIND_FINALIZER, "example.com/keep"]);
        let patched = serde_json::to_value(kind_with(&["example.com/keep"])).unwrap();
        let server = tokio::spawn(async move {
            let patch = serve(&mut handle, Method::PATCH, KIND, 200, patched).await;
            assert_eq!(
                patch.body,
                json!({
                    "metadata": {
                        "resourceVersion": "12",
                        "finalizers": ["example.com/keep"],
                    }
                })
            );
        });

        let api = Api::all(client);
        let kind = set_finalizer(&api, &kind, false).await.unwrap();
        assert!(!kind.has_finalizer());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn finalizer_is_added_once() {
        let (client, mut handle) = mock_client();
        let kind = kind_with(&[WORKSPACE_KIND_FINALIZER]);
        let patched = serde_json::to_value(&kind).unwrap();
        let server = tokio::spawn(async move {
            let patch = serve(&mut handle, Method::PATCH, KIND, 200, patched).await;
            assert_eq!(patch.body["metadata"]["finalizers"], json!([WORKSPACE_KIND_FINALIZER]));
        });

        let api = Api::all(client);
        assert!(set_finalizer(&api, &kind, true).await.unwrap().has_finalizer());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn stale_kind_is_a_conflict() {
        let (client, mut handle) = mock_client();
        let kind = kind_with(&[]);
        let server = tokio::spawn(async move {
            serve(
                &mut handle,
                Method::PATCH,
                KIND,
                409,
                status(409, "Conflict", "the object has been modified"),
            )
            .await;
        });

        let api = Api::all(client);
        let err = set_finalizer(&api, &kind, true).await.unwrap_err();
        assert!(err.is_conflict());
        server.await.unwrap();
    }
}
