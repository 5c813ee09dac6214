use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Event as CoreEvent, Pod, Service};
use kube::api::{Api, ListParams, PostParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config;
use kube::runtime::{metadata_watcher, predicates, reflector, watcher, Predicate, WatchStreamExt};
use kube::Resource;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::controllers::workspacekind::set_finalizer;
use crate::controllers::{
    changed_predicate, ensure_deletion_change, resource_version_predicate, spec_predicate_serde,
    workspaces_of_kind,
};
use crate::controllers::{Diagnostics, Settings, State};
use crate::options::resolve;
use crate::resources::virtualservices::VirtualService;
use crate::resources::workspacekinds::WorkspaceKind;
use crate::resources::workspaces::{
    Workspace, WorkspacePodOptionInfo, WorkspaceStatus,
};
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::service::service;
use super::reconcilers::statefulset::statefulset;
use super::reconcilers::virtualservice::virtual_service;
use super::reconcilers::{reconcile_child, ChildOutcome, OwnedChild, FIELD_MANAGER, WORKSPACE_NAME_LABEL};
use super::status::{last_warning, pause_time, pod_status, workspace_state, StateDecision};

const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    pub settings: Arc<Settings>,
    // Stores for owned children
    pub ss_store: Store<StatefulSet>,
    pub svc_store: Store<Service>,
    // Only watched when layer 7 routing is enabled
    pub vs_store: Option<Store<VirtualService>>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(
        client: Client,
        metrics: Metrics,
        state: State,
        ss_store: Store<StatefulSet>,
        svc_store: Store<Service>,
        vs_store: Option<Store<VirtualService>>,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, FIELD_MANAGER.into()),
            settings: state.settings.clone(),
            ss_store,
            svc_store,
            vs_store,
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, ws), fields(trace_id))]
async fn reconcile(ws: Arc<Workspace>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Workspace>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = ws
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    info!(
        "Reconciling Workspace \"{}\" in {}",
        ws.name_any(),
        namespace
    );
    match ws.reconcile(&ctx, &namespace).await {
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
                    &ws.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(ws.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy<K, C>(_ws: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

/// Message of the most recent Warning event about the object with `uid`
async fn last_warning_message(api: &Api<CoreEvent>, uid: Option<String>) -> Result<Option<String>> {
    let Some(uid) = uid else {
        return Ok(None);
    };
    let events = api
        .list(&ListParams::default().fields(&format!("involvedObject.uid={uid}")))
        .await?;
    Ok(last_warning(&events.items).and_then(|e| e.message.clone()))
}

/// Where reconciling an owned child left us
enum Child<K> {
    Ready(K),
    Stop(Action),
}

impl Workspace {
    async fn reconcile(&self, ctx: &Context, namespace: &str) -> Result<Action> {
        if self.meta().deletion_timestamp.is_some() {
            // children are removed by garbage collection
            return Ok(Action::await_change());
        }

        let mut status = self.status.clone().unwrap_or_default();

        let kinds: Api<WorkspaceKind> = Api::all(ctx.client.clone());
        let Some(kind) = kinds.get_opt(&self.spec.kind).await? else {
            let message = format!("Workspace references unknown WorkspaceKind: {}", self.spec.kind);
            return self.record_error(ctx, status, message).await;
        };

        if !kind.is_deleting() && !kind.has_finalizer() {
            match set_finalizer(&kinds, &kind, true).await {
                Ok(_) => info!("Added finalizer to WorkspaceKind \"{}\"", kind.name_any()),
                Err(e) if e.is_conflict() => return Ok(Action::requeue(CONFLICT_REQUEUE)),
                Err(e) => return Err(e),
            }
        }

        let image = match resolve(
            &self.spec.pod_template.options.image_config,
            kind.image_config_values(),
        ) {
            Ok(image) => image,
            Err(e) => {
                let message = format!("Workspace has invalid imageConfig: {e}");
                return self.record_error(ctx, status, message).await;
            }
        };
        let pod_config = match resolve(
            &self.spec.pod_template.options.pod_config,
            kind.pod_config_values(),
        ) {
            Ok(pod_config) => pod_config,
            Err(e) => {
                let message = format!("Workspace has invalid podConfig: {e}");
                return self.record_error(ctx, status, message).await;
            }
        };

        status.pending_restart = image.is_redirected() || pod_config.is_redirected();
        status.pod_template_options.image_config = WorkspacePodOptionInfo {
            desired: image.desired.id.clone(),
            redirect_chain: image.chain.clone(),
        };
        status.pod_template_options.pod_config = WorkspacePodOptionInfo {
            desired: pod_config.desired.id.clone(),
            redirect_chain: pod_config.chain.clone(),
        };

        // the currently selected options are deployed; redirects only surface as a pending restart
        let desired_ss = match statefulset(self, &kind, &image.current.spec, &pod_config.current.spec) {
            Ok(ss) => ss,
            Err(e) => {
                let message = format!("Workspace failed to generate StatefulSet with error: {e}");
                return self.record_error(ctx, status, message).await;
            }
        };
        let ss_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), namespace);
        let ss = match self
            .reconcile_owned(ctx, &ss_api, &ctx.ss_store, desired_ss, &mut status)
            .await?
        {
            Child::Ready(ss) => ss,
            Child::Stop(action) => return Ok(action),
        };
        status.resources.stateful_set = Some(ss.name_any());

        let desired_svc = match service(self, &image.current.spec) {
            Ok(svc) => svc,
            Err(e) => {
                let message = format!("Workspace failed to generate Service with error: {e}");
                return self.record_error(ctx, status, message).await;
            }
        };
        let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
        let svc = match self
            .reconcile_owned(ctx, &svc_api, &ctx.svc_store, desired_svc, &mut status)
            .await?
        {
            Child::Ready(svc) => svc,
            Child::Stop(action) => return Ok(action),
        };
        status.resources.service = Some(svc.name_any());

        let virtual_service = match &ctx.vs_store {
            Some(vs_store) => {
                let desired_vs = match virtual_service(
                    self,
                    &kind,
                    &image.current.spec,
                    &svc.name_any(),
                    &ctx.settings,
                ) {
                    Ok(vs) => vs,
                    Err(e) => {
                        let message =
                            format!("Workspace failed to generate VirtualService with error: {e}");
                        return self.record_error(ctx, status, message).await;
                    }
                };
                let vs_api: Api<VirtualService> = Api::namespaced(ctx.client.clone(), namespace);
                match self
                    .reconcile_owned(ctx, &vs_api, vs_store, desired_vs, &mut status)
                    .await?
                {
                    Child::Ready(vs) => Some(vs.name_any()),
                    Child::Stop(action) => return Ok(action),
                }
            }
            None => None,
        };
        status.resources.virtual_service = virtual_service;

        // the first pod of a StatefulSet is always "<name>-0"
        let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
        let pod = pod_api.get_opt(&format!("{}-0", ss.name_any())).await?;

        let event_api: Api<CoreEvent> = Api::namespaced(ctx.client.clone(), namespace);
        let ss_warning = if pod.is_none() && !self.spec.paused {
            last_warning_message(&event_api, ss.uid()).await?
        } else {
            None
        };
        let pod_warning = match &pod {
            Some(pod) => last_warning_message(&event_api, pod.uid()).await?,
            None => None,
        };

        let decision = workspace_state(
            self.spec.paused,
            pod.as_ref(),
            ss_warning.as_deref(),
            pod_warning.as_deref(),
        );
        status.pause_time = pause_time(
            self.spec.paused,
            pod.is_some(),
            status.pause_time,
            Utc::now().timestamp(),
        );
        status.pod_template_pod = pod.as_ref().map(pod_status);

        let action = match decision.requeue_after {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        };
        status.state = decision.state;
        status.state_message = decision.message;
        if !self.write_status(ctx, status).await? {
            return Ok(Action::requeue(CONFLICT_REQUEUE));
        }
        Ok(action)
    }

    async fn reconcile_owned<K: OwnedChild>(
        &self,
        ctx: &Context,
        api: &Api<K>,
        store: &Store<K>,
        desired: K,
        status: &mut WorkspaceStatus,
    ) -> Result<Child<K>> {
        match reconcile_child(api, store, self, desired).await? {
            ChildOutcome::Ready(child) => Ok(Child::Ready(child)),
            ChildOutcome::Conflict => Ok(Child::Stop(Action::requeue(CONFLICT_REQUEUE))),
            ChildOutcome::Multiple(names) => {
                let message = format!(
                    "Workspace owns multiple {}s: {}",
                    K::kind(&()),
                    names.join(", ")
                );
                let action = self.record_error(ctx, status.clone(), message).await?;
                Ok(Child::Stop(action))
            }
        }
    }

    /// Record an Error state and stop; the next watch event retries
    async fn record_error(
        &self,
        ctx: &Context,
        mut status: WorkspaceStatus,
        message: String,
    ) -> Result<Action> {
        warn!("Workspace \"{}\": {message}", self.name_any());
        let decision = StateDecision::error(message);
        status.state = decision.state;
        status.state_message = decision.message;
        if !self.write_status(ctx, status).await? {
            return Ok(Action::requeue(CONFLICT_REQUEUE));
        }
        Ok(Action::await_change())
    }

    /// Persist `status` if it differs from the observed one; false on a write conflict
    async fn write_status(&self, ctx: &Context, status: WorkspaceStatus) -> Result<bool> {
        if self.status.as_ref() == Some(&status) {
            return Ok(true);
        }
        debug!(
            "Workspace \"{}\" is now {}: {}",
            self.name_any(),
            status.state,
            status.state_message
        );

        let api: Api<Workspace> =
            Api::namespaced(ctx.client.clone(), &self.namespace().unwrap_or_default());
        let mut ws = self.clone();
        ws.status = Some(status);
        match api
            .replace_status(&ws.name_any(), &PostParams::default(), serde_json::to_vec(&ws)?)
            .await
            .map_err(Error::from)
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!("Conflict while updating Workspace status, will requeue");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Initialize the Workspace controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let ws_api = Api::<Workspace>::all(client.clone());
    let kind_api = Api::<WorkspaceKind>::all(client.clone());
    let ss_api = Api::<StatefulSet>::all(client.clone());
    let svc_api = Api::<Service>::all(client.clone());
    let pod_api = Api::<Pod>::all(client.clone());

    if let Err(e) = ws_api.list(&ListParams::default().limit(1)).await {
        error!("Workspace is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // children are matched on owner references, pods on the label alone
    let pod_cfg = Config::default().labels(WORKSPACE_NAME_LABEL);

    let (ss_store, ss_writer) = reflector::store();
    let ss_reflector = reflector(ss_writer, watcher(ss_api, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    let (svc_store, svc_writer) = reflector::store();
    let svc_reflector = reflector(svc_writer, watcher(svc_api, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        // svc has no generation so we hash the spec to check for changes
        .predicate_filter(changed_predicate.combine(spec_predicate_serde));

    let pod_watcher = metadata_watcher(pod_api, pod_cfg)
        .touched_objects()
        .default_backoff()
        .predicate_filter(resource_version_predicate);

    let kind_watcher = watcher(kind_api, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(predicates::generation);

    let controller = Controller::new(ws_api, Config::default());
    let ws_store = controller.store();
    let controller = controller
        .shutdown_on_signal()
        .owns_stream(ss_reflector)
        .owns_stream(svc_reflector)
        .watches_stream(pod_watcher, |pod| {
            let name = pod.labels().get(WORKSPACE_NAME_LABEL)?;
            Some(ObjectRef::<Workspace>::new(name).within(&pod.namespace()?))
        })
        .watches_stream(kind_watcher, move |kind| {
            workspaces_of_kind(&ws_store, &kind.name_any())
                .into_iter()
                .map(|ws| ObjectRef::from_obj(ws.as_ref()))
        });

    let (controller, vs_store) = if state.settings.use_layer7_routing {
        let vs_api = Api::<VirtualService>::all(client.clone());
        let (vs_store, vs_writer) = reflector::store();
        let vs_reflector = reflector(vs_writer, watcher(vs_api, Config::default()))
            .map(|event| ensure_deletion_change(event))
            .touched_objects()
            .default_backoff()
            .predicate_filter(changed_predicate);
        (controller.owns_stream(vs_reflector), Some(vs_store))
    } else {
        (controller, None)
    };

    controller
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, state, ss_store, svc_store, vs_store),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
