use kube::api::Api;
use kube::core::admission::{AdmissionRequest, Operation};
use kube::Client;
use tracing::*;

use crate::options::OptionValue;
use crate::resources::workspacekinds::WorkspaceKind;
use crate::resources::workspaces::Workspace;

use super::{Denial, FieldErrors};

/// Admission checks for Workspaces: the kind and both selected options must exist
#[derive(Clone)]
pub struct WorkspaceValidator {
    kinds: Api<WorkspaceKind>,
}

impl WorkspaceValidator {
    pub fn new(client: Client) -> Self {
        Self {
            kinds: Api::all(client),
        }
    }

    pub async fn validate(&self, req: &AdmissionRequest<Workspace>) -> Result<(), Denial> {
        match req.operation {
            Operation::Create => {
                let ws = req
                    .object
                    .as_ref()
                    .ok_or_else(|| Denial::bad_request("expected a Workspace object"))?;
                self.validate_create(&req.name, ws).await
            }
            Operation::Update => {
                let (Some(ws), Some(old)) = (req.object.as_ref(), req.old_object.as_ref()) else {
                    return Err(Denial::bad_request("expected a Workspace object and its previous version"));
                };
                self.validate_update(&req.name, old, ws).await
            }
            _ => Ok(()),
        }
    }

    /// `name` is the object name of the request; it is only set in `ws` when no `generateName` was used
    async fn validate_create(&self, name: &str, ws: &Workspace) -> Result<(), Denial> {
        debug!("validating Workspace create");
        self.validate_selection(name, ws).await
    }

    async fn validate_update(&self, name: &str, old: &Workspace, ws: &Workspace) -> Result<(), Denial> {
        debug!("validating Workspace update");
        if old.spec.kind != ws.spec.kind {
            let mut errors = FieldErrors::default();
            errors.push("spec.kind", ws.spec.kind.as_str(), "field is immutable");
            return errors.into_result::<Workspace>(name);
        }
        if !selection_changed(old, ws) {
            return Ok(());
        }
        self.validate_selection(name, ws).await
    }

    async fn validate_selection(&self, name: &str, ws: &Workspace) -> Result<(), Denial> {
        let kind = self.kinds.get_opt(&ws.spec.kind).await.map_err(|e| {
            Denial::internal(format!("failed to get WorkspaceKind {:?}: {e}", ws.spec.kind))
        })?;
        let mut errors = FieldErrors::default();
        match kind {
            Some(kind) => errors.extend(check_options(ws, &kind)),
            None => errors.push(
                "spec.kind",
                ws.spec.kind.as_str(),
                format!("WorkspaceKind {:?} not found", ws.spec.kind),
            ),
        }
        errors.into_result::<Workspace>(name)
    }
}

/// Only the kind and the selected options are checked against the cluster
fn selection_changed(old: &Workspace, ws: &Workspace) -> bool {
    old.spec.kind != ws.spec.kind
        || old.spec.pod_template.options.image_config != ws.spec.pod_template.options.image_config
        || old.spec.pod_template.options.pod_config != ws.spec.pod_template.options.pod_config
}

fn check_option<V: OptionValue>(errors: &mut FieldErrors, kind: &WorkspaceKind, selected: &str, values: &[V]) {
    if values.iter().any(|v| v.id() == selected) {
        return;
    }
    let option = V::KIND;
    errors.push(
        format!("spec.podTemplate.options.{option}"),
        selected,
        format!(
            "{option} with id {selected:?} not found in WorkspaceKind {:?}",
            kind.metadata.name.as_deref().unwrap_or_default()
        ),
    );
}

/// Selected options missing from `kind`
pub fn check_options(ws: &Workspace, kind: &WorkspaceKind) -> FieldErrors {
    let options = &ws.spec.pod_template.options;
    let mut errors = FieldErrors::default();
    check_option(&mut errors, kind, &options.image_config, kind.image_config_values());
    check_option(&mut errors, kind, &options.pod_config, kind.pod_config_values());
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::workspacekinds::fixtures::jupyterlab_kind;
    use crate::resources::workspaces::fixtures::workspace;
    use http::{Request, Response};
    use kube::client::Body;

    #[test]
    fn known_options_pass() {
        let kind = jupyterlab_kind("jupyterlab");
        let ws = workspace("team-a", "jupyter", "jupyterlab");
        assert!(check_options(&ws, &kind).is_empty());
    }

    #[test]
    fn unknown_options_are_reported_per_field() {
        let kind = jupyterlab_kind("jupyterlab");
        let mut ws = workspace("team-a", "jupyter", "jupyterlab");
        ws.spec.pod_template.options.image_config = "nope".into();
        ws.spec.pod_template.options.pod_config = "huge".into();

        let errors = check_options(&ws, &kind);
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "spec.podTemplate.options.imageConfig",
                "spec.podTemplate.options.podConfig"
            ]
        );
        assert_eq!(
            errors.iter().next().unwrap().detail,
            r#"imageConfig with id "nope" not found in WorkspaceKind "jupyterlab""#
        );
    }

    #[test]
    fn only_selection_changes_need_a_lookup() {
        let old = workspace("team-a", "jupyter", "jupyterlab");
        let mut ws = old.clone();
        ws.spec.paused = true;
        assert!(!selection_changed(&old, &ws));
        ws.spec.pod_template.options.pod_config = "big_gpu".into();
        assert!(selection_changed(&old, &ws));
    }

    fn validator() -> (WorkspaceValidator, tower_test::mock::Handle<Request<Body>, Response<Body>>) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        (WorkspaceValidator::new(client), handle)
    }

    #[tokio::test]
    async fn missing_kind_is_invalid() {
        let (validator, mut handle) = validator();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/apis/kubeflow.org/v1beta1/workspacekinds/missing"
            );
            let status = serde_json::json!({
                "apiVersion": "v1", "kind": "Status", "status": "Failure",
                "reason": "NotFound", "code": 404,
                "message": "workspacekinds.kubeflow.org \"missing\" not found",
            });
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(serde_json::to_vec(&status).unwrap()))
                    .unwrap(),
            );
        });

        let ws = workspace("team-a", "jupyter", "missing");
        let denial = validator.validate_create("jupyter", &ws).await.unwrap_err();
        assert_eq!(denial.code, 422);
        assert_eq!(
            denial.message,
            r#"Workspace.kubeflow.org "jupyter" is invalid: spec.kind: Invalid value: "missing": WorkspaceKind "missing" not found"#
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn kind_changes_are_refused_without_a_lookup() {
        let (validator, _) = validator();
        let old = workspace("team-a", "jupyter", "jupyterlab");
        let mut ws = old.clone();
        ws.spec.kind = "rstudio".into();
        let denial = validator.validate_update("jupyter", &old, &ws).await.unwrap_err();
        assert!(denial.message.ends_with(r#"spec.kind: Invalid value: "rstudio": field is immutable"#));
    }

    #[tokio::test]
    async fn unrelated_updates_are_admitted_without_a_lookup() {
        let (validator, _) = validator();
        let old = workspace("team-a", "jupyter", "jupyterlab");
        let mut ws = old.clone();
        ws.spec.paused = true;
        assert!(validator.validate_update("jupyter", &old, &ws).await.is_ok());
    }

    #[tokio::test]
    async fn generated_names_come_from_the_request() {
        let (validator, mut handle) = validator();
        let server = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("service not called");
            let status = serde_json::json!({
                "apiVersion": "v1", "kind": "Status", "status": "Failure",
                "reason": "NotFound", "code": 404,
                "message": "workspacekinds.kubeflow.org \"missing\" not found",
            });
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(serde_json::to_vec(&status).unwrap()))
                    .unwrap(),
            );
        });

        let mut ws = workspace("team-a", "jupyter", "missing");
        ws.metadata.name = None;
        ws.metadata.generate_name = Some("jupyter-".into());
        let review: kube::core::admission::AdmissionReview<Workspace> =
            serde_json::from_value(serde_json::json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
                "request": {
                    "uid": "0df28fbd-5f5f-4fba-a2f4-0c1c3a2d7b6e",
                    "kind": {"group": "kubeflow.org", "version": "v1beta1", "kind": "Workspace"},
                    "resource": {"group": "kubeflow.org", "version": "v1beta1", "resource": "workspaces"},
                    "name": "jupyter-x7k2p",
                    "namespace": "team-a",
                    "operation": "CREATE",
                    "userInfo": {"username": "alice"},
                    "object": ws,
                    "dryRun": false
                }
            }))
            .unwrap();
        let req: AdmissionRequest<Workspace> = review.try_into().unwrap();

        let denial = validator.validate(&req).await.unwrap_err();
        assert!(denial
            .message
            .starts_with(r#"Workspace.kubeflow.org "jupyter-x7k2p" is invalid: "#));
        server.await.unwrap();
    }
}
