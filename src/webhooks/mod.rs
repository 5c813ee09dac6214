use std::fmt;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;

use actix_web::web::{Data, Json, JsonConfig};
use actix_web::{post, HttpResponse, Responder};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::*;

use crate::resources::workspacekinds::WorkspaceKind;
use crate::resources::workspaces::Workspace;
use crate::{Error, Result};

const MAX_REVIEW_BYTES: usize = 3 * 1024 * 1024;

pub mod workspace;
pub mod workspacekind;

pub use workspace::WorkspaceValidator;
pub use workspacekind::WorkspaceKindValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorType {
    Invalid,
    /// The field could not be checked at all
    Internal,
}

/// A single invalid field of an admitted object
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub type_: FieldErrorType,
    pub path: String,
    pub value: Value,
    pub detail: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.type_ {
            FieldErrorType::Invalid => {
                write!(f, "{}: Invalid value: {}: {}", self.path, self.value, self.detail)
            }
            FieldErrorType::Internal => write!(f, "{}: Internal error: {}", self.path, self.detail),
        }
    }
}

/// Field errors collected over one admission request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldErrors(Vec<FieldError>);

impl FieldErrors {
    pub fn push(&mut self, path: impl Into<String>, value: impl Into<Value>, detail: impl Into<String>) {
        self.0.push(FieldError {
            type_: FieldErrorType::Invalid,
            path: path.into(),
            value: value.into(),
            detail: detail.into(),
        })
    }

    pub fn push_internal(&mut self, path: impl Into<String>, detail: impl Into<String>) {
        self.0.push(FieldError {
            type_: FieldErrorType::Internal,
            path: path.into(),
            value: Value::Null,
            detail: detail.into(),
        })
    }

    pub fn extend(&mut self, other: FieldErrors) {
        self.0.extend(other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// Deny with every collected error, or admit when there are none
    pub fn into_result<K: Resource<DynamicType = ()>>(self, name: &str) -> Result<(), Denial> {
        if self.is_empty() {
            return Ok(());
        }
        Err(Denial::invalid::<K>(name, self))
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            errors => {
                let errors: Vec<String> = errors.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", errors.join(", "))
            }
        }
    }
}

/// Why an admission request was refused, rendered the way the API server reports it
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub code: u16,
    pub reason: &'static str,
    pub message: String,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// `<Kind>.<group>` as used in API status messages
fn qualified_kind<K: Resource<DynamicType = ()>>() -> String {
    format!("{}.{}", K::kind(&()), K::group(&()))
}

impl Denial {
    pub fn invalid<K: Resource<DynamicType = ()>>(name: &str, errors: FieldErrors) -> Self {
        Self {
            code: 422,
            reason: "Invalid",
            message: format!("{} {name:?} is invalid: {errors}", qualified_kind::<K>()),
        }
    }

    pub fn conflict<K: Resource<DynamicType = ()>>(name: &str, detail: impl fmt::Display) -> Self {
        Self {
            code: 409,
            reason: "Conflict",
            message: format!(
                "Operation cannot be fulfilled on {} {name:?}: {detail}",
                qualified_kind::<K>()
            ),
        }
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        Self {
            code: 500,
            reason: "InternalError",
            message: format!("Internal error occurred: {detail}"),
        }
    }

    pub fn bad_request(detail: impl fmt::Display) -> Self {
        Self {
            code: 400,
            reason: "BadRequest",
            message: detail.to_string(),
        }
    }

    fn apply(self, res: AdmissionResponse) -> AdmissionResponse {
        let mut res = res.deny(self.message);
        res.result.code = self.code;
        res.result.reason = self.reason.to_string();
        res
    }
}

/// Unwrap a review, run `validate` on it and wrap its verdict in a review again
async fn review<K, F, Fut>(body: AdmissionReview<K>, validate: F) -> AdmissionReview<DynamicObject>
where
    K: Resource + Clone + DeserializeOwned,
    F: FnOnce(AdmissionRequest<K>) -> Fut,
    Fut: Future<Output = Result<(), Denial>>,
{
    let req: AdmissionRequest<K> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err.to_string());
            return AdmissionResponse::invalid(err.to_string()).into_review();
        }
    };

    let res = AdmissionResponse::from(&req);
    let operation = req.operation.clone();
    let name = req.name.clone();
    match validate(req).await {
        Ok(()) => {
            info!("accepted: {:?} on resource {}", operation, name);
            res.into_review()
        }
        Err(denial) => {
            warn!("denied: {:?} on {} ({})", operation, name, denial);
            denial.apply(res).into_review()
        }
    }
}

/// Both validators, sharing one client
#[derive(Clone)]
pub struct Validators {
    pub workspace: WorkspaceValidator,
    pub workspacekind: WorkspaceKindValidator,
}

impl Validators {
    pub fn new(client: Client) -> Self {
        Self {
            workspace: WorkspaceValidator::new(client.clone()),
            workspacekind: WorkspaceKindValidator::new(client),
        }
    }
}

#[post("/validate-kubeflow-org-v1beta1-workspace")]
async fn validate_workspace(
    validators: Data<Validators>,
    body: Json<AdmissionReview<Workspace>>,
) -> impl Responder {
    let validator = &validators.workspace;
    let review = review(body.into_inner(), |req| async move { validator.validate(&req).await }).await;
    HttpResponse::Ok().json(review)
}

#[post("/validate-kubeflow-org-v1beta1-workspacekind")]
async fn validate_workspacekind(
    validators: Data<Validators>,
    body: Json<AdmissionReview<WorkspaceKind>>,
) -> impl Responder {
    let validator = &validators.workspacekind;
    let review = review(body.into_inner(), |req| async move { validator.validate(&req).await }).await;
    HttpResponse::Ok().json(review)
}

/// Register the admission endpoints on an actix app
pub fn configure(cfg: &mut actix_web::web::ServiceConfig) {
    // reviews carry both the new and the old object
    cfg.app_data(JsonConfig::default().limit(MAX_REVIEW_BYTES))
        .service(validate_workspace)
        .service(validate_workspacekind);
}

/// Load `tls.crt` and `tls.key` from `cert_dir` into a server config without client auth
pub fn tls_config(cert_dir: &Path) -> Result<rustls::ServerConfig> {
    let read = |file: &str| {
        std::fs::read(cert_dir.join(file))
            .map_err(|e| Error::InvalidTls(format!("reading {file}: {e}")))
    };
    let cert_pem = read("tls.crt")?;
    let key_pem = read("tls.key")?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidTls(format!("parsing tls.crt: {e}")))?;
    if certs.is_empty() {
        return Err(Error::InvalidTls("tls.crt holds no certificates".into()));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
        .map_err(|e| Error::InvalidTls(format!("parsing tls.key: {e}")))?
        .ok_or_else(|| Error::InvalidTls("tls.key holds no private key".into()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::InvalidTls(e.to_string()))
}
