use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("The Workspace cache was closed before it finished its initial listing")]
    StoreNotReady,

    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid webhook TLS configuration: {0}")]
    InvalidTls(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::StoreNotReady => "StoreNotReady",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::InvalidTls(_) => "InvalidTls",
        }
    }

    /// True when the API server rejected a write because our copy was stale
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }
}

pub mod controllers;
pub use controllers::{Settings, State};

/// Option selection and redirect resolution
pub mod options;

/// Canonical resource quantities
pub mod quantity;

/// Env value templates
pub mod template;

/// Admission webhooks
pub mod webhooks;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Custom resources and external CRDs
pub mod resources;
