//! Error types for orchestration-platform calls.

use thiserror::Error;

pub type K8sResult<T> = Result<T, K8sError>;

#[derive(Debug, Error)]
pub enum K8sError {
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("api error {code} on {kind} {name}: {message}")]
    Api {
        kind: &'static str,
        name: String,
        code: u16,
        message: String,
    },

    #[error("client error: {0}")]
    Client(String),
}

impl K8sError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, K8sError::NotFound { .. })
    }

    pub(crate) fn from_kube(kind: &'static str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => K8sError::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => K8sError::AlreadyExists {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(resp) => K8sError::Api {
                kind,
                name: name.to_string(),
                code: resp.code,
                message: resp.message,
            },
            other => K8sError::Client(other.to_string()),
        }
    }
}
