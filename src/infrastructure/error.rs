use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("authorization error: {0}")]
    Auth(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no pending authorization flow: verifier is missing")]
    MissingVerifier,
    #[error("authorization flow error: {0}")]
    Flow(String),
    #[error("credential storage error: {0}")]
    Credential(String),
    #[error("session expired, reconnect required")]
    SessionExpired,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InfraError {
    pub fn is_auth(&self) -> bool {
        matches!(self, InfraError::Auth(_) | InfraError::SessionExpired)
    }
}
