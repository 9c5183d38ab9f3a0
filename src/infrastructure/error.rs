use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Credential store error: {0}")]
    Credential(String),
    #[error("Network error: {0}")]
    Transport(String),
    #[error("Not authenticated. Please log in.")]
    Authentication,
    #[error("Session expired. Please log in again.")]
    SessionExpired,
    #[error("Request failed: {status} {body}")]
    Request { status: u16, body: String },
    #[error("Invalid response payload: {message}; body={body}")]
    Parse { message: String, body: String },
    #[error("Invalid input: {0}")]
    Validation(String),
    /// A failure already recorded as text by a store, surfaced unchanged.
    #[error("{0}")]
    Recorded(String),
}

impl InfraError {
    /// True when the caller has to log in again before any further request can succeed.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Authentication | Self::SessionExpired)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}
