use reqwest::StatusCode;

/// Failures surfaced by the client to its callers.
///
/// Malformed stream frames are deliberately absent: they are logged and
/// skipped by the event layer and never reach a caller.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("session expired: {reason}")]
    SessionExpired { reason: String },
    #[error("server returned {status}: {message}")]
    Server { status: StatusCode, message: String },
    #[error("failed to open response stream: {0}")]
    StreamOpen(String),
    #[error("response stream interrupted: {0}")]
    StreamRead(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("a reply is still being generated")]
    GenerationActive,
    #[error("credential storage failed: {0}")]
    Storage(String),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ClientError {
    pub fn session_expired(reason: impl Into<String>) -> Self {
        Self::SessionExpired {
            reason: reason.into(),
        }
    }

    /// True when the caller must treat the user as signed out.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired { .. })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Server { status, .. } => Some(*status),
            Self::Network(err) => err.status(),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => "Could not reach the server. Check your connection.".to_string(),
            Self::SessionExpired { .. } => "Your session has expired. Please sign in again.".to_string(),
            Self::Server { message, .. } => message.clone(),
            Self::StreamOpen(detail) => format!("Could not start the reply: {detail}"),
            Self::StreamRead(detail) => format!("The reply was interrupted: {detail}"),
            Self::Generation(detail) => format!("Generation failed: {detail}"),
            Self::GenerationActive => "Wait for the current reply to finish.".to_string(),
            Self::Storage(detail) => format!("Could not save credentials: {detail}"),
            Self::Payload(err) => format!("Unexpected data: {err}"),
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
