use chime_types::events::{ErrorKind, ServerEvent};
use thiserror::Error;

/// Failure taxonomy shared by every service. Each variant maps to one stable
/// `ErrorKind` on the wire.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("{0}")]
    Protocol(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Internal,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Text safe to show a client. Storage details stay server side.
    pub fn client_message(&self) -> String {
        match self {
            Self::Storage(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.kind(), self.client_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_opaque_to_clients() {
        let err = ServiceError::from(anyhow::anyhow!("disk I/O error on chime.db"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.client_message(), "internal server error");
        assert!(err.to_string().contains("disk I/O error"));
    }

    #[test]
    fn business_errors_keep_their_message() {
        let event = ServiceError::conflict("already friends").to_event();
        assert_eq!(
            event,
            ServerEvent::Error {
                kind: ErrorKind::Conflict,
                message: "already friends".into(),
            }
        );
    }
}
