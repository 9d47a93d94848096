use rexec_protocol::{ErrorCode, SessionId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RexecError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = RexecError> = std::result::Result<T, E>;

impl RexecError {
    pub fn closed(id: &str) -> Self {
        RexecError::FailedPrecondition(format!("session {id} is closed"))
    }

    pub fn starting(id: &str) -> Self {
        RexecError::FailedPrecondition(format!("session {id} is still starting"))
    }

    pub fn shutting_down() -> Self {
        RexecError::FailedPrecondition("server is shutting down".to_string())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RexecError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            RexecError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            RexecError::NotFound(_) => ErrorCode::NotFound,
            RexecError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            RexecError::Pty(_) | RexecError::Spawn(_) | RexecError::Io(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RexecError;
    use rexec_protocol::ErrorCode;

    #[test]
    fn errors_map_onto_the_taxonomy() {
        let err = RexecError::Spawn("No such file or directory (os error 2)".to_string());
        assert_eq!(err.code(), ErrorCode::Internal);

        let err = RexecError::closed("s1");
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(err.to_string().contains("s1"));

        assert_eq!(RexecError::shutting_down().code(), ErrorCode::FailedPrecondition);
    }
}
