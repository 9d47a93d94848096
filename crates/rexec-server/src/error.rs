use librexec::RexecError;
use rexec_git::WorktreeError;
use rexec_protocol::ErrorCode;
use thiserror::Error;
use tonic::Status;
use tracing::error;

use crate::auth::AuthError;

/// Every failure an RPC or stream adapter can surface.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Unauthenticated(#[from] AuthError),

    #[error(transparent)]
    Session(#[from] RexecError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn missing(field: &str) -> Self {
        ApiError::InvalidArgument(format!("{field} is required"))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ApiError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            ApiError::Session(e) => e.code(),
            ApiError::Worktree(e) => e.code(),
            ApiError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Code plus the message shown to callers. Internal details are logged
    /// here and replaced with a generic message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self.code() {
            ErrorCode::Internal => {
                error!(error = %self, "internal error");
                (ErrorCode::Internal, "internal error".to_string())
            }
            // Never echo verifier output back to the caller.
            ErrorCode::Unauthenticated => {
                (ErrorCode::Unauthenticated, "invalid credential".to_string())
            }
            code => (code, self.to_string()),
        }
    }

    pub fn into_status(self) -> Status {
        let (code, message) = self.to_error_code();
        match code {
            ErrorCode::InvalidArgument => Status::invalid_argument(message),
            ErrorCode::AlreadyExists => Status::already_exists(message),
            ErrorCode::NotFound => Status::not_found(message),
            ErrorCode::FailedPrecondition => Status::failed_precondition(message),
            ErrorCode::Unauthenticated => Status::unauthenticated(message),
            ErrorCode::Internal => Status::internal(message),
        }
    }
}

impl From<ApiError> for Status {
    fn from(err: ApiError) -> Self {
        err.into_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tonic::Code;

    #[test]
    fn maps_sentinels_to_status_codes() {
        let cases: Vec<(ApiError, Code)> = vec![
            (ApiError::missing("session_id"), Code::InvalidArgument),
            (RexecError::AlreadyExists("a".into()).into(), Code::AlreadyExists),
            (RexecError::NotFound("a".into()).into(), Code::NotFound),
            (RexecError::closed("a").into(), Code::FailedPrecondition),
            (AuthError::Missing.into(), Code::Unauthenticated),
            (
                WorktreeError::OutsideRoot(PathBuf::from("/etc")).into(),
                Code::InvalidArgument,
            ),
            (
                WorktreeError::BranchExists("x".into()).into(),
                Code::AlreadyExists,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.into_status().code(), code);
        }
    }

    #[test]
    fn internal_details_stay_server_side() {
        let status = ApiError::from(WorktreeError::Git(
            "fatal: /home/alice/secret is not a git repository".into(),
        ))
        .into_status();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "internal error");

        let status = ApiError::from(AuthError::Invalid("InvalidSignature".into())).into_status();
        assert_eq!(status.message(), "invalid credential");
    }
}
