use rexec_protocol::ErrorCode;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorktreeError {
    #[error("invalid project: {0}")]
    InvalidProject(String),

    #[error("invalid branch name: {0}")]
    InvalidBranch(String),

    #[error("worktree already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("worktree not found: {0}")]
    NotFound(String),

    #[error("path is outside the worktrees root: {}", .0.display())]
    OutsideRoot(PathBuf),

    #[error("not a managed worktree path: {}", .0.display())]
    NotAWorktree(PathBuf),

    #[error("git failed: {0}")]
    Git(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<git2::Error> for WorktreeError {
    fn from(err: git2::Error) -> Self {
        WorktreeError::Git(err.message().to_string())
    }
}

pub type Result<T, E = WorktreeError> = std::result::Result<T, E>;

impl WorktreeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WorktreeError::InvalidProject(_)
            | WorktreeError::InvalidBranch(_)
            | WorktreeError::OutsideRoot(_)
            | WorktreeError::NotAWorktree(_) => ErrorCode::InvalidArgument,
            WorktreeError::AlreadyExists(_) | WorktreeError::BranchExists(_) => {
                ErrorCode::AlreadyExists
            }
            WorktreeError::NotFound(_) => ErrorCode::NotFound,
            WorktreeError::Git(_) | WorktreeError::Io(_) => ErrorCode::Internal,
        }
    }
}
