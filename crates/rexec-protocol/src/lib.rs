pub mod paths;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a session within its kind.
pub type SessionId = String;

/// Default PTY window size when the caller does not supply one.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Which manager owns a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Pty,
    Agent,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Pty => "pty",
            SessionKind::Agent => "agent",
        }
    }

    /// Broadcast topic for a session of this kind. Ids are only unique per kind.
    pub fn topic(self, session_id: &str) -> String {
        format!("{}/{}", self.as_str(), session_id)
    }
}

/// Lifecycle state of a session. Transitions only move forward.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            SessionStatus::Starting => 0,
            SessionStatus::Running => 1,
            SessionStatus::Stopped | SessionStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether `next` is a legal successor. Terminal states have no successor.
    pub fn can_advance_to(self, next: SessionStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }
}

/// Which stream of a process produced an output chunk.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Pty,
    Stdout,
    Stderr,
}

/// How a session's process ended.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub error: Option<String>,
}

impl ExitInfo {
    /// A clean zero exit is `stopped`; anything else is `error`.
    pub fn status(&self) -> SessionStatus {
        if self.code == Some(0) && self.signal.is_none() && self.error.is_none() {
            SessionStatus::Stopped
        } else {
            SessionStatus::Error
        }
    }

    pub fn signaled(&self) -> bool {
        self.signal.is_some()
    }
}

/// Events published per session on the broadcast hub.
///
/// `Exit` is always the last event published for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Output {
        session_id: SessionId,
        stream: OutputStream,
        data: Vec<u8>,
    },
    Exit {
        session_id: SessionId,
        exit: ExitInfo,
    },
}

/// Point-in-time view of a session, retained after exit for agent sessions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
}

/// Transport-level error taxonomy shared by the RPC and push channels.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    AlreadyExists,
    NotFound,
    FailedPrecondition,
    Unauthenticated,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::NotFound => "not_found",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Inbound push-channel control frames, sent as JSON text messages.
///
/// Raw keystrokes may also arrive as binary messages, which are treated
/// the same as `Input`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Input {
        #[serde(with = "base64_bytes")]
        data_b64: Vec<u8>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Kill,
}

/// Outbound push-channel control frames, sent as JSON text messages.
///
/// Output bytes are not wrapped: they travel as binary messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Exit {
        code: Option<i32>,
        signal: Option<String>,
        error: Option<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl From<&ExitInfo> for ServerFrame {
    fn from(exit: &ExitInfo) -> Self {
        ServerFrame::Exit {
            code: exit.code,
            signal: exit.signal.clone(),
            error: exit.error.clone(),
        }
    }
}

/// Lifecycle state of an isolated workspace.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Paused,
    Completed,
    Error,
}

impl WorktreeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorktreeStatus::Active => "active",
            WorktreeStatus::Paused => "paused",
            WorktreeStatus::Completed => "completed",
            WorktreeStatus::Error => "error",
        }
    }
}

/// Descriptor of a managed worktree, derived from the filesystem on every read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Stable hash of the canonical absolute path.
    pub id: String,
    pub name: String,
    pub branch: String,
    pub path: PathBuf,
    pub project_id: String,
    pub status: WorktreeStatus,
    pub created_at_ms: u64,
}

/// Pending changes in a worktree.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeChanges {
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
    pub has_changes: bool,
}

/// A remote execution server as stored by the client. This subsystem only
/// consumes these values; how they are persisted is up to the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteServer {
    pub name: String,
    /// Request/response endpoint, e.g. `http://10.0.0.5:50151`.
    pub rpc_addr: String,
    /// Push-channel endpoint, e.g. `ws://10.0.0.5:50152`.
    pub stream_addr: String,
    /// Bearer credential presented on both channels.
    pub credential: String,
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
