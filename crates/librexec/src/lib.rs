pub mod agent;
pub mod broker;
pub mod error;
pub mod output;
pub mod pty;
mod retention;
pub mod session;
pub mod signal;

pub use agent::{AgentSessionManager, AgentStartOptions, agent_key};
pub use broker::BroadcastHub;
pub use error::{Result, RexecError};
pub use output::{ExitSignal, OutputChunk, OutputQueue};
pub use pty::{PtySessionManager, PtyStartOptions};
pub use session::{ManagerConfig, SessionControl, merge_env};
