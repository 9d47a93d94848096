//! Remote execution server: session managers and worktrees exposed over a
//! gRPC request/response channel and a websocket push channel.

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod rpc;
pub mod state;
pub mod supervisor;

pub use audit::{AuditEvent, AuditLog, AuditSink, MemoryAuditSink};
pub use auth::{AuthGuard, Identity, issue_token};
pub use config::{Cli, ServerConfig};
pub use supervisor::{ServerHandle, Supervisor};
