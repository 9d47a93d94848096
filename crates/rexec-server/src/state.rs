use std::sync::Arc;

use librexec::{AgentSessionManager, BroadcastHub, PtySessionManager, SessionControl};
use rexec_git::WorktreeManager;
use tracing::info;

use crate::audit::{AuditEvent, AuditLog, actions};
use crate::auth::{AuthError, AuthGuard, Identity, UNKNOWN_ACTOR};
use crate::config::ServerConfig;

/// Everything both transports share.
pub struct AppState {
    pub pty: PtySessionManager,
    pub agents: AgentSessionManager,
    pub worktrees: WorktreeManager,
    pub auth: AuthGuard,
    pub audit: AuditLog,
}

impl AppState {
    pub fn new(config: &ServerConfig, audit: AuditLog) -> Arc<Self> {
        let hub = Arc::new(BroadcastHub::new(config.broadcast_capacity));
        let managers = config.manager_config();
        Arc::new(Self {
            pty: PtySessionManager::new(managers.clone(), hub.clone()),
            agents: AgentSessionManager::new(managers, hub),
            worktrees: WorktreeManager::new(),
            auth: AuthGuard::new(&config.auth_secret),
            audit,
        })
    }

    /// Authenticate a header value; failures are audited against `resource`.
    pub fn authenticate(
        &self,
        header: Option<&str>,
        resource: &str,
        transport: &str,
    ) -> Result<Identity, AuthError> {
        self.auth.authenticate(header).inspect_err(|err| {
            self.audit.record(
                AuditEvent::new(UNKNOWN_ACTOR, actions::AUTH_FAILURE, resource, false)
                    .with("reason", err.reason())
                    .with("transport", transport),
            );
        })
    }

    /// Force-terminate every session of both kinds.
    pub async fn shutdown_sessions(&self) {
        tokio::join!(drain(&self.pty), drain(&self.agents));
    }
}

async fn drain<M: SessionControl>(manager: &M) {
    let live = manager.list().len();
    manager.shutdown_all().await;
    info!(kind = ?manager.kind(), live, "sessions terminated");
}
