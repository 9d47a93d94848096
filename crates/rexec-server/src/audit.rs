//! Append-only audit trail for security-sensitive actions.
//!
//! Records are emitted synchronously at the point of decision. Sinks must not
//! fail the calling operation, so `AuditSink::record` has no error path.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod actions {
    pub const AUTH_FAILURE: &str = "auth.failure";
    pub const SESSION_START: &str = "session.start";
    pub const SESSION_STOP: &str = "session.stop";
    pub const SESSION_INPUT: &str = "session.input";
    pub const SESSION_RESIZE: &str = "session.resize";
    pub const WORKTREE_CREATE: &str = "worktree.create";
    pub const WORKTREE_REMOVE: &str = "worktree.remove";
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub timestamp_ms: u64,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub success: bool,
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: &str,
        resource: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            actor: actor.into(),
            action: action.to_string(),
            resource: resource.into(),
            success,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Receives audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Emits each record as a `tracing` event under the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        if event.success {
            tracing::info!(
                target: "audit",
                actor = %event.actor,
                action = %event.action,
                resource = %event.resource,
                success = event.success,
                timestamp_ms = event.timestamp_ms,
                metadata = %metadata,
                "audit"
            );
        } else {
            tracing::warn!(
                target: "audit",
                actor = %event.actor,
                action = %event.action,
                resource = %event.resource,
                success = event.success,
                timestamp_ms = event.timestamp_ms,
                metadata = %metadata,
                "audit"
            );
        }
    }
}

/// Keeps records in memory; used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn by_action(&self, action: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// Fans records out to every configured sink.
#[derive(Clone)]
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// The default log: structured tracing output only.
    pub fn tracing() -> Self {
        Self::new().with_sink(Arc::new(TracingAuditSink))
    }

    pub fn record(&self, event: AuditEvent) {
        for sink in &self.sinks {
            sink.record(&event);
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::tracing()
    }
}
