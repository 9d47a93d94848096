use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use rexec_protocol::{Event, ExitInfo, SessionId, SessionKind, SessionSnapshot};

use crate::error::{RexecError, Result};
use crate::output::ExitSignal;
use crate::retention::Retained;
use crate::signal::{SIGKILL, SIGTERM, signal_group};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_OUTPUT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_CLOSED_RETENTION: usize = 1024;
const DEFAULT_READER_DRAIN: Duration = Duration::from_millis(500);

/// Tunables shared by the PTY and agent managers.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Wait between the termination signal and the forced kill.
    pub grace_period: Duration,
    pub output_queue_capacity: usize,
    /// How many finalized sessions keep a status record.
    pub closed_session_retention: usize,
    /// How long finalization waits for readers to drain after the process
    /// exits. Background grandchildren can hold the output open.
    pub reader_drain_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            output_queue_capacity: DEFAULT_OUTPUT_QUEUE_CAPACITY,
            closed_session_retention: DEFAULT_CLOSED_RETENTION,
            reader_drain_timeout: DEFAULT_READER_DRAIN,
        }
    }
}

/// The narrow surface both managers share. Starting differs per kind, so
/// each manager brings its own options type.
pub trait SessionControl {
    type StartOptions: Send;

    fn kind(&self) -> SessionKind;

    fn start(
        &self,
        options: Self::StartOptions,
    ) -> impl Future<Output = Result<SessionId>> + Send;

    /// Graceful termination with escalation. Idempotent.
    fn stop(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    fn status(&self, id: &str) -> Result<SessionSnapshot>;

    fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<Event>>;

    fn list(&self) -> Vec<SessionSnapshot>;

    /// Force-terminate every live session and wait for each to finalize.
    fn shutdown_all(&self) -> impl Future<Output = ()> + Send;
}

/// OS process owned by a session, signaled as a process group.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub(crate) pid: Option<u32>,
    reaped: AtomicBool,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            reaped: AtomicBool::new(false),
        }
    }

    /// Called by the waiter as soon as the process has been reaped, so the
    /// pid is never signaled after it could have been recycled.
    pub(crate) fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::Release);
    }

    pub(crate) fn signal(&self, signal: Signal) -> Result<()> {
        if self.reaped.load(Ordering::Acquire) {
            debug!(pid = ?self.pid, ?signal, "process already reaped, not signaling");
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Err(RexecError::Spawn("session has no process id".to_string()));
        };
        signal_group(pid, signal)?;
        Ok(())
    }
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL and wait.
pub(crate) async fn terminate(
    id: &str,
    process: &ProcessHandle,
    exit: &ExitSignal,
    grace: Duration,
) -> Result<ExitInfo> {
    process.signal(SIGTERM)?;
    match tokio::time::timeout(grace, exit.wait()).await {
        Ok(info) => Ok(info),
        Err(_) => {
            warn!(session_id = %id, pid = ?process.pid, "grace period elapsed, sending SIGKILL");
            process.signal(SIGKILL)?;
            Ok(exit.wait().await)
        }
    }
}

pub(crate) enum Slot<S> {
    Reserved,
    Live(Arc<S>),
}

/// Where an id stands in a manager's registry.
pub(crate) enum Lookup<S> {
    Live(Arc<S>),
    Starting,
    Closed,
    Unknown,
}

impl<S> Lookup<S> {
    /// Resolve to a live session or the matching sentinel error.
    pub(crate) fn into_live(self, id: &str) -> Result<Arc<S>> {
        match self {
            Lookup::Live(session) => Ok(session),
            Lookup::Starting => Err(RexecError::starting(id)),
            Lookup::Closed => Err(RexecError::closed(id)),
            Lookup::Unknown => Err(RexecError::NotFound(id.to_string())),
        }
    }
}

/// Live slots plus the bounded record of finalized sessions.
pub(crate) struct Registry<S> {
    pub(crate) slots: HashMap<SessionId, Slot<S>>,
    pub(crate) closed: Retained,
    closing: bool,
}

impl<S> Registry<S> {
    pub(crate) fn new(closed_retention: usize) -> Self {
        Self {
            slots: HashMap::new(),
            closed: Retained::new(closed_retention),
            closing: false,
        }
    }

    /// Claim an id before anything is spawned for it.
    pub(crate) fn reserve(&mut self, id: &str) -> Result<()> {
        if self.closing {
            return Err(RexecError::shutting_down());
        }
        if self.slots.contains_key(id) {
            return Err(RexecError::AlreadyExists(id.to_string()));
        }
        self.slots.insert(id.to_string(), Slot::Reserved);
        Ok(())
    }

    /// Roll back a reservation after a failed spawn.
    pub(crate) fn release(&mut self, id: &str) {
        if matches!(self.slots.get(id), Some(Slot::Reserved)) {
            self.slots.remove(id);
        }
    }

    pub(crate) fn activate(&mut self, id: &str, session: Arc<S>) {
        self.closed.remove(id);
        self.slots.insert(id.to_string(), Slot::Live(session));
    }

    pub(crate) fn lookup(&self, id: &str) -> Lookup<S> {
        match self.slots.get(id) {
            Some(Slot::Live(session)) => Lookup::Live(session.clone()),
            Some(Slot::Reserved) => Lookup::Starting,
            None if self.closed.contains(id) => Lookup::Closed,
            None => Lookup::Unknown,
        }
    }

    /// Drop the slot only if it still holds this very session.
    pub(crate) fn retire(&mut self, id: &str, session: &Arc<S>, snapshot: SessionSnapshot) {
        if matches!(self.slots.get(id), Some(Slot::Live(current)) if Arc::ptr_eq(current, session))
        {
            self.slots.remove(id);
        }
        self.closed.insert(snapshot);
    }

    /// Refuse new sessions from now on and hand back the ones still live.
    /// A start that reserved its id earlier sees the flag at activation.
    pub(crate) fn close(&mut self) -> Vec<Arc<S>> {
        self.closing = true;
        self.live()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn live(&self) -> Vec<Arc<S>> {
        self.slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(session) => Some(session.clone()),
                Slot::Reserved => None,
            })
            .collect()
    }
}

/// Inherited environment with caller overrides applied on top. `TERM`
/// falls back to a sensible default when neither side sets it.
pub fn merge_env(
    inherited: impl IntoIterator<Item = (String, String)>,
    overrides: &HashMap<String, String>,
    default_term: &str,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = inherited.into_iter().collect();
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    if env.get("TERM").is_none_or(|term| term.is_empty()) {
        env.insert("TERM".to_string(), default_term.to_string());
    }
    env
}

/// The current process environment, skipping entries that are not UTF-8.
pub(crate) fn inherited_env() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Lookup, Registry, merge_env};
    use crate::error::RexecError;
    use rexec_protocol::{SessionKind, SessionSnapshot, SessionStatus};
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn overrides_win_and_term_defaults() {
        let inherited = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/home/a".to_string()),
        ];
        let mut overrides = HashMap::new();
        overrides.insert("HOME".to_string(), "/work".to_string());

        let env = merge_env(inherited, &overrides, "xterm-256color");
        assert_eq!(env["HOME"], "/work");
        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env["TERM"], "xterm-256color");
    }

    #[test]
    fn caller_term_is_kept() {
        let mut overrides = HashMap::new();
        overrides.insert("TERM".to_string(), "screen".to_string());
        let env = merge_env(Vec::new(), &overrides, "xterm-256color");
        assert_eq!(env["TERM"], "screen");
    }

    #[test]
    fn reservation_blocks_duplicates_and_rolls_back() {
        let mut reg: Registry<u32> = Registry::new(4);
        reg.reserve("a").expect("first reserve");
        assert!(matches!(reg.reserve("a"), Err(RexecError::AlreadyExists(_))));
        assert!(matches!(reg.lookup("a"), Lookup::Starting));

        reg.release("a");
        assert!(matches!(reg.lookup("a"), Lookup::Unknown));
        reg.reserve("a").expect("reserve after release");
    }

    #[test]
    fn retire_leaves_a_tombstone() {
        let mut reg: Registry<u32> = Registry::new(4);
        reg.reserve("a").expect("reserve");
        let session = Arc::new(7);
        reg.activate("a", session.clone());
        assert!(matches!(reg.lookup("a"), Lookup::Live(_)));

        reg.retire(
            "a",
            &session,
            SessionSnapshot {
                id: "a".to_string(),
                kind: SessionKind::Pty,
                status: SessionStatus::Stopped,
                pid: None,
                exit: None,
            },
        );
        assert!(matches!(reg.lookup("a"), Lookup::Closed));
        assert!(reg.live().is_empty());

        // A fresh start clears the tombstone.
        reg.reserve("a").expect("reserve again");
        reg.activate("a", Arc::new(8));
        assert!(matches!(reg.lookup("a"), Lookup::Live(_)));
    }

    #[test]
    fn closing_refuses_new_reservations() {
        let mut reg: Registry<u32> = Registry::new(4);
        reg.reserve("pending").expect("reserve");
        reg.activate("live", Arc::new(1));

        let live = reg.close();
        assert_eq!(live.len(), 1);
        assert!(reg.is_closing());
        assert!(matches!(
            reg.reserve("late"),
            Err(RexecError::FailedPrecondition(_))
        ));
    }
}
