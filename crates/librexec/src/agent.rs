use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rexec_protocol::{
    Event, ExitInfo, OutputStream, SessionId, SessionKind, SessionSnapshot, SessionStatus,
};

use crate::broker::BroadcastHub;
use crate::error::{RexecError, Result};
use crate::output::{ExitSignal, OutputChunk, OutputQueue, lock};
use crate::session::{Lookup, ManagerConfig, ProcessHandle, Registry, SessionControl, terminate};
use crate::signal::{SIGKILL, exit_from_status};

const READ_BUFFER_SIZE: usize = 4096;

/// Options for starting a coding-agent CLI in a workspace.
#[derive(Debug, Clone, Default)]
pub struct AgentStartOptions {
    /// Agent name, e.g. `claude`.
    pub agent: String,
    pub workspace_id: String,
    /// Executable to run.
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Session key for an agent in a workspace.
pub fn agent_key(agent: &str, workspace_id: &str) -> SessionId {
    format!("{agent}:{workspace_id}")
}

struct AgentSession {
    id: SessionId,
    process: ProcessHandle,
    status: Mutex<SessionStatus>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    events: broadcast::Sender<Event>,
    output: OutputQueue,
    exit: ExitSignal,
}

impl AgentSession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            kind: SessionKind::Agent,
            status: *lock(&self.status),
            pid: self.process.pid,
            exit: self.exit.get(),
        }
    }

    fn publish_output(&self, stream: OutputStream, data: &[u8]) -> bool {
        let status = lock(&self.status);
        if status.is_terminal() {
            return false;
        }
        self.output.push(OutputChunk {
            stream,
            data: data.to_vec(),
        });
        let _ = self.events.send(Event::Output {
            session_id: self.id.clone(),
            stream,
            data: data.to_vec(),
        });
        true
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(RexecError::closed(&self.id));
        };
        let written = match pipe.write_all(data).await {
            Ok(()) => pipe.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                stdin.take();
                Err(RexecError::closed(&self.id))
            }
            Err(e) => Err(RexecError::Io(e)),
        }
    }
}

struct Inner {
    config: ManagerConfig,
    hub: Arc<BroadcastHub>,
    registry: Mutex<Registry<AgentSession>>,
}

/// Owns coding-agent CLI processes connected through plain pipes.
///
/// Status records outlive the process: once a session is finalized its
/// last snapshot stays queryable until evicted by newer ones.
#[derive(Clone)]
pub struct AgentSessionManager {
    inner: Arc<Inner>,
}

impl AgentSessionManager {
    pub fn new(config: ManagerConfig, hub: Arc<BroadcastHub>) -> Self {
        let retention = config.closed_session_retention;
        Self {
            inner: Arc::new(Inner {
                config,
                hub,
                registry: Mutex::new(Registry::new(retention)),
            }),
        }
    }

    pub async fn start(&self, options: AgentStartOptions) -> Result<SessionId> {
        for (field, value) in [
            ("agent", &options.agent),
            ("workspace_id", &options.workspace_id),
            ("command", &options.command),
        ] {
            if value.trim().is_empty() {
                return Err(RexecError::InvalidArgument(format!("{field} is required")));
            }
        }
        if let Some(cwd) = &options.cwd {
            if !cwd.is_dir() {
                return Err(RexecError::InvalidArgument(format!(
                    "working directory does not exist: {}",
                    cwd.display()
                )));
            }
        }

        let id = agent_key(&options.agent, &options.workspace_id);
        lock(&self.inner.registry).reserve(&id)?;

        let mut cmd = Command::new(&options.command);
        cmd.args(&options.args)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                lock(&self.inner.registry).release(&id);
                warn!(session_id = %id, command = %options.command, error = %e, "agent spawn failed");
                return Err(RexecError::Spawn(e.to_string()));
            }
        };
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let activated = {
            let mut registry = lock(&self.inner.registry);
            if registry.is_closing() {
                registry.release(&id);
                None
            } else {
                let events = self.inner.hub.register(&SessionKind::Agent.topic(&id));
                let session = Arc::new(AgentSession {
                    id: id.clone(),
                    process: ProcessHandle::new(pid),
                    status: Mutex::new(SessionStatus::Running),
                    stdin: tokio::sync::Mutex::new(stdin),
                    events,
                    output: OutputQueue::new(&id, self.inner.config.output_queue_capacity),
                    exit: ExitSignal::new(),
                });
                registry.activate(&id, session.clone());
                Some(session)
            }
        };
        let Some(session) = activated else {
            // Shutdown began while the agent was spawning.
            warn!(session_id = %id, pid = ?pid, "discarding agent session started during shutdown");
            if let Err(e) = ProcessHandle::new(pid).signal(SIGKILL) {
                warn!(session_id = %id, error = %e, "failed to kill discarded agent session");
            }
            let _ = child.wait().await;
            return Err(RexecError::shutting_down());
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(spawn_reader(session.clone(), OutputStream::Stdout, stdout));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_reader(session.clone(), OutputStream::Stderr, stderr));
        }
        self.spawn_waiter(session, child, readers);

        info!(session_id = %id, pid = ?pid, command = %options.command, "agent session started");
        Ok(id)
    }

    fn spawn_waiter(&self, session: Arc<AgentSession>, mut child: Child, readers: Vec<JoinHandle<()>>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let waited = child.wait().await;
            session.process.mark_reaped();
            let exit = match waited {
                Ok(status) => exit_info(status),
                Err(e) => ExitInfo {
                    error: Some(format!("wait failed: {e}")),
                    ..ExitInfo::default()
                },
            };
            let drain = manager.inner.config.reader_drain_timeout;
            for reader in readers {
                if tokio::time::timeout(drain, reader).await.is_err() {
                    debug!(session_id = %session.id, "agent output still open after exit");
                }
            }
            manager.finalize(&session, exit);
        });
    }

    fn finalize(&self, session: &Arc<AgentSession>, exit: ExitInfo) {
        let status = exit.status();
        {
            let mut current = lock(&session.status);
            if !current.can_advance_to(status) {
                return;
            }
            *current = status;
        }

        // Close stdin unless a writer is mid-flight; the pipe is dead anyway.
        if let Ok(mut stdin) = session.stdin.try_lock() {
            stdin.take();
        }

        let snapshot = SessionSnapshot {
            id: session.id.clone(),
            kind: SessionKind::Agent,
            status,
            pid: session.process.pid,
            exit: Some(exit.clone()),
        };
        {
            let mut registry = lock(&self.inner.registry);
            self.inner.hub.remove(&SessionKind::Agent.topic(&session.id));
            registry.retire(&session.id, session, snapshot);
        }

        session.exit.fire(exit.clone());
        session.output.close();
        let _ = session.events.send(Event::Exit {
            session_id: session.id.clone(),
            exit: exit.clone(),
        });

        info!(
            session_id = %session.id,
            exit_code = ?exit.code,
            signal = ?exit.signal,
            error = ?exit.error,
            "agent session exited"
        );
    }

    fn lookup(&self, id: &str) -> Lookup<AgentSession> {
        lock(&self.inner.registry).lookup(id)
    }

    /// Write `text` and a trailing newline to the agent's stdin.
    pub async fn send_message(&self, id: &str, text: &str) -> Result<()> {
        let session = self.lookup(id).into_live(id)?;
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        session.write_stdin(&line).await
    }

    /// Write raw bytes to stdin, verbatim.
    pub async fn write_input(&self, id: &str, data: &[u8]) -> Result<()> {
        let session = self.lookup(id).into_live(id)?;
        session.write_stdin(data).await
    }

    /// Close stdin, then terminate with escalation. Idempotent.
    pub async fn stop(&self, id: &str) -> Result<SessionSnapshot> {
        let session = match self.lookup(id) {
            Lookup::Live(session) => session,
            Lookup::Closed => return self.status(id),
            Lookup::Starting => return Err(RexecError::starting(id)),
            Lookup::Unknown => return Err(RexecError::NotFound(id.to_string())),
        };
        if !session.exit.is_fired() {
            // A writer blocked on a full pipe keeps the lock; the signal below unblocks it.
            if let Ok(mut stdin) = session.stdin.try_lock() {
                stdin.take();
            }
            info!(session_id = %id, pid = ?session.process.pid, "stopping agent session");
            terminate(
                id,
                &session.process,
                &session.exit,
                self.inner.config.grace_period,
            )
            .await?;
        }
        self.status(id)
    }

    /// Last known snapshot, including sessions that already exited.
    pub fn status(&self, id: &str) -> Result<SessionSnapshot> {
        let registry = lock(&self.inner.registry);
        match registry.lookup(id) {
            Lookup::Live(session) => Ok(session.snapshot()),
            Lookup::Starting => Ok(SessionSnapshot {
                id: id.to_string(),
                kind: SessionKind::Agent,
                status: SessionStatus::Starting,
                pid: None,
                exit: None,
            }),
            Lookup::Closed => registry
                .closed
                .get(id)
                .cloned()
                .ok_or_else(|| RexecError::NotFound(id.to_string())),
            Lookup::Unknown => Err(RexecError::NotFound(id.to_string())),
        }
    }

    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<Event>> {
        self.inner
            .hub
            .subscribe(&SessionKind::Agent.topic(id))
            .ok_or_else(|| RexecError::NotFound(id.to_string()))
    }

    pub fn take_output(&self, id: &str) -> Result<tokio::sync::mpsc::Receiver<OutputChunk>> {
        let session = self.lookup(id).into_live(id)?;
        session.output.take_receiver().ok_or_else(|| {
            RexecError::FailedPrecondition(format!("output of session {id} already taken"))
        })
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = lock(&self.inner.registry).live();
        sessions.iter().map(|s| s.snapshot()).collect()
    }

    /// Refuse further starts, then SIGKILL every live agent and wait for
    /// each to finalize.
    pub async fn shutdown_all(&self) {
        let sessions = lock(&self.inner.registry).close();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "force-terminating agent sessions");
        futures_util::future::join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.process.signal(SIGKILL) {
                warn!(session_id = %session.id, error = %e, "failed to kill agent session");
            }
            session.exit.wait().await
        }))
        .await;
    }
}

impl SessionControl for AgentSessionManager {
    type StartOptions = AgentStartOptions;

    fn kind(&self) -> SessionKind {
        SessionKind::Agent
    }

    fn start(
        &self,
        options: AgentStartOptions,
    ) -> impl std::future::Future<Output = Result<SessionId>> + Send {
        AgentSessionManager::start(self, options)
    }

    fn stop(&self, id: &str) -> impl std::future::Future<Output = Result<()>> + Send {
        async move { AgentSessionManager::stop(self, id).await.map(|_| ()) }
    }

    fn status(&self, id: &str) -> Result<SessionSnapshot> {
        AgentSessionManager::status(self, id)
    }

    fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<Event>> {
        AgentSessionManager::subscribe(self, id)
    }

    fn list(&self) -> Vec<SessionSnapshot> {
        AgentSessionManager::list(self)
    }

    fn shutdown_all(&self) -> impl std::future::Future<Output = ()> + Send {
        AgentSessionManager::shutdown_all(self)
    }
}

fn spawn_reader<R>(session: Arc<AgentSession>, stream: OutputStream, mut pipe: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if !session.publish_output(stream, &buf[..n]) {
                        break;
                    }
                }
                Err(e) => {
                    debug!(session_id = %session.id, ?stream, error = %e, "agent reader finished");
                    break;
                }
            }
        }
    })
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    let exit = exit_from_status(status);
    match status.code() {
        Some(code) if code != 0 => ExitInfo {
            error: Some(format!("agent exited with status {code}")),
            ..exit
        },
        _ => exit,
    }
}
