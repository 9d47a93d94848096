use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rexec_protocol::{
    DEFAULT_COLS, DEFAULT_ROWS, Event, ExitInfo, OutputStream, SessionId, SessionKind,
    SessionSnapshot, SessionStatus,
};

use crate::broker::BroadcastHub;
use crate::error::{RexecError, Result};
use crate::output::{ExitSignal, OutputChunk, OutputQueue, lock};
use crate::session::{
    Lookup, ManagerConfig, ProcessHandle, Registry, SessionControl, inherited_env, merge_env,
    terminate,
};
use crate::signal::{SIGKILL, exit_from_status, wait_pid};

const READ_BUFFER_SIZE: usize = 4096;
const DEFAULT_TERM: &str = "xterm-256color";
const FALLBACK_SHELL: &str = "/bin/sh";

/// Options for starting an interactive shell.
#[derive(Debug, Clone, Default)]
pub struct PtyStartOptions {
    pub id: SessionId,
    pub cwd: Option<PathBuf>,
    /// Defaults to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

struct PtySession {
    id: SessionId,
    process: ProcessHandle,
    status: Mutex<SessionStatus>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    events: broadcast::Sender<Event>,
    output: OutputQueue,
    exit: ExitSignal,
}

impl PtySession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            kind: SessionKind::Pty,
            status: *lock(&self.status),
            pid: self.process.pid,
            exit: self.exit.get(),
        }
    }

    /// Forward one chunk to the queue and the hub. Returns false once the
    /// session is finalized, so nothing is published after the exit event.
    fn publish_output(&self, data: &[u8]) -> bool {
        let status = lock(&self.status);
        if status.is_terminal() {
            return false;
        }
        self.output.push(OutputChunk {
            stream: OutputStream::Pty,
            data: data.to_vec(),
        });
        let _ = self.events.send(Event::Output {
            session_id: self.id.clone(),
            stream: OutputStream::Pty,
            data: data.to_vec(),
        });
        true
    }
}

struct Spawned {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

struct Inner {
    config: ManagerConfig,
    hub: Arc<BroadcastHub>,
    registry: Mutex<Registry<PtySession>>,
}

/// Owns interactive shells attached to pseudo-terminals.
#[derive(Clone)]
pub struct PtySessionManager {
    inner: Arc<Inner>,
}

impl PtySessionManager {
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

    /// Spawn a shell on a fresh PTY and start its reader and exit waiter.
    pub async fn start(&self, options: PtyStartOptions) -> Result<SessionId> {
        let id = options.id.clone();
        if id.is_empty() {
            return Err(RexecError::InvalidArgument("session id is required".to_string()));
        }
        if let Some(cwd) = &options.cwd {
            if !cwd.is_dir() {
                return Err(RexecError::InvalidArgument(format!(
                    "working directory does not exist: {}",
                    cwd.display()
                )));
            }
        }

        lock(&self.inner.registry).reserve(&id)?;

        let shell = options
            .shell
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(default_shell);
        let env = merge_env(inherited_env(), &options.env, DEFAULT_TERM);
        let size = PtySize {
            cols: options.cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS),
            rows: options.rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS),
            pixel_width: 0,
            pixel_height: 0,
        };
        let cwd = options.cwd.clone();
        let spawn_shell = shell.clone();
        let spawned =
            match tokio::task::spawn_blocking(move || spawn_pty(&spawn_shell, cwd, env, size))
                .await
            {
                Ok(Ok(spawned)) => spawned,
                Ok(Err(e)) => {
                    lock(&self.inner.registry).release(&id);
                    warn!(session_id = %id, shell = %shell, error = %e, "pty spawn failed");
                    return Err(e);
                }
                Err(e) => {
                    lock(&self.inner.registry).release(&id);
                    return Err(RexecError::Spawn(e.to_string()));
                }
            };

        let Spawned {
            master,
            child,
            reader,
            writer,
        } = spawned;
        let pid = child.process_id();

        let activated = {
            let mut registry = lock(&self.inner.registry);
            if registry.is_closing() {
                registry.release(&id);
                Err((master, writer))
            } else {
                let events = self.inner.hub.register(&SessionKind::Pty.topic(&id));
                let session = Arc::new(PtySession {
                    id: id.clone(),
                    process: ProcessHandle::new(pid),
                    status: Mutex::new(SessionStatus::Running),
                    master: Mutex::new(Some(master)),
                    writer: Mutex::new(Some(writer)),
                    events,
                    output: OutputQueue::new(&id, self.inner.config.output_queue_capacity),
                    exit: ExitSignal::new(),
                });
                registry.activate(&id, session.clone());
                Ok(session)
            }
        };
        let session = match activated {
            Ok(session) => session,
            Err(io) => {
                // Shutdown began while the shell was spawning.
                warn!(session_id = %id, pid = ?pid, "discarding pty session started during shutdown");
                let mut child = child;
                if let Err(e) = ProcessHandle::new(pid).signal(SIGKILL) {
                    warn!(session_id = %id, error = %e, "failed to kill discarded pty session");
                }
                let _ = tokio::task::spawn_blocking(move || {
                    drop(io);
                    child.wait()
                })
                .await;
                return Err(RexecError::shutting_down());
            }
        };

        let reader_task = spawn_reader(session.clone(), reader);
        self.spawn_waiter(session, child, reader_task);

        info!(session_id = %id, pid = ?pid, shell = %shell, cols = size.cols, rows = size.rows, "pty session started");
        Ok(id)
    }

    fn spawn_waiter(
        &self,
        session: Arc<PtySession>,
        mut child: Box<dyn Child + Send + Sync>,
        reader_task: JoinHandle<()>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            // Reap through waitpid so signals are named like agent exits.
            let pid = session.process.pid;
            let waited = tokio::task::spawn_blocking(move || match pid {
                Some(pid) => wait_pid(pid).map(exit_from_status),
                None => child.wait().map(|status| ExitInfo {
                    code: Some(status.exit_code() as i32),
                    ..ExitInfo::default()
                }),
            })
            .await;
            session.process.mark_reaped();
            let exit = match waited {
                Ok(Ok(exit)) => exit,
                Ok(Err(e)) => ExitInfo {
                    error: Some(format!("wait failed: {e}")),
                    ..ExitInfo::default()
                },
                Err(e) => ExitInfo {
                    error: Some(format!("exit waiter failed: {e}")),
                    ..ExitInfo::default()
                },
            };
            let drain = manager.inner.config.reader_drain_timeout;
            if tokio::time::timeout(drain, reader_task).await.is_err() {
                debug!(session_id = %session.id, "pty reader still open after exit");
            }
            manager.finalize(&session, exit);
        });
    }

    /// Runs once per session, on the waiter.
    fn finalize(&self, session: &Arc<PtySession>, exit: ExitInfo) {
        let status = exit.status();
        {
            let mut current = lock(&session.status);
            if !current.can_advance_to(status) {
                return;
            }
            *current = status;
        }

        lock(&session.writer).take();
        lock(&session.master).take();

        let snapshot = SessionSnapshot {
            id: session.id.clone(),
            kind: SessionKind::Pty,
            status,
            pid: session.process.pid,
            exit: Some(exit.clone()),
        };
        {
            let mut registry = lock(&self.inner.registry);
            self.inner.hub.remove(&SessionKind::Pty.topic(&session.id));
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
            dropped = session.output.dropped(),
            "pty session exited"
        );
    }

    fn lookup(&self, id: &str) -> Lookup<PtySession> {
        lock(&self.inner.registry).lookup(id)
    }

    /// Write raw bytes to the terminal.
    pub fn write(&self, id: &str, data: &[u8]) -> Result<()> {
        let session = self.lookup(id).into_live(id)?;
        let mut writer = lock(&session.writer);
        let Some(w) = writer.as_mut() else {
            return Err(RexecError::closed(id));
        };
        w.write_all(data).and_then(|()| w.flush()).map_err(|e| {
            if lock(&session.status).is_terminal() {
                RexecError::closed(id)
            } else {
                RexecError::Pty(e.to_string())
            }
        })
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(RexecError::InvalidArgument(
                "cols and rows must be positive".to_string(),
            ));
        }
        let session = self.lookup(id).into_live(id)?;
        let master = lock(&session.master);
        let Some(m) = master.as_ref() else {
            return Err(RexecError::closed(id));
        };
        m.resize(PtySize {
            cols,
            rows,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| RexecError::Pty(e.to_string()))?;
        debug!(session_id = %id, cols, rows, "pty resized");
        Ok(())
    }

    /// Terminate the shell's process group. Returns once the session is
    /// finalized; a second call is a no-op.
    pub async fn kill(&self, id: &str) -> Result<()> {
        let session = match self.lookup(id) {
            Lookup::Live(session) => session,
            Lookup::Closed => return Ok(()),
            Lookup::Starting => return Err(RexecError::starting(id)),
            Lookup::Unknown => return Err(RexecError::NotFound(id.to_string())),
        };
        if session.exit.is_fired() {
            return Ok(());
        }
        info!(session_id = %id, pid = ?session.process.pid, "killing pty session");
        terminate(
            id,
            &session.process,
            &session.exit,
            self.inner.config.grace_period,
        )
        .await?;
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<SessionSnapshot> {
        let registry = lock(&self.inner.registry);
        match registry.lookup(id) {
            Lookup::Live(session) => Ok(session.snapshot()),
            Lookup::Starting => Ok(SessionSnapshot {
                id: id.to_string(),
                kind: SessionKind::Pty,
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
            .subscribe(&SessionKind::Pty.topic(id))
            .ok_or_else(|| RexecError::NotFound(id.to_string()))
    }

    /// Hand out the session's output queue. Only one consumer may hold it.
    pub fn take_output(&self, id: &str) -> Result<mpsc::Receiver<OutputChunk>> {
        let session = self.lookup(id).into_live(id)?;
        session.output.take_receiver().ok_or_else(|| {
            RexecError::FailedPrecondition(format!("output of session {id} already taken"))
        })
    }

    /// Resolves once the session has exited.
    pub async fn wait_exit(&self, id: &str) -> Result<ExitInfo> {
        match self.lookup(id) {
            Lookup::Live(session) => Ok(session.exit.wait().await),
            Lookup::Closed => self
                .status(id)?
                .exit
                .ok_or_else(|| RexecError::closed(id)),
            Lookup::Starting => Err(RexecError::starting(id)),
            Lookup::Unknown => Err(RexecError::NotFound(id.to_string())),
        }
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = lock(&self.inner.registry).live();
        sessions.iter().map(|s| s.snapshot()).collect()
    }

    /// Refuse further starts, then SIGKILL every live shell and wait for
    /// each to finalize.
    pub async fn shutdown_all(&self) {
        let sessions = lock(&self.inner.registry).close();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "force-terminating pty sessions");
        futures_util::future::join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.process.signal(SIGKILL) {
                warn!(session_id = %session.id, error = %e, "failed to kill pty session");
            }
            session.exit.wait().await
        }))
        .await;
    }
}

impl SessionControl for PtySessionManager {
    type StartOptions = PtyStartOptions;

    fn kind(&self) -> SessionKind {
        SessionKind::Pty
    }

    fn start(
        &self,
        options: PtyStartOptions,
    ) -> impl std::future::Future<Output = Result<SessionId>> + Send {
        PtySessionManager::start(self, options)
    }

    fn stop(&self, id: &str) -> impl std::future::Future<Output = Result<()>> + Send {
        self.kill(id)
    }

    fn status(&self, id: &str) -> Result<SessionSnapshot> {
        PtySessionManager::status(self, id)
    }

    fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<Event>> {
        PtySessionManager::subscribe(self, id)
    }

    fn list(&self) -> Vec<SessionSnapshot> {
        PtySessionManager::list(self)
    }

    fn shutdown_all(&self) -> impl std::future::Future<Output = ()> + Send {
        PtySessionManager::shutdown_all(self)
    }
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// Open the PTY pair and spawn the shell on its slave side. portable_pty
/// calls setsid() in the child, so the shell leads its own process group.
fn spawn_pty(
    shell: &str,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    size: PtySize,
) -> Result<Spawned> {
    let pair = native_pty_system()
        .openpty(size)
        .map_err(|e| RexecError::Pty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(shell);
    cmd.env_clear();
    for (key, value) in &env {
        cmd.env(key, value);
    }
    if let Some(cwd) = cwd {
        cmd.cwd(cwd);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| RexecError::Spawn(e.to_string()))?;
    drop(pair.slave);

    let io = pair
        .master
        .try_clone_reader()
        .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
    let (reader, writer) = match io {
        Ok(io) => io,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RexecError::Pty(e.to_string()));
        }
    };

    Ok(Spawned {
        master: pair.master,
        child,
        reader,
        writer,
    })
}

fn spawn_reader(session: Arc<PtySession>, mut reader: Box<dyn Read + Send>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if !session.publish_output(&buf[..n]) {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO once the slave side is gone.
                Err(e) => {
                    debug!(session_id = %session.id, error = %e, "pty reader finished");
                    break;
                }
            }
        }
    })
}
