use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::warn;

use rexec_protocol::{ExitInfo, OutputStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// Bounded per-session output queue with a single consumer.
///
/// Producers never block: when the queue is full the newest chunk is
/// dropped and counted. The queue is closed once, after the session's exit
/// signal has fired.
#[derive(Debug)]
pub struct OutputQueue {
    session_id: String,
    tx: Mutex<Option<mpsc::Sender<OutputChunk>>>,
    rx: Mutex<Option<mpsc::Receiver<OutputChunk>>>,
    dropped: AtomicU64,
}

impl OutputQueue {
    pub fn new(session_id: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            session_id: session_id.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns false when the chunk was not queued.
    pub fn push(&self, chunk: OutputChunk) -> bool {
        let guard = lock(&self.tx);
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(chunk) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1024 == 0 {
                    warn!(session_id = %self.session_id, dropped, "output queue full, dropping newest chunk");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Hand the receiving end to its one consumer.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<OutputChunk>> {
        lock(&self.rx).take()
    }

    /// Close the producing side. Later calls are no-ops.
    pub fn close(&self) -> bool {
        lock(&self.tx).take().is_some()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Single-fire exit notification, awaitable from any number of places.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    tx: Arc<watch::Sender<Option<ExitInfo>>>,
}

impl ExitSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record the exit. Only the first call has any effect.
    pub fn fire(&self, exit: ExitInfo) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(exit);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn get(&self) -> Option<ExitInfo> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.clone().unwrap_or_default(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => ExitInfo::default(),
        }
    }
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Poison-tolerant lock for short critical sections.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
