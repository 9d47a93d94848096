use std::collections::{HashMap, VecDeque};

use rexec_protocol::{SessionId, SessionSnapshot};

/// Bounded record of finalized sessions, oldest evicted first.
pub(crate) struct Retained {
    capacity: usize,
    order: VecDeque<SessionId>,
    snapshots: HashMap<SessionId, SessionSnapshot>,
}

impl Retained {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            snapshots: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, snapshot: SessionSnapshot) {
        if self.snapshots.contains_key(&snapshot.id) {
            self.order.retain(|id| id != &snapshot.id);
        }
        self.order.push_back(snapshot.id.clone());
        self.snapshots.insert(snapshot.id.clone(), snapshot);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.snapshots.remove(&oldest);
            }
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<&SessionSnapshot> {
        self.snapshots.get(id)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.snapshots.contains_key(id)
    }

    pub(crate) fn remove(&mut self, id: &str) {
        if self.snapshots.remove(id).is_some() {
            self.order.retain(|existing| existing != id);
        }
    }
}
