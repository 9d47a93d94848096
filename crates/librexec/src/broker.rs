use dashmap::DashMap;
use tokio::sync::broadcast;

use rexec_protocol::Event;

/// Routes per-session events to whoever is subscribed to the session's topic.
///
/// Publication never waits on subscribers: a lagging receiver loses the
/// oldest events and sees `RecvError::Lagged`.
pub struct BroadcastHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Create the channel for a topic, replacing any stale one.
    pub fn register(&self, topic: &str) -> broadcast::Sender<Event> {
        let (tx, _rx) = broadcast::channel(self.capacity);
        self.channels.insert(topic.to_string(), tx.clone());
        tx
    }

    pub fn subscribe(&self, topic: &str) -> Option<broadcast::Receiver<Event>> {
        self.channels.get(topic).map(|tx| tx.subscribe())
    }

    /// Unregister a topic. Existing receivers still drain whatever the
    /// returned sender publishes afterwards.
    pub fn remove(&self, topic: &str) -> Option<broadcast::Sender<Event>> {
        self.channels.remove(topic).map(|(_, tx)| tx)
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
