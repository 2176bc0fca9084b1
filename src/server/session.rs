//! Subscriber Sessions
//!
//! A session is the server-side identity behind a push channel. It owns the
//! set of scent ids the client subscribed to, the per-session monotonic
//! event counter, and a bounded replay buffer so a reconnecting client can
//! present Last-Event-ID and recover retained events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// One delivered push event, retained for replay
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: u64,
    pub data: String,
}

struct SessionBuffer {
    next_event_id: u64,
    events: VecDeque<StoredEvent>,
}

/// Per-client state keyed by the Sbp-Session-Id header
pub struct Session {
    pub id: String,
    subscriptions: RwLock<HashSet<String>>,
    buffer: Mutex<SessionBuffer>,
    capacity: usize,
}

impl Session {
    fn new(id: String, capacity: usize) -> Self {
        Self {
            id,
            subscriptions: RwLock::new(HashSet::new()),
            buffer: Mutex::new(SessionBuffer {
                next_event_id: 1,
                events: VecDeque::new(),
            }),
            capacity,
        }
    }

    pub async fn subscribe(&self, scent_id: &str) {
        self.subscriptions.write().await.insert(scent_id.to_string());
        debug!("Session {} subscribed to '{}'", self.id, scent_id);
    }

    /// Returns whether the subscription existed
    pub async fn unsubscribe(&self, scent_id: &str) -> bool {
        self.subscriptions.write().await.remove(scent_id)
    }

    pub async fn is_subscribed(&self, scent_id: &str) -> bool {
        self.subscriptions.read().await.contains(scent_id)
    }

    /// Assign the next event id, retain the event for replay, and return
    /// the id. Ids are monotonic for the lifetime of the session, across
    /// reconnects.
    pub async fn record(&self, data: String) -> u64 {
        let mut buffer = self.buffer.lock().await;
        let id = buffer.next_event_id;
        buffer.next_event_id += 1;
        buffer.events.push_back(StoredEvent { id, data });
        while buffer.events.len() > self.capacity {
            buffer.events.pop_front();
        }
        id
    }

    /// Retained events newer than `last_seen`, oldest first
    pub async fn replay_after(&self, last_seen: u64) -> Vec<StoredEvent> {
        let buffer = self.buffer.lock().await;
        buffer
            .events
            .iter()
            .filter(|e| e.id > last_seen)
            .cloned()
            .collect()
    }
}

/// All known sessions. Sessions outlive individual connections so replay
/// buffers survive a reconnect.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    replay_capacity: usize,
}

impl SessionRegistry {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            replay_capacity,
        }
    }

    /// Look up the session named by the header, or mint a fresh one. An
    /// unknown presented id gets a new session under that id, so a client
    /// resuming against a restarted server lands on an empty buffer.
    pub async fn get_or_create(&self, presented: Option<&str>) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;

        if let Some(id) = presented {
            if let Some(session) = sessions.get(id) {
                return session.clone();
            }
        }

        let id = presented
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Arc::new(Session::new(id.clone(), self.replay_capacity));
        sessions.insert(id.clone(), session.clone());
        info!("🔑 Session established: {}", id);
        session
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
