//! Message History Adapter
//!
//! Thin interface to externally-owned message records: append-only writes
//! and range queries by room ordered by creation time.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

use crate::protocol::Message;
use crate::store::StoreError;

/// Externally-owned message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Append one message. Messages are immutable once stored.
    async fn append(&self, message: Message) -> Result<(), StoreError>;

    /// The most recent `limit` messages for `room`, ordered oldest-first so
    /// they can be replayed directly.
    async fn recent(&self, room: &str, limit: usize) -> Result<Vec<Message>, StoreError>;
}

/// Per-room retention cap of the in-memory store.
const DEFAULT_RETAINED: usize = 500;

/// In-memory message store with a fixed per-room retention window.
pub struct MemoryMessageStore {
    rooms: RwLock<HashMap<String, VecDeque<Message>>>,
    retained: usize,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED)
    }

    /// Keep at most `retained` messages per room, dropping the oldest.
    pub fn with_retention(retained: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            retained,
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: Message) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write();
        let log = rooms.entry(message.room.clone()).or_default();
        log.push_back(message);
        while log.len() > self.retained {
            log.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, room: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        let rooms = self.rooms.read();
        let Some(log) = rooms.get(room) else {
            return Ok(Vec::new());
        };
        let skip = log.len().saturating_sub(limit);
        Ok(log.iter().skip(skip).cloned().collect())
    }
}
