//! Room Directory
//!
//! The fixed set of named rooms, each with its live member set. Rooms are
//! the fan-out unit for messages and the partner-discovery unit for call
//! signaling. No dynamic room creation: the set is known at startup.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::BrokerError;
use crate::history::MessageStore;
use crate::protocol::{Message, ServerMessage};
use crate::session::Session;
use crate::store::{bounded, UserStore};

/// Call-setup phase of a room, from the coordinator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    OfferSent,
    Active,
}

/// Per-room call bookkeeping. `parties` holds the sessions that sent the
/// offer or the answer; only their departure tears the call down.
#[derive(Debug)]
pub(crate) struct CallState {
    pub(crate) phase: CallPhase,
    pub(crate) parties: HashSet<String>,
}

impl CallState {
    fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            parties: HashSet::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.phase = CallPhase::Idle;
        self.parties.clear();
    }
}

/// A named room and its current members.
pub struct Room {
    name: String,
    members: RwLock<HashMap<String, Arc<Session>>>,
    pub(crate) call: RwLock<CallState>,
}

impl Room {
    fn new(name: String) -> Self {
        Self {
            name,
            members: RwLock::new(HashMap::new()),
            call: RwLock::new(CallState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.members.read().contains_key(session_id)
    }

    /// Snapshot of the current members.
    pub fn members(&self) -> Vec<Arc<Session>> {
        self.members.read().values().cloned().collect()
    }

    /// Current call phase, mainly for tests and logging.
    pub fn call_phase(&self) -> CallPhase {
        self.call.read().phase
    }

    fn insert_member(&self, session: Arc<Session>) {
        self.members
            .write()
            .insert(session.id().to_string(), session);
    }

    fn remove_member(&self, session_id: &str) -> bool {
        self.members.write().remove(session_id).is_some()
    }

    /// Deliver an event to every member except `sender_id`. Takes the
    /// member lock exclusively so two concurrent fan-outs cannot
    /// interleave: all members observe this room's traffic in one order.
    /// Sends are non-blocking channel pushes, never I/O.
    pub fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let members = self.members.write();
        for (id, member) in members.iter() {
            if id != sender_id {
                member.send(message.clone());
            }
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("members", &self.member_count())
            .finish()
    }
}

/// Directory of all rooms. The map itself is immutable after startup;
/// only the per-room member sets change.
pub struct RoomDirectory {
    rooms: HashMap<String, Arc<Room>>,
}

impl RoomDirectory {
    pub fn new(names: &[String]) -> Self {
        let rooms = names
            .iter()
            .map(|name| (name.clone(), Arc::new(Room::new(name.clone()))))
            .collect();
        Self { rooms }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.get(name).cloned()
    }

    /// Read-only membership snapshot used for fan-out target selection.
    pub fn members_of(&self, name: &str) -> Vec<Arc<Session>> {
        self.get(name).map(|room| room.members()).unwrap_or_default()
    }

    /// Join `room_name`, leaving any previous room implicitly.
    ///
    /// Fails with `AccessDenied` before touching membership or history when
    /// the room is unknown or not in the session's cached allowed set. On
    /// success returns the history replay (oldest-first, capped at
    /// `window`) for the joining connection only, plus the room that was
    /// left, so the caller can run call-teardown there.
    ///
    /// The history snapshot is taken before the member-set insertion: a
    /// post racing this join reaches the joiner only as a live broadcast
    /// and is never duplicated into the replay. Re-joining the current
    /// room is a no-op beyond re-sending history.
    pub async fn join(
        &self,
        session: &Arc<Session>,
        room_name: &str,
        history: &Arc<dyn MessageStore>,
        window: usize,
        deadline: Duration,
    ) -> Result<(Vec<Message>, Option<Arc<Room>>), BrokerError> {
        let room = self
            .get(room_name)
            .ok_or_else(|| BrokerError::AccessDenied(room_name.to_string()))?;
        if !session.may_access(room_name) {
            return Err(BrokerError::AccessDenied(room_name.to_string()));
        }

        let replay = bounded(deadline, "history query", history.recent(room_name, window)).await?;

        let previous = self.attach(session, &room);
        log::info!("{} joined room {}", session.id(), room_name);

        Ok((replay, previous))
    }

    fn attach(&self, session: &Arc<Session>, room: &Arc<Room>) -> Option<Arc<Room>> {
        let previous_name = session.current_room();
        if previous_name.as_deref() == Some(room.name()) {
            return None;
        }

        let previous = previous_name.and_then(|name| self.get(&name));
        if let Some(prev) = &previous {
            prev.remove_member(session.id());
        }
        room.insert_member(session.clone());
        session.set_current_room(Some(room.name().to_string()));
        previous
    }

    /// Remove the session from its current room. No-op if it is not in
    /// one. Returns the room left so the caller can run call teardown.
    pub fn leave(&self, session: &Session) -> Option<Arc<Room>> {
        let room = self.get(&session.current_room()?)?;
        room.remove_member(session.id());
        session.set_current_room(None);
        log::info!("{} left room {}", session.id(), room.name());
        Some(room)
    }

    /// Queue an admin-visible access request. Idempotent: re-requesting a
    /// pending room, or a room already allowed, changes nothing. Grants
    /// nothing by itself.
    pub async fn request_access(
        &self,
        username: &str,
        room_name: &str,
        users: &Arc<dyn UserStore>,
        deadline: Duration,
    ) -> Result<(), BrokerError> {
        if self.get(room_name).is_none() {
            return Err(BrokerError::AccessDenied(room_name.to_string()));
        }

        let mut record = bounded(deadline, "user lookup", users.get(username))
            .await?
            .ok_or_else(|| BrokerError::Persistence("unknown user".to_string()))?;

        let already_allowed = record.allowed_rooms.iter().any(|r| r == room_name);
        let already_pending = record.pending_requests.iter().any(|r| r == room_name);
        if already_allowed || already_pending {
            return Ok(());
        }

        record.pending_requests.push(room_name.to_string());
        bounded(deadline, "user update", users.update(record)).await?;
        log::info!("{} requested access to room {}", username, room_name);
        Ok(())
    }
}

impl std::fmt::Debug for RoomDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomDirectory")
            .field("rooms", &self.rooms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryMessageStore;
    use crate::session::SessionRegistry;
    use crate::store::{MemoryUserStore, StoreError, UserRecord};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const DEADLINE: Duration = Duration::from_secs(1);

    fn room_names() -> Vec<String> {
        vec!["Geral".to_string(), "Projetos".to_string()]
    }

    fn session_allowed(
        registry: &SessionRegistry,
        rooms: &[&str],
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = registry.register(tx);
        // Seed the cached permission snapshot directly.
        let allowed: Vec<String> = rooms.iter().map(|r| r.to_string()).collect();
        registry.refresh_permissions(&session, allowed);
        (session, rx)
    }

    fn message(room: &str, text: &str) -> Message {
        Message {
            room: room.to_string(),
            author: "alice".to_string(),
            text: text.to_string(),
            attachment: None,
            timestamp: Utc::now(),
        }
    }

    /// Counts `recent` calls so tests can prove a denied join never
    /// queried history.
    struct CountingStore {
        inner: MemoryMessageStore,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl MessageStore for CountingStore {
        async fn append(&self, message: Message) -> Result<(), StoreError> {
            self.inner.append(message).await
        }

        async fn recent(&self, room: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.inner.recent(room, limit).await
        }
    }

    #[tokio::test]
    async fn test_denied_join_mutates_nothing() {
        let registry = SessionRegistry::new();
        let directory = RoomDirectory::new(&room_names());
        let store = Arc::new(CountingStore {
            inner: MemoryMessageStore::new(),
            queries: AtomicUsize::new(0),
        });
        let history: Arc<dyn MessageStore> = store.clone();

        let (session, _rx) = session_allowed(&registry, &["Geral"]);
        let result = directory
            .join(&session, "Projetos", &history, 50, DEADLINE)
            .await;

        assert!(matches!(result, Err(BrokerError::AccessDenied(_))));
        assert_eq!(directory.get("Projetos").unwrap().member_count(), 0);
        assert!(session.current_room().is_none());
        assert_eq!(store.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_room_is_denied() {
        let registry = SessionRegistry::new();
        let directory = RoomDirectory::new(&room_names());
        let history: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());

        let (session, _rx) = session_allowed(&registry, &["Geral"]);
        let result = directory
            .join(&session, "Backstage", &history, 50, DEADLINE)
            .await;
        assert!(matches!(result, Err(BrokerError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_join_replays_history_and_adds_member() {
        let registry = SessionRegistry::new();
        let directory = RoomDirectory::new(&room_names());
        let store = MemoryMessageStore::new();
        store.append(message("Geral", "first")).await.unwrap();
        store.append(message("Geral", "second")).await.unwrap();
        store.append(message("Projetos", "other room")).await.unwrap();
        let history: Arc<dyn MessageStore> = Arc::new(store);

        let (session, _rx) = session_allowed(&registry, &["Geral"]);
        let (replay, previous) = directory
            .join(&session, "Geral", &history, 50, DEADLINE)
            .await
            .unwrap();

        assert!(previous.is_none());
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].text, "first");
        assert!(replay.iter().all(|m| m.room == "Geral"));
        assert!(directory.get("Geral").unwrap().contains(session.id()));
        assert_eq!(session.current_room().as_deref(), Some("Geral"));
    }

    #[tokio::test]
    async fn test_join_switches_rooms() {
        let registry = SessionRegistry::new();
        let directory = RoomDirectory::new(&room_names());
        let history: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());

        let (session, _rx) = session_allowed(&registry, &["Geral", "Projetos"]);
        directory
            .join(&session, "Geral", &history, 50, DEADLINE)
            .await
            .unwrap();
        let (_, previous) = directory
            .join(&session, "Projetos", &history, 50, DEADLINE)
            .await
            .unwrap();

        // Single-room-at-a-time: the old membership is gone.
        assert_eq!(previous.unwrap().name(), "Geral");
        assert_eq!(directory.get("Geral").unwrap().member_count(), 0);
        assert!(directory.get("Projetos").unwrap().contains(session.id()));
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent() {
        let registry = SessionRegistry::new();
        let directory = RoomDirectory::new(&room_names());
        let history: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());

        let (session, _rx) = session_allowed(&registry, &["Geral"]);
        directory
            .join(&session, "Geral", &history, 50, DEADLINE)
            .await
            .unwrap();
        let (_, previous) = directory
            .join(&session, "Geral", &history, 50, DEADLINE)
            .await
            .unwrap();

        assert!(previous.is_none());
        assert_eq!(directory.get("Geral").unwrap().member_count(), 1);
    }

    #[tokio::test]
    async fn test_members_of_snapshots_current_membership() {
        let registry = SessionRegistry::new();
        let directory = RoomDirectory::new(&room_names());
        let history: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());

        let (alice, _a_rx) = session_allowed(&registry, &["Geral"]);
        let (bob, _b_rx) = session_allowed(&registry, &["Geral"]);
        directory.join(&alice, "Geral", &history, 50, DEADLINE).await.unwrap();
        directory.join(&bob, "Geral", &history, 50, DEADLINE).await.unwrap();

        let members = directory.members_of("Geral");
        assert_eq!(members.len(), 2);
        assert!(directory.members_of("Projetos").is_empty());
        assert!(directory.members_of("Backstage").is_empty());
    }

    #[tokio::test]
    async fn test_leave_without_room_is_noop() {
        let registry = SessionRegistry::new();
        let directory = RoomDirectory::new(&room_names());
        let (session, _rx) = session_allowed(&registry, &["Geral"]);

        assert!(directory.leave(&session).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let registry = SessionRegistry::new();
        let directory = RoomDirectory::new(&room_names());
        let history: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());

        let (alice, mut alice_rx) = session_allowed(&registry, &["Geral"]);
        let (bob, mut bob_rx) = session_allowed(&registry, &["Geral"]);
        directory.join(&alice, "Geral", &history, 50, DEADLINE).await.unwrap();
        directory.join(&bob, "Geral", &history, 50, DEADLINE).await.unwrap();

        let room = directory.get("Geral").unwrap();
        room.broadcast_except(alice.id(), &ServerMessage::CallEnded);

        assert!(matches!(bob_rx.try_recv(), Ok(ServerMessage::CallEnded)));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_access_is_idempotent() {
        let directory = RoomDirectory::new(&room_names());
        let store = MemoryUserStore::new();
        store
            .create(UserRecord::new(
                "alice".to_string(),
                "pw".to_string(),
                "Alice".to_string(),
                "Silva".to_string(),
                None,
                "Geral",
            ))
            .await
            .unwrap();
        let users: Arc<dyn UserStore> = Arc::new(store);

        directory
            .request_access("alice", "Projetos", &users, DEADLINE)
            .await
            .unwrap();
        directory
            .request_access("alice", "Projetos", &users, DEADLINE)
            .await
            .unwrap();

        let record = users.get("alice").await.unwrap().unwrap();
        assert_eq!(record.pending_requests, vec!["Projetos".to_string()]);

        // Requesting an already-allowed room queues nothing.
        directory
            .request_access("alice", "Geral", &users, DEADLINE)
            .await
            .unwrap();
        let record = users.get("alice").await.unwrap().unwrap();
        assert_eq!(record.pending_requests.len(), 1);
    }
}
