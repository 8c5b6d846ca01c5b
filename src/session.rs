//! Session Registry
//!
//! One [`Session`] per live connection: its outbound channel, its
//! authenticated identity and its current room. The registry indexes
//! sessions by id and by username so admin commands can reach a live
//! target.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::protocol::{Profile, ServerMessage};
use crate::store::{bounded, UserStore};

/// Mutable per-connection state, guarded by the session's own lock.
#[derive(Debug, Default)]
struct AuthState {
    username: Option<String>,
    current_room: Option<String>,
    is_admin: bool,
    /// Cached allowed-room snapshot, refreshed by admin pushes.
    allowed_rooms: Vec<String>,
}

/// Server-side state for one live connection.
pub struct Session {
    id: String,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    state: RwLock<AuthState>,
}

impl Session {
    fn new(outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            outbound,
            state: RwLock::new(AuthState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue an event for this connection. A closed channel means the
    /// connection is going away; the disconnect path cleans up.
    pub fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            log::debug!("Session {} dropped outbound event (disconnecting)", self.id);
        }
    }

    pub fn username(&self) -> Option<String> {
        self.state.read().username.clone()
    }

    pub fn current_room(&self) -> Option<String> {
        self.state.read().current_room.clone()
    }

    pub fn is_admin(&self) -> bool {
        self.state.read().is_admin
    }

    pub fn allowed_rooms(&self) -> Vec<String> {
        self.state.read().allowed_rooms.clone()
    }

    /// Permission check against the cached snapshot.
    pub fn may_access(&self, room: &str) -> bool {
        self.state.read().allowed_rooms.iter().any(|r| r == room)
    }

    pub(crate) fn set_current_room(&self, room: Option<String>) {
        self.state.write().current_room = room;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("username", &state.username)
            .field("current_room", &state.current_room)
            .finish()
    }
}

/// Maps live connections to their sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    by_username: RwLock<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_username: RwLock::new(HashMap::new()),
        }
    }

    /// Create an unauthenticated session for a new connection.
    pub fn register(&self, outbound: mpsc::UnboundedSender<ServerMessage>) -> Arc<Session> {
        let session = Arc::new(Session::new(outbound));
        self.sessions
            .write()
            .insert(session.id().to_string(), session.clone());
        session
    }

    /// Forget a connection entirely. Room membership and call cleanup
    /// happen before this, at the broker's disconnect path.
    pub fn unregister(&self, session: &Session) {
        if let Some(username) = session.username() {
            self.by_username.write().remove(&username);
        }
        self.sessions.write().remove(session.id());
    }

    /// Check a credential against the user store and bind the session to
    /// the account. The failure message never reveals whether the username
    /// exists.
    pub async fn authenticate(
        &self,
        session: &Session,
        username: &str,
        password: &str,
        users: &Arc<dyn UserStore>,
        deadline: Duration,
    ) -> Result<Profile, BrokerError> {
        if session.username().is_some() {
            return Err(BrokerError::Auth("already signed in".to_string()));
        }

        let record = bounded(deadline, "user lookup", users.get(username)).await?;
        let record = match record {
            Some(record) if record.password == password => record,
            _ => return Err(BrokerError::Auth("unknown user or bad credential".to_string())),
        };

        {
            let mut index = self.by_username.write();
            if index.contains_key(&record.username) {
                return Err(BrokerError::Auth("account already signed in".to_string()));
            }
            index.insert(record.username.clone(), session.id().to_string());
        }

        let mut state = session.state.write();
        state.username = Some(record.username.clone());
        state.is_admin = record.is_admin;
        state.allowed_rooms = record.allowed_rooms.clone();

        log::info!("Session {} authenticated as {}", session.id(), record.username);

        Ok(Profile {
            username: record.username,
            first_name: record.first_name,
            last_name: record.last_name,
            phone_number: record.phone_number,
            is_admin: record.is_admin,
            allowed_rooms: record.allowed_rooms,
        })
    }

    /// Clear the session's identity and username binding. The session stays
    /// registered until its connection closes.
    pub fn deauthenticate(&self, session: &Session) {
        let mut state = session.state.write();
        if let Some(username) = state.username.take() {
            self.by_username.write().remove(&username);
            log::info!("Session {} signed out of {}", session.id(), username);
        }
        state.current_room = None;
        state.is_admin = false;
        state.allowed_rooms.clear();
    }

    /// Replace the session's cached allowed-room snapshot. Returns the
    /// current room when the new set no longer permits it, so the caller
    /// can force the leave.
    pub fn refresh_permissions(
        &self,
        session: &Session,
        allowed_rooms: Vec<String>,
    ) -> Option<String> {
        let mut state = session.state.write();
        state.allowed_rooms = allowed_rooms;
        match &state.current_room {
            Some(room) if !state.allowed_rooms.iter().any(|r| r == room) => {
                Some(room.clone())
            }
            _ => None,
        }
    }

    /// The live session bound to `username`, if any.
    pub fn find_by_username(&self, username: &str) -> Option<Arc<Session>> {
        let id = self.by_username.read().get(username).cloned()?;
        self.sessions.read().get(&id).cloned()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
