//! Message Router
//!
//! Validates a post, persists it through the history adapter and fans it
//! out to the sender's room. Persistence failure is surfaced to the sender
//! as a non-fatal warning while the message is still delivered live: the
//! broker trades durability for responsiveness, never the other way
//! around.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BrokerError;
use crate::history::MessageStore;
use crate::protocol::{Attachment, Message, ServerMessage};
use crate::room::RoomDirectory;
use crate::session::Session;
use crate::store::bounded;

pub struct MessageRouter {
    rooms: Arc<RoomDirectory>,
    history: Arc<dyn MessageStore>,
    deadline: Duration,
}

impl MessageRouter {
    pub fn new(
        rooms: Arc<RoomDirectory>,
        history: Arc<dyn MessageStore>,
        deadline: Duration,
    ) -> Self {
        Self {
            rooms,
            history,
            deadline,
        }
    }

    /// Post a message to the sender's current room.
    ///
    /// The permission is re-verified against the cached snapshot at post
    /// time, not just at join time: a revoke that raced this post fails it
    /// before anything is persisted or broadcast. The sender is excluded
    /// from the fan-out; it already renders its own optimistic copy.
    pub async fn post(
        &self,
        session: &Arc<Session>,
        text: String,
        attachment: Option<Attachment>,
    ) -> Result<(), BrokerError> {
        let author = session
            .username()
            .ok_or_else(|| BrokerError::Auth("not signed in".to_string()))?;
        let room_name = session.current_room().ok_or(BrokerError::NotInRoom)?;

        if !session.may_access(&room_name) {
            return Err(BrokerError::AccessDenied(room_name));
        }
        if text.is_empty() && attachment.is_none() {
            return Err(BrokerError::EmptyMessage);
        }

        let message = Message {
            room: room_name.clone(),
            author,
            text,
            attachment,
            timestamp: Utc::now(),
        };

        // Append before fan-out, outside any room lock. A failed append is
        // logged and reported to the sender, but the live broadcast still
        // happens.
        if let Err(err) = bounded(
            self.deadline,
            "history append",
            self.history.append(message.clone()),
        )
        .await
        {
            log::warn!("Failed to persist message for room {room_name}: {err}");
            session.send(ServerMessage::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            });
        }

        let room = self.rooms.get(&room_name).ok_or(BrokerError::NotInRoom)?;
        room.broadcast_except(session.id(), &ServerMessage::Message { message });
        Ok(())
    }
}
