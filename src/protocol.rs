//! Wire Protocol
//!
//! Defines the event format exchanged between client and broker: JSON
//! payloads tagged by event type, framed with a 4-byte length prefix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file attached to a chat message. The broker carries the base64
/// content verbatim; it never decodes or inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub content_base64: String,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub room: String,
    pub author: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
}

/// Profile snapshot returned on successful authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
    pub is_admin: bool,
    pub allowed_rooms: Vec<String>,
}

/// One row of the admin roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub allowed_rooms: Vec<String>,
    pub pending_requests: Vec<String>,
}

/// Grant or revoke, as sent by the admin panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    Grant,
    Revoke,
}

/// Events consumed by the broker (client -> server).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        username: String,
        password: String,
        first_name: String,
        last_name: String,
        #[serde(default)]
        phone_number: Option<String>,
    },
    Login {
        username: String,
        password: String,
    },
    Logout,
    Join {
        room: String,
    },
    Post {
        #[serde(default)]
        text: String,
        #[serde(default)]
        attachment: Option<Attachment>,
    },

    // Call signaling, scoped implicitly to the sender's current room.
    // Payloads are opaque to the broker.
    Offer {
        payload: serde_json::Value,
    },
    Answer {
        payload: serde_json::Value,
    },
    Candidate {
        payload: serde_json::Value,
    },
    EndCall,

    RequestAccess {
        room: String,
    },
    UpdatePhone {
        #[serde(default)]
        phone_number: Option<String>,
    },
    DeleteAccount,

    AdminListUsers,
    AdminSetPermission {
        username: String,
        room: String,
        action: PermissionAction,
    },
    AdminDeleteUser {
        username: String,
    },
}

/// Events produced by the broker (server -> client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk {
        profile: Profile,
    },
    /// History replay, sent only to the joining connection.
    History {
        room: String,
        messages: Vec<Message>,
    },
    Message {
        message: Message,
    },

    // Relayed signaling envelopes.
    Offer {
        from: String,
        payload: serde_json::Value,
    },
    Answer {
        from: String,
        payload: serde_json::Value,
    },
    Candidate {
        from: String,
        payload: serde_json::Value,
    },
    CallEnded,

    PermissionsUpdated {
        username: String,
        allowed_rooms: Vec<String>,
    },
    UsersRoster {
        users: Vec<UserSummary>,
    },
    ForcedLogout {
        username: String,
    },
    AccessRequested {
        room: String,
    },
    ProfileUpdated,
    AccountDeleted,

    Error {
        kind: String,
        message: String,
    },
}

impl ClientMessage {
    /// Deserialize an event from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl ServerMessage {
    /// Serialize the event to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Create a framed event with length prefix (4 bytes, big-endian)
    pub fn to_framed(&self) -> Result<Vec<u8>, serde_json::Error> {
        let data = self.to_bytes()?;
        let len = (data.len() as u32).to_be_bytes();
        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&len);
        framed.extend_from_slice(&data);
        Ok(framed)
    }
}
