//! Broker Errors
//!
//! Error taxonomy for the room session coordinator. Every variant is
//! recovered at the connection boundary and turned into an `error` event
//! for the originating connection; none of them tears down the broker.

/// Errors surfaced to a single connection.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The room is not in the caller's allowed-room set.
    #[error("access to room \"{0}\" denied")]
    AccessDenied(String),

    /// A post or signal was attempted without an active room.
    #[error("not in a room")]
    NotInRoom,

    /// A non-admin session invoked an admin command.
    #[error("admin privileges required")]
    Forbidden,

    /// A post carried neither text nor an attachment.
    #[error("message needs text or an attachment")]
    EmptyMessage,

    /// An adapter write or read failed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// An adapter call exceeded its deadline.
    #[error("{0} timed out")]
    AdapterTimeout(&'static str),

    /// Login or registration failed.
    #[error("{0}")]
    Auth(String),
}

impl BrokerError {
    /// Stable kind tag carried in the `error` event payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AccessDenied(_) => "access_denied",
            Self::NotInRoom => "not_in_room",
            Self::Forbidden => "forbidden",
            Self::EmptyMessage => "empty_message",
            Self::Persistence(_) => "persistence_error",
            Self::AdapterTimeout(_) => "adapter_timeout",
            Self::Auth(_) => "auth_error",
        }
    }
}
