//! CoLab Chat - Room Session Coordinator
//!
//! This library provides the core of a room-based communication broker:
//! session tracking, per-room access permissions, message history replay
//! and fan-out, and call-signaling relay between room occupants.

pub mod admin;
pub mod broker;
pub mod config;
pub mod error;
pub mod history;
pub mod protocol;
pub mod room;
pub mod router;
pub mod session;
pub mod signaling;
pub mod store;

pub use broker::Broker;
pub use config::ServerConfig;
pub use error::BrokerError;
pub use protocol::{ClientMessage, ServerMessage};
pub use room::{Room, RoomDirectory};
pub use session::{Session, SessionRegistry};
