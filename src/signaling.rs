//! Signaling Relay
//!
//! Forwards call-setup envelopes (offer, answer, candidate, end-call) to
//! the other occupants of the sender's room. Payloads are opaque: the
//! relay never inspects SDP or candidate contents and performs no
//! sequencing validation.
//!
//! The relay does keep per-room call bookkeeping (`Idle -> OfferSent ->
//! Active -> Idle`) for one reason: a party that leaves the room or
//! disconnects mid-call cannot be trusted to send its own end-call, so
//! the relay synthesizes one to the remaining members.

use std::sync::Arc;

use crate::error::BrokerError;
use crate::room::{CallPhase, Room, RoomDirectory};
use crate::protocol::ServerMessage;
use crate::session::Session;

/// The four relayed envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Offer,
    Answer,
    Candidate,
    EndCall,
}

pub struct SignalingRelay {
    rooms: Arc<RoomDirectory>,
}

impl SignalingRelay {
    pub fn new(rooms: Arc<RoomDirectory>) -> Self {
        Self { rooms }
    }

    /// Relay an envelope to every other member of the sender's room.
    ///
    /// No two-party limit is enforced; with more than two occupants the
    /// envelope fans out to all of them and callers coordinate externally.
    pub fn relay(
        &self,
        session: &Arc<Session>,
        kind: EnvelopeKind,
        payload: serde_json::Value,
    ) -> Result<(), BrokerError> {
        let from = session
            .username()
            .ok_or_else(|| BrokerError::Auth("not signed in".to_string()))?;
        let room_name = session.current_room().ok_or(BrokerError::NotInRoom)?;
        let room = self.rooms.get(&room_name).ok_or(BrokerError::NotInRoom)?;

        {
            let mut call = room.call.write();
            match kind {
                EnvelopeKind::Offer => {
                    call.parties.insert(session.id().to_string());
                    if call.phase == CallPhase::Idle {
                        call.phase = CallPhase::OfferSent;
                    }
                }
                EnvelopeKind::Answer => {
                    call.parties.insert(session.id().to_string());
                    call.phase = CallPhase::Active;
                }
                EnvelopeKind::Candidate => {}
                EnvelopeKind::EndCall => call.reset(),
            }
        }

        let envelope = match kind {
            EnvelopeKind::Offer => ServerMessage::Offer { from, payload },
            EnvelopeKind::Answer => ServerMessage::Answer { from, payload },
            EnvelopeKind::Candidate => ServerMessage::Candidate { from, payload },
            EnvelopeKind::EndCall => ServerMessage::CallEnded,
        };

        log::debug!("Relaying {kind:?} envelope in room {room_name}");
        room.broadcast_except(session.id(), &envelope);
        Ok(())
    }

    /// Call teardown for a session that left `room` (room switch,
    /// logout or disconnect). Only the departure of an engaged party --
    /// one that sent the offer or the answer -- synthesizes an end-call;
    /// a bystander leaving changes nothing.
    pub fn handle_departure(&self, session: &Session, room: &Room) {
        let engaged = {
            let mut call = room.call.write();
            let engaged =
                call.phase != CallPhase::Idle && call.parties.contains(session.id());
            if engaged {
                call.reset();
            }
            engaged
        };

        if engaged {
            log::info!(
                "Synthesizing end-call in room {} after {} departed",
                room.name(),
                session.id()
            );
            room.broadcast_except(session.id(), &ServerMessage::CallEnded);
        }
    }
}
