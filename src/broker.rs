//! Broker Dispatch
//!
//! The connection-facing surface of the coordinator: every consumed event
//! maps to one typed handler returning a `Result`, and every error is
//! recovered here into an `error` event for the originating connection.
//! One connection's failure never reaches another connection's rooms.

use std::sync::Arc;
use std::time::Duration;

use crate::admin::AdminHandler;
use crate::config::ServerConfig;
use crate::error::BrokerError;
use crate::history::MessageStore;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::RoomDirectory;
use crate::router::MessageRouter;
use crate::session::{Session, SessionRegistry};
use crate::signaling::{EnvelopeKind, SignalingRelay};
use crate::store::{bounded, UserRecord, UserStore, ROOT_ADMIN};

/// The room session coordinator: registry, directory, router, relay and
/// admin handler behind one dispatch entry point.
pub struct Broker {
    registry: Arc<SessionRegistry>,
    rooms: Arc<RoomDirectory>,
    users: Arc<dyn UserStore>,
    history: Arc<dyn MessageStore>,
    router: MessageRouter,
    relay: Arc<SignalingRelay>,
    admin: AdminHandler,
    history_window: usize,
    deadline: Duration,
    default_room: String,
}

impl Broker {
    pub fn new(
        config: &ServerConfig,
        users: Arc<dyn UserStore>,
        history: Arc<dyn MessageStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let rooms = Arc::new(RoomDirectory::new(&config.rooms));
        let relay = Arc::new(SignalingRelay::new(rooms.clone()));
        let deadline = config.adapter_timeout();

        let router = MessageRouter::new(rooms.clone(), history.clone(), deadline);
        let admin = AdminHandler::new(
            users.clone(),
            registry.clone(),
            rooms.clone(),
            relay.clone(),
            deadline,
        );

        Self {
            registry,
            rooms,
            users,
            history,
            router,
            relay,
            admin,
            history_window: config.history_window,
            deadline,
            default_room: config.default_room().to_string(),
        }
    }

    /// Create a session for a freshly accepted connection.
    pub fn connect(
        &self,
        outbound: tokio::sync::mpsc::UnboundedSender<ServerMessage>,
    ) -> Arc<Session> {
        self.registry.register(outbound)
    }

    /// Connection closed: synthesize call teardown, leave the room, drop
    /// the session. Not an error path.
    pub fn disconnect(&self, session: &Arc<Session>) {
        self.teardown_membership(session);
        self.registry.deauthenticate(session);
        self.registry.unregister(session);
        log::info!("Session {} disconnected", session.id());
    }

    /// Route one consumed event to its handler. Errors become an `error`
    /// event for this connection only.
    pub async fn dispatch(&self, session: &Arc<Session>, event: ClientMessage) {
        let result = match event {
            ClientMessage::Register {
                username,
                password,
                first_name,
                last_name,
                phone_number,
            } => {
                self.handle_register(session, username, password, first_name, last_name, phone_number)
                    .await
            }
            ClientMessage::Login { username, password } => {
                self.handle_login(session, &username, &password).await
            }
            ClientMessage::Logout => {
                self.teardown_membership(session);
                self.registry.deauthenticate(session);
                Ok(())
            }
            ClientMessage::Join { room } => self.handle_join(session, &room).await,
            ClientMessage::Post { text, attachment } => {
                self.router.post(session, text, attachment).await
            }
            ClientMessage::Offer { payload } => {
                self.relay.relay(session, EnvelopeKind::Offer, payload)
            }
            ClientMessage::Answer { payload } => {
                self.relay.relay(session, EnvelopeKind::Answer, payload)
            }
            ClientMessage::Candidate { payload } => {
                self.relay.relay(session, EnvelopeKind::Candidate, payload)
            }
            ClientMessage::EndCall => {
                self.relay
                    .relay(session, EnvelopeKind::EndCall, serde_json::Value::Null)
            }
            ClientMessage::RequestAccess { room } => {
                self.handle_request_access(session, &room).await
            }
            ClientMessage::UpdatePhone { phone_number } => {
                self.handle_update_phone(session, phone_number).await
            }
            ClientMessage::DeleteAccount => self.handle_delete_account(session).await,
            ClientMessage::AdminListUsers => match self.admin.list_users(session).await {
                Ok(users) => {
                    session.send(ServerMessage::UsersRoster { users });
                    Ok(())
                }
                Err(err) => Err(err),
            },
            ClientMessage::AdminSetPermission {
                username,
                room,
                action,
            } => match self
                .admin
                .set_permission(session, &username, &room, action)
                .await
            {
                Ok(users) => {
                    session.send(ServerMessage::UsersRoster { users });
                    Ok(())
                }
                Err(err) => Err(err),
            },
            ClientMessage::AdminDeleteUser { username } => {
                match self.admin.delete_user(session, &username).await {
                    Ok(users) => {
                        session.send(ServerMessage::UsersRoster { users });
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        };

        if let Err(err) = result {
            log::debug!("Session {} request failed: {}", session.id(), err);
            session.send(ServerMessage::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            });
        }
    }

    fn signed_in(session: &Session) -> Result<String, BrokerError> {
        session
            .username()
            .ok_or_else(|| BrokerError::Auth("not signed in".to_string()))
    }

    fn teardown_membership(&self, session: &Arc<Session>) {
        if let Some(room) = self.rooms.leave(session) {
            self.relay.handle_departure(session, &room);
        }
    }

    async fn handle_register(
        &self,
        session: &Arc<Session>,
        username: String,
        password: String,
        first_name: String,
        last_name: String,
        phone_number: Option<String>,
    ) -> Result<(), BrokerError> {
        if session.username().is_some() {
            return Err(BrokerError::Auth("already signed in".to_string()));
        }
        if username.is_empty() || password.is_empty() || first_name.is_empty() || last_name.is_empty()
        {
            return Err(BrokerError::Auth("missing required fields".to_string()));
        }
        if username == ROOT_ADMIN {
            return Err(BrokerError::Auth("username already taken".to_string()));
        }

        let record = UserRecord::new(
            username.clone(),
            password.clone(),
            first_name,
            last_name,
            phone_number,
            &self.default_room,
        );
        bounded(self.deadline, "user create", self.users.create(record)).await?;
        log::info!("Registered new user {username}");

        // Registration doubles as the first login.
        self.handle_login(session, &username, &password).await
    }

    async fn handle_login(
        &self,
        session: &Arc<Session>,
        username: &str,
        password: &str,
    ) -> Result<(), BrokerError> {
        let profile = self
            .registry
            .authenticate(session, username, password, &self.users, self.deadline)
            .await?;
        session.send(ServerMessage::AuthOk { profile });
        Ok(())
    }

    async fn handle_join(&self, session: &Arc<Session>, room: &str) -> Result<(), BrokerError> {
        Self::signed_in(session)?;

        let (messages, previous) = self
            .rooms
            .join(session, room, &self.history, self.history_window, self.deadline)
            .await?;
        if let Some(previous) = previous {
            self.relay.handle_departure(session, &previous);
        }

        session.send(ServerMessage::History {
            room: room.to_string(),
            messages,
        });
        Ok(())
    }

    async fn handle_request_access(
        &self,
        session: &Arc<Session>,
        room: &str,
    ) -> Result<(), BrokerError> {
        let username = Self::signed_in(session)?;
        self.rooms
            .request_access(&username, room, &self.users, self.deadline)
            .await?;
        session.send(ServerMessage::AccessRequested {
            room: room.to_string(),
        });
        Ok(())
    }

    async fn handle_update_phone(
        &self,
        session: &Arc<Session>,
        phone_number: Option<String>,
    ) -> Result<(), BrokerError> {
        let username = Self::signed_in(session)?;

        let mut record = bounded(self.deadline, "user lookup", self.users.get(&username))
            .await?
            .ok_or_else(|| BrokerError::Persistence("unknown user".to_string()))?;
        record.phone_number = phone_number;
        bounded(self.deadline, "user update", self.users.update(record)).await?;

        session.send(ServerMessage::ProfileUpdated);
        Ok(())
    }

    async fn handle_delete_account(&self, session: &Arc<Session>) -> Result<(), BrokerError> {
        let username = Self::signed_in(session)?;
        if username == ROOT_ADMIN {
            return Err(BrokerError::Forbidden);
        }

        bounded(self.deadline, "user delete", self.users.delete(&username)).await?;
        log::info!("User {username} deleted their account");

        self.teardown_membership(session);
        self.registry.deauthenticate(session);
        session.send(ServerMessage::AccountDeleted);
        Ok(())
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("rooms", &self.rooms)
            .field("history_window", &self.history_window)
            .finish()
    }
}
