//! Admin Command Handler
//!
//! Grants and revokes room permissions, lists the roster and deletes
//! accounts. Mutations go through the user store first, then the live
//! session (if any) is pushed a refresh -- the cached snapshot is never
//! left to go stale silently.

use std::sync::Arc;
use std::time::Duration;

use crate::error::BrokerError;
use crate::protocol::{PermissionAction, ServerMessage, UserSummary};
use crate::room::RoomDirectory;
use crate::session::{Session, SessionRegistry};
use crate::signaling::SignalingRelay;
use crate::store::{bounded, UserStore, ROOT_ADMIN};

pub struct AdminHandler {
    users: Arc<dyn UserStore>,
    registry: Arc<SessionRegistry>,
    rooms: Arc<RoomDirectory>,
    relay: Arc<SignalingRelay>,
    deadline: Duration,
}

impl AdminHandler {
    pub fn new(
        users: Arc<dyn UserStore>,
        registry: Arc<SessionRegistry>,
        rooms: Arc<RoomDirectory>,
        relay: Arc<SignalingRelay>,
        deadline: Duration,
    ) -> Self {
        Self {
            users,
            registry,
            rooms,
            relay,
            deadline,
        }
    }

    fn require_admin(caller: &Session) -> Result<(), BrokerError> {
        if caller.is_admin() {
            Ok(())
        } else {
            Err(BrokerError::Forbidden)
        }
    }

    /// Roster of every account except the reserved root admin.
    pub async fn list_users(&self, caller: &Session) -> Result<Vec<UserSummary>, BrokerError> {
        Self::require_admin(caller)?;
        self.roster().await
    }

    /// Grant or revoke one room for one user, then push the refresh to the
    /// target's live session. Returns the updated roster for the caller's
    /// panel.
    pub async fn set_permission(
        &self,
        caller: &Session,
        target: &str,
        room: &str,
        action: PermissionAction,
    ) -> Result<Vec<UserSummary>, BrokerError> {
        Self::require_admin(caller)?;
        if self.rooms.get(room).is_none() {
            return Err(BrokerError::AccessDenied(room.to_string()));
        }

        let mut record = bounded(self.deadline, "user lookup", self.users.get(target))
            .await?
            .ok_or_else(|| BrokerError::Persistence("unknown user".to_string()))?;

        match action {
            PermissionAction::Grant => {
                if !record.allowed_rooms.iter().any(|r| r == room) {
                    record.allowed_rooms.push(room.to_string());
                }
                // A grant settles the matching pending request.
                record.pending_requests.retain(|r| r != room);
            }
            PermissionAction::Revoke => {
                record.allowed_rooms.retain(|r| r != room);
            }
        }

        let allowed_rooms = record.allowed_rooms.clone();
        bounded(self.deadline, "user update", self.users.update(record)).await?;
        log::info!(
            "Admin {} set {:?} on room {} for {}",
            caller.username().unwrap_or_default(),
            action,
            room,
            target
        );

        if let Some(target_session) = self.registry.find_by_username(target) {
            self.push_refresh(&target_session, target, allowed_rooms);
        }

        self.roster().await
    }

    /// Delete an account. A live session is force-deauthenticated and told
    /// the account no longer exists.
    pub async fn delete_user(
        &self,
        caller: &Session,
        target: &str,
    ) -> Result<Vec<UserSummary>, BrokerError> {
        Self::require_admin(caller)?;
        if target == ROOT_ADMIN {
            return Err(BrokerError::Forbidden);
        }

        bounded(self.deadline, "user delete", self.users.delete(target)).await?;
        log::info!(
            "Admin {} deleted account {}",
            caller.username().unwrap_or_default(),
            target
        );

        if let Some(target_session) = self.registry.find_by_username(target) {
            if let Some(room) = self.rooms.leave(&target_session) {
                self.relay.handle_departure(&target_session, &room);
            }
            self.registry.deauthenticate(&target_session);
            target_session.send(ServerMessage::ForcedLogout {
                username: target.to_string(),
            });
        }

        self.roster().await
    }

    /// Apply a new allowed-room set to a live session, forcing it out of a
    /// room it may no longer access.
    fn push_refresh(&self, target: &Arc<Session>, username: &str, allowed_rooms: Vec<String>) {
        let revoked_current = self
            .registry
            .refresh_permissions(target, allowed_rooms.clone());

        if revoked_current.is_some() {
            if let Some(room) = self.rooms.leave(target) {
                self.relay.handle_departure(target, &room);
            }
        }

        target.send(ServerMessage::PermissionsUpdated {
            username: username.to_string(),
            allowed_rooms,
        });
    }

    async fn roster(&self) -> Result<Vec<UserSummary>, BrokerError> {
        let records = bounded(self.deadline, "user list", self.users.list()).await?;
        Ok(records
            .into_iter()
            .filter(|record| record.username != ROOT_ADMIN)
            .map(|record| UserSummary {
                username: record.username,
                first_name: record.first_name,
                last_name: record.last_name,
                allowed_rooms: record.allowed_rooms,
                pending_requests: record.pending_requests,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{MemoryMessageStore, MessageStore};
    use crate::signaling::EnvelopeKind;
    use crate::store::{MemoryUserStore, UserRecord};
    use tokio::sync::mpsc;

    const DEADLINE: Duration = Duration::from_secs(1);

    struct Fixture {
        registry: Arc<SessionRegistry>,
        rooms: Arc<RoomDirectory>,
        relay: Arc<SignalingRelay>,
        users: Arc<dyn UserStore>,
        history: Arc<dyn MessageStore>,
        admin: AdminHandler,
    }

    async fn fixture() -> Fixture {
        let room_names = vec!["Geral".to_string(), "Projetos".to_string()];
        let registry = Arc::new(SessionRegistry::new());
        let rooms = Arc::new(RoomDirectory::new(&room_names));
        let relay = Arc::new(SignalingRelay::new(rooms.clone()));

        let store = MemoryUserStore::new();
        store
            .create(UserRecord::root_admin("pw".to_string(), room_names.clone()))
            .await
            .unwrap();
        for name in ["alice", "bob"] {
            store
                .create(UserRecord::new(
                    name.to_string(),
                    "pw".to_string(),
                    name.to_string(),
                    "Teste".to_string(),
                    None,
                    "Geral",
                ))
                .await
                .unwrap();
        }
        let users: Arc<dyn UserStore> = Arc::new(store);

        let admin = AdminHandler::new(
            users.clone(),
            registry.clone(),
            rooms.clone(),
            relay.clone(),
            DEADLINE,
        );

        Fixture {
            registry,
            rooms,
            relay,
            users,
            history: Arc::new(MemoryMessageStore::new()),
            admin,
        }
    }

    async fn login(
        fx: &Fixture,
        name: &str,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = fx.registry.register(tx);
        fx.registry
            .authenticate(&session, name, "pw", &fx.users, DEADLINE)
            .await
            .unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn test_non_admin_is_forbidden() {
        let fx = fixture().await;
        let (alice, _rx) = login(&fx, "alice").await;

        assert!(matches!(
            fx.admin.list_users(&alice).await,
            Err(BrokerError::Forbidden)
        ));
        assert!(matches!(
            fx.admin
                .set_permission(&alice, "bob", "Projetos", PermissionAction::Grant)
                .await,
            Err(BrokerError::Forbidden)
        ));
        assert!(matches!(
            fx.admin.delete_user(&alice, "bob").await,
            Err(BrokerError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn test_roster_excludes_root_admin() {
        let fx = fixture().await;
        let (root, _rx) = login(&fx, ROOT_ADMIN).await;

        let roster = fx.admin.list_users(&root).await.unwrap();
        let names: Vec<&str> = roster.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_grant_clears_pending_and_refreshes_live_session() {
        let fx = fixture().await;
        let (root, _root_rx) = login(&fx, ROOT_ADMIN).await;
        let (alice, mut alice_rx) = login(&fx, "alice").await;

        fx.rooms
            .request_access("alice", "Projetos", &fx.users, DEADLINE)
            .await
            .unwrap();

        let roster = fx
            .admin
            .set_permission(&root, "alice", "Projetos", PermissionAction::Grant)
            .await
            .unwrap();

        let entry = roster.iter().find(|u| u.username == "alice").unwrap();
        assert!(entry.allowed_rooms.contains(&"Projetos".to_string()));
        assert!(entry.pending_requests.is_empty());

        // Live cache was refreshed and the target notified.
        assert!(alice.may_access("Projetos"));
        match alice_rx.try_recv() {
            Ok(ServerMessage::PermissionsUpdated { allowed_rooms, .. }) => {
                assert!(allowed_rooms.contains(&"Projetos".to_string()));
            }
            other => panic!("expected permissions_updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_revoking_current_room_forces_removal() {
        let fx = fixture().await;
        let (root, _root_rx) = login(&fx, ROOT_ADMIN).await;
        let (alice, mut alice_rx) = login(&fx, "alice").await;
        fx.rooms
            .join(&alice, "Geral", &fx.history, 50, DEADLINE)
            .await
            .unwrap();

        fx.admin
            .set_permission(&root, "alice", "Geral", PermissionAction::Revoke)
            .await
            .unwrap();

        let room = fx.rooms.get("Geral").unwrap();
        assert!(!room.contains(alice.id()));
        assert!(alice.current_room().is_none());
        assert!(matches!(
            alice_rx.try_recv(),
            Ok(ServerMessage::PermissionsUpdated { .. })
        ));

        // No further broadcasts reach the revoked member.
        room.broadcast_except("nobody", &ServerMessage::CallEnded);
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_revoke_mid_call_tears_call_down() {
        let fx = fixture().await;
        let (root, _root_rx) = login(&fx, ROOT_ADMIN).await;
        let (alice, _alice_rx) = login(&fx, "alice").await;
        let (bob, mut bob_rx) = login(&fx, "bob").await;
        fx.rooms
            .join(&alice, "Geral", &fx.history, 50, DEADLINE)
            .await
            .unwrap();
        fx.rooms
            .join(&bob, "Geral", &fx.history, 50, DEADLINE)
            .await
            .unwrap();
        fx.relay
            .relay(&alice, EnvelopeKind::Offer, serde_json::json!({"sdp": "v=0"}))
            .unwrap();
        bob_rx.try_recv().ok();

        fx.admin
            .set_permission(&root, "alice", "Geral", PermissionAction::Revoke)
            .await
            .unwrap();

        assert!(matches!(bob_rx.try_recv(), Ok(ServerMessage::CallEnded)));
    }

    #[tokio::test]
    async fn test_delete_user_forces_logout() {
        let fx = fixture().await;
        let (root, _root_rx) = login(&fx, ROOT_ADMIN).await;
        let (bob, mut bob_rx) = login(&fx, "bob").await;
        fx.rooms
            .join(&bob, "Geral", &fx.history, 50, DEADLINE)
            .await
            .unwrap();

        let roster = fx.admin.delete_user(&root, "bob").await.unwrap();

        assert!(roster.iter().all(|u| u.username != "bob"));
        assert!(!fx.rooms.get("Geral").unwrap().contains(bob.id()));
        assert!(bob.username().is_none());
        assert!(fx.registry.find_by_username("bob").is_none());
        assert!(matches!(
            bob_rx.try_recv(),
            Ok(ServerMessage::ForcedLogout { username }) if username == "bob"
        ));
        assert!(fx.users.get("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_root_admin_cannot_be_deleted() {
        let fx = fixture().await;
        let (root, _rx) = login(&fx, ROOT_ADMIN).await;

        let result = fx.admin.delete_user(&root, ROOT_ADMIN).await;
        assert!(matches!(result, Err(BrokerError::Forbidden)));
        assert!(fx.users.get(ROOT_ADMIN).await.unwrap().is_some());
    }
}
