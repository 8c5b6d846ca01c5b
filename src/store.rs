//! User Store Adapter
//!
//! Thin interface to externally-owned user records. The broker only reads
//! records at login and permission-check time; writes go through explicit
//! registration, profile and admin commands.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::error::BrokerError;

/// Reserved root admin username. Never listed in rosters, never deletable.
pub const ROOT_ADMIN: &str = "admin";

/// A persisted user record, keyed by username.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
    pub is_admin: bool,
    pub allowed_rooms: Vec<String>,
    pub pending_requests: Vec<String>,
}

impl UserRecord {
    /// A fresh registrant: no admin flag, allowed into the default room only.
    pub fn new(
        username: String,
        password: String,
        first_name: String,
        last_name: String,
        phone_number: Option<String>,
        default_room: &str,
    ) -> Self {
        Self {
            username,
            password,
            first_name,
            last_name,
            phone_number,
            is_admin: false,
            allowed_rooms: vec![default_room.to_string()],
            pending_requests: Vec::new(),
        }
    }

    /// The reserved root admin account, allowed into every room.
    pub fn root_admin(password: String, rooms: Vec<String>) -> Self {
        Self {
            username: ROOT_ADMIN.to_string(),
            password,
            first_name: "Admin".to_string(),
            last_name: "Root".to_string(),
            phone_number: None,
            is_admin: true,
            allowed_rooms: rooms,
            pending_requests: Vec::new(),
        }
    }
}

/// Adapter-level errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("username already taken")]
    Duplicate,
    #[error("unknown user")]
    NotFound,
    #[error("backend failure: {0}")]
    Backend(String),
}

impl From<StoreError> for BrokerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => Self::Auth("username already taken".to_string()),
            other => Self::Persistence(other.to_string()),
        }
    }
}

/// Externally-owned user persistence: lookup/create/update/delete by
/// username.
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    async fn create(&self, record: UserRecord) -> Result<(), StoreError>;

    async fn get(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Replace the record stored under `record.username`.
    async fn update(&self, record: UserRecord) -> Result<(), StoreError>;

    async fn delete(&self, username: &str) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<UserRecord>, StoreError>;
}

/// Await an adapter call with the configured deadline. Elapsing the
/// deadline surfaces as a transient error instead of hanging the
/// connection.
pub async fn bounded<T, F>(
    limit: Duration,
    op: &'static str,
    fut: F,
) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(BrokerError::from),
        Err(_) => Err(BrokerError::AdapterTimeout(op)),
    }
}

/// In-memory user store, used by the server binary and tests.
#[derive(Default)]
pub struct MemoryUserStore {
    records: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, record: UserRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.username) {
            return Err(StoreError::Duplicate);
        }
        records.insert(record.username.clone(), record);
        Ok(())
    }

    async fn get(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.records.read().get(username).cloned())
    }

    async fn update(&self, record: UserRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        match records.get_mut(&record.username) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, username: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .remove(username)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> Result<Vec<UserRecord>, StoreError> {
        let mut records: Vec<UserRecord> =
            self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(records)
    }
}
