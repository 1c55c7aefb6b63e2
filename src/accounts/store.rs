//! Storage seams for accounts, identities and sessions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::{Account, Facility, LinkedIdentity};

/// Uniqueness rule a write ran into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constraint {
    /// `accounts.name`
    Handle,
    /// `linked_identities (provider, uid)`
    Identity,
    /// `sessions.session_hash`
    Session,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle => f.write_str("account name"),
            Self::Identity => f.write_str("provider identity"),
            Self::Session => f.write_str("session"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} already exists")]
    UniqueViolation(Constraint),
    #[error("record not found")]
    NotFound,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Account-and-identity store.
///
/// Implementations must reject duplicate handles and duplicate
/// `(provider, uid)` pairs atomically with the write that would introduce
/// them.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Short backend name reported by the health endpoint.
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    /// Owner of the identity, matched exactly on both fields.
    async fn find_by_identity(&self, provider: &str, uid: &str) -> StoreResult<Option<Account>>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Account>>;

    async fn find_by_handle(&self, name: &str) -> StoreResult<Option<Account>>;

    /// All accounts ordered by handle.
    async fn list(&self) -> StoreResult<Vec<Account>>;

    /// Insert the account together with its identities and facilities.
    async fn create(&self, account: &Account) -> StoreResult<()>;

    /// [`AccountStore::create`] plus the local-credential record for the
    /// account's handle, committed as one write.
    async fn create_local(&self, account: &Account, record: &[u8]) -> StoreResult<()>;

    async fn attach_identity(&self, account_id: Uuid, identity: &LinkedIdentity)
        -> StoreResult<()>;

    async fn detach_identity(&self, account_id: Uuid, identity: &LinkedIdentity)
        -> StoreResult<()>;

    /// Add or replace a facility by name.
    async fn grant(&self, account_id: Uuid, facility: &Facility) -> StoreResult<()>;

    /// Set the confirmation timestamp unless one is already recorded.
    async fn confirm_email(&self, account_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    /// Delete the account, its identities, its sessions and the local
    /// credential stored under its handle.
    async fn destroy(&self, account_id: Uuid) -> StoreResult<()>;

    /// Record kept by the local-credential identity provider, keyed by handle.
    async fn put_local_credential(&self, name: &str, record: &[u8]) -> StoreResult<()>;

    async fn has_local_credential(&self, name: &str) -> StoreResult<bool>;
}

/// Server-side half of the session cookie.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(
        &self,
        account_id: Uuid,
        session_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Account id for an unexpired session.
    async fn lookup_session(&self, session_hash: &[u8]) -> StoreResult<Option<Uuid>>;

    async fn delete_session(&self, session_hash: &[u8]) -> StoreResult<()>;
}
