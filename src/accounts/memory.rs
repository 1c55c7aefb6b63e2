//! In-process store used when no database is configured and in tests.
//!
//! Every write takes the single state lock, so the uniqueness checks and the
//! insert they guard happen as one step.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    store::{AccountStore, Constraint, SessionStore, StoreError, StoreResult},
    Account, Facility, LinkedIdentity,
};

#[derive(Debug, Default)]
struct State {
    accounts: Vec<Account>,
    local_credentials: HashMap<String, Vec<u8>>,
    sessions: HashMap<Vec<u8>, (Uuid, DateTime<Utc>)>,
}

impl State {
    fn account_mut(&mut self, id: Uuid) -> StoreResult<&mut Account> {
        self.accounts
            .iter_mut()
            .find(|account| account.id == id)
            .ok_or(StoreError::NotFound)
    }

    fn check_new_account(&self, account: &Account) -> StoreResult<()> {
        if self.accounts.iter().any(|existing| existing.id == account.id) {
            return Err(StoreError::Backend(anyhow!(
                "account id {} already exists",
                account.id
            )));
        }
        if self.accounts.iter().any(|existing| existing.name == account.name) {
            return Err(StoreError::UniqueViolation(Constraint::Handle));
        }
        for (index, identity) in account.identities.iter().enumerate() {
            let repeated = account.identities[..index].contains(identity);
            if repeated || self.identity_taken(identity) {
                return Err(StoreError::UniqueViolation(Constraint::Identity));
            }
        }
        Ok(())
    }

    fn identity_taken(&self, identity: &LinkedIdentity) -> bool {
        self.accounts.iter().any(|account| {
            account
                .identity(&identity.provider, &identity.uid)
                .is_some()
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn find_by_identity(&self, provider: &str, uid: &str) -> StoreResult<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .iter()
            .find(|account| account.identity(provider, uid).is_some())
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state.accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn find_by_handle(&self, name: &str) -> StoreResult<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state.accounts.iter().find(|a| a.name == name).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts = state.accounts.clone();
        accounts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(accounts)
    }

    #[instrument(skip(self, account), fields(name = %account.name))]
    async fn create(&self, account: &Account) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check_new_account(account)?;
        state.accounts.push(account.clone());
        debug!("account created");
        Ok(())
    }

    #[instrument(skip(self, account, record), fields(name = %account.name))]
    async fn create_local(&self, account: &Account, record: &[u8]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check_new_account(account)?;
        if state.local_credentials.contains_key(&account.name) {
            return Err(StoreError::UniqueViolation(Constraint::Handle));
        }
        state.accounts.push(account.clone());
        state
            .local_credentials
            .insert(account.name.clone(), record.to_vec());
        debug!("local account created");
        Ok(())
    }

    async fn attach_identity(
        &self,
        account_id: Uuid,
        identity: &LinkedIdentity,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.identity_taken(identity) {
            return Err(StoreError::UniqueViolation(Constraint::Identity));
        }
        state.account_mut(account_id)?.identities.push(identity.clone());
        Ok(())
    }

    async fn detach_identity(
        &self,
        account_id: Uuid,
        identity: &LinkedIdentity,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;
        let before = account.identities.len();
        account.identities.retain(|linked| linked != identity);
        if account.identities.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn grant(&self, account_id: Uuid, facility: &Facility) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.account_mut(account_id)?.grant(facility.clone());
        Ok(())
    }

    async fn confirm_email(&self, account_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;
        account.email_confirmed_at.get_or_insert(at);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy(&self, account_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let index = state
            .accounts
            .iter()
            .position(|account| account.id == account_id)
            .ok_or(StoreError::NotFound)?;
        let account = state.accounts.remove(index);
        state.local_credentials.remove(&account.name);
        state.sessions.retain(|_, (owner, _)| *owner != account_id);
        debug!(name = %account.name, "account destroyed");
        Ok(())
    }

    async fn put_local_credential(&self, name: &str, record: &[u8]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .local_credentials
            .insert(name.to_string(), record.to_vec());
        Ok(())
    }

    async fn has_local_credential(&self, name: &str) -> StoreResult<bool> {
        let state = self.state.lock().await;
        Ok(state.local_credentials.contains_key(name))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(
        &self,
        account_id: Uuid,
        session_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(session_hash) {
            return Err(StoreError::UniqueViolation(Constraint::Session));
        }
        if !state.accounts.iter().any(|account| account.id == account_id) {
            return Err(StoreError::NotFound);
        }
        state
            .sessions
            .insert(session_hash.to_vec(), (account_id, expires_at));
        Ok(())
    }

    async fn lookup_session(&self, session_hash: &[u8]) -> StoreResult<Option<Uuid>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match state.sessions.get(session_hash).copied() {
            Some((account_id, expires_at)) if expires_at > now => Ok(Some(account_id)),
            Some(_) => {
                state.sessions.remove(session_hash);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete_session(&self, session_hash: &[u8]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.sessions.remove(session_hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Access;
    use chrono::Duration;

    fn twitter(uid: &str) -> LinkedIdentity {
        LinkedIdentity::new("twitter", uid)
    }

    #[tokio::test]
    async fn create_rejects_duplicate_handle() {
        let store = MemoryStore::new();
        assert!(store.create(&Account::new("Alice")).await.is_ok());
        let result = store.create(&Account::new("Alice")).await;
        assert!(matches!(
            result,
            Err(StoreError::UniqueViolation(Constraint::Handle))
        ));
    }

    #[tokio::test]
    async fn reused_id_is_not_a_handle_conflict() {
        let store = MemoryStore::new();
        let alice = Account::new("Alice");
        assert!(store.create(&alice).await.is_ok());

        let mut other = Account::new("Bob");
        other.id = alice.id;
        let result = store.create(&other).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert!(matches!(store.find_by_handle("Bob").await, Ok(None)));
    }

    #[tokio::test]
    async fn create_local_writes_account_and_credential_together() {
        let store = MemoryStore::new();
        let mut carol = Account::new("carol");
        carol.add_identity(LinkedIdentity::new("identity", "carol"));
        assert!(store.create_local(&carol, b"record").await.is_ok());
        assert!(matches!(store.has_local_credential("carol").await, Ok(true)));

        // Taken handle: no credential lands for the second attempt.
        let dave = Account::new("dave");
        assert!(store.create(&dave).await.is_ok());
        let result = store.create_local(&Account::new("dave"), b"record").await;
        assert!(matches!(
            result,
            Err(StoreError::UniqueViolation(Constraint::Handle))
        ));
        assert!(matches!(store.has_local_credential("dave").await, Ok(false)));

        // Leftover credential: no account lands either.
        assert!(store.put_local_credential("erin", b"old").await.is_ok());
        let result = store.create_local(&Account::new("erin"), b"new").await;
        assert!(matches!(
            result,
            Err(StoreError::UniqueViolation(Constraint::Handle))
        ));
        assert!(matches!(store.find_by_handle("erin").await, Ok(None)));
    }

    #[tokio::test]
    async fn identity_pair_is_unique_across_accounts() {
        let store = MemoryStore::new();
        let mut alice = Account::new("Alice");
        alice.add_identity(twitter("42"));
        assert!(store.create(&alice).await.is_ok());

        let mut bob = Account::new("Bob");
        bob.add_identity(twitter("42"));
        let result = store.create(&bob).await;
        assert!(matches!(
            result,
            Err(StoreError::UniqueViolation(Constraint::Identity))
        ));

        let bob = Account::new("Bob");
        assert!(store.create(&bob).await.is_ok());
        let result = store.attach_identity(bob.id, &twitter("42")).await;
        assert!(matches!(
            result,
            Err(StoreError::UniqueViolation(Constraint::Identity))
        ));
        assert!(store.attach_identity(bob.id, &twitter("43")).await.is_ok());
    }

    #[tokio::test]
    async fn find_by_identity_is_case_sensitive() {
        let store = MemoryStore::new();
        let mut alice = Account::new("Alice");
        alice.add_identity(twitter("abc"));
        assert!(store.create(&alice).await.is_ok());

        let found = store.find_by_identity("twitter", "abc").await.ok().flatten();
        assert_eq!(found.map(|a| a.id), Some(alice.id));
        let found = store.find_by_identity("Twitter", "abc").await.ok().flatten();
        assert!(found.is_none());
        let found = store.find_by_identity("twitter", "ABC").await.ok().flatten();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn detach_missing_identity_is_not_found() {
        let store = MemoryStore::new();
        let alice = Account::new("Alice");
        assert!(store.create(&alice).await.is_ok());
        let result = store.detach_identity(alice.id, &twitter("1")).await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn destroy_cascades_to_local_credential_and_sessions() {
        let store = MemoryStore::new();
        let alice = Account::new("Alice");
        let bob = Account::new("Bob");
        assert!(store.create(&alice).await.is_ok());
        assert!(store.create(&bob).await.is_ok());
        assert!(store.put_local_credential("Alice", b"record").await.is_ok());
        assert!(store.put_local_credential("Bob", b"record").await.is_ok());
        let expires = Utc::now() + Duration::hours(1);
        assert!(store.insert_session(alice.id, b"s1", expires).await.is_ok());

        assert!(store.destroy(alice.id).await.is_ok());

        assert!(matches!(store.has_local_credential("Alice").await, Ok(false)));
        assert!(matches!(store.has_local_credential("Bob").await, Ok(true)));
        assert!(matches!(store.lookup_session(b"s1").await, Ok(None)));
        assert!(matches!(store.destroy(alice.id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn confirm_email_keeps_first_timestamp() {
        let store = MemoryStore::new();
        let alice = Account::new("Alice");
        assert!(store.create(&alice).await.is_ok());
        let first = Utc::now() - Duration::days(1);
        assert!(store.confirm_email(alice.id, first).await.is_ok());
        assert!(store.confirm_email(alice.id, Utc::now()).await.is_ok());
        let stored = store.find_by_id(alice.id).await.ok().flatten();
        assert_eq!(stored.and_then(|a| a.email_confirmed_at), Some(first));
    }

    #[tokio::test]
    async fn grant_replaces_facility_by_name() {
        let store = MemoryStore::new();
        let alice = Account::new("Alice");
        assert!(store.create(&alice).await.is_ok());
        let read = Facility::new("Admin", Access::new(true, false, false));
        let all = Facility::new("Admin", Access::new(true, true, true));
        assert!(store.grant(alice.id, &read).await.is_ok());
        assert!(store.grant(alice.id, &all).await.is_ok());
        let stored = store.find_by_handle("Alice").await.ok().flatten();
        assert_eq!(stored.map(|a| a.facilities), Some(vec![all]));
    }

    #[tokio::test]
    async fn list_orders_by_handle() {
        let store = MemoryStore::new();
        for name in ["Carol", "Alice", "Bob"] {
            assert!(store.create(&Account::new(name)).await.is_ok());
        }
        let names: Vec<String> = store
            .list()
            .await
            .map(|accounts| accounts.into_iter().map(|a| a.name).collect())
            .unwrap_or_default();
        assert_eq!(names, ["Alice", "Bob", "Carol"]);
    }

    #[tokio::test]
    async fn expired_sessions_are_not_returned() {
        let store = MemoryStore::new();
        let alice = Account::new("Alice");
        assert!(store.create(&alice).await.is_ok());
        let past = Utc::now() - Duration::seconds(1);
        assert!(store.insert_session(alice.id, b"old", past).await.is_ok());
        assert!(matches!(store.lookup_session(b"old").await, Ok(None)));

        let future = Utc::now() + Duration::seconds(60);
        assert!(store.insert_session(alice.id, b"new", future).await.is_ok());
        assert!(matches!(store.lookup_session(b"new").await, Ok(Some(id)) if id == alice.id));
        assert!(store.delete_session(b"new").await.is_ok());
        assert!(matches!(store.lookup_session(b"new").await, Ok(None)));
    }
}
