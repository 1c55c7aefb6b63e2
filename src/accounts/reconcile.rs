//! Resolve an external sign-in to exactly one local account.
//!
//! ```text
//! START -> LOOKUP -> MATCHED                      -> owner
//!                 -> UNMATCHED -> ATTACH_TO_CURRENT -> PERSIST -> RESOLVED | FAILED
//!                              -> CREATE_NEW        -> PERSIST -> RESOLVED | FAILED
//! ```
//!
//! An existing link always wins over the caller's current account, so a stale
//! session cannot merge someone else's identity into it.

use thiserror::Error;
use tracing::{debug, error, info, instrument};

use super::{
    store::{AccountStore, Constraint, StoreError},
    Account, AccountDataError, Assertion, LinkedIdentity,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("account name `{}` is already taken", .attempted.name)]
    DuplicateHandle { attempted: Box<Account> },
    #[error("account data is invalid: {source}")]
    InvalidAccountData {
        attempted: Box<Account>,
        source: AccountDataError,
    },
    #[error("identity {}/{} was linked by a concurrent sign-in", .identity.provider, .identity.uid)]
    ConstraintRace {
        attempted: Box<Account>,
        identity: LinkedIdentity,
    },
    #[error("no account could be resolved")]
    NotFound { attempted: Option<Box<Account>> },
}

impl ReconcileError {
    /// The account the reconciler tried to resolve to, for messaging only.
    #[must_use]
    pub fn attempted(&self) -> Option<&Account> {
        match self {
            Self::DuplicateHandle { attempted }
            | Self::InvalidAccountData { attempted, .. }
            | Self::ConstraintRace { attempted, .. } => Some(attempted.as_ref()),
            Self::NotFound { attempted } => attempted.as_deref(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateHandle { .. } => "duplicate_handle",
            Self::InvalidAccountData { .. } => "invalid_account_data",
            Self::ConstraintRace { .. } => "constraint_race",
            Self::NotFound { .. } => "not_found",
        }
    }
}

fn store_failure(err: StoreError, attempted: Account, identity: LinkedIdentity) -> ReconcileError {
    let attempted = Box::new(attempted);
    match err {
        StoreError::UniqueViolation(Constraint::Handle) => {
            ReconcileError::DuplicateHandle { attempted }
        }
        StoreError::UniqueViolation(Constraint::Identity) => ReconcileError::ConstraintRace {
            attempted,
            identity,
        },
        StoreError::UniqueViolation(Constraint::Session) | StoreError::NotFound => {
            ReconcileError::NotFound {
                attempted: Some(attempted),
            }
        }
        StoreError::Backend(err) => {
            error!("Error persisting account: {:?}", err);
            ReconcileError::NotFound {
                attempted: Some(attempted),
            }
        }
    }
}

/// Find the account owning the asserted identity, or attach the identity to
/// `current` (when given) or to a newly created account.
///
/// # Errors
/// Returns a [`ReconcileError`] when the account cannot be resolved; no
/// failure escapes as a panic and nothing is left half-written.
#[instrument(skip(store, assertion, current), fields(provider = assertion.provider(), uid = assertion.uid()))]
pub async fn reconcile(
    store: &dyn AccountStore,
    assertion: &Assertion,
    current: Option<&Account>,
) -> Result<Account, ReconcileError> {
    match store
        .find_by_identity(assertion.provider(), assertion.uid())
        .await
    {
        Ok(Some(owner)) => {
            debug!(account = %owner.name, "identity already linked");
            return Ok(owner);
        }
        Ok(None) => (),
        Err(err) => {
            error!("Error looking up identity: {:?}", err);
            return Err(ReconcileError::NotFound { attempted: None });
        }
    }

    let identity = LinkedIdentity::new(assertion.provider(), assertion.uid());

    if let Some(current) = current {
        let mut target = current.clone();
        return match store.attach_identity(target.id, &identity).await {
            Ok(()) => {
                target.add_identity(identity);
                info!(account = %target.name, "identity attached to current account");
                Ok(target)
            }
            Err(err) => Err(store_failure(err, target, identity)),
        };
    }

    let mut account = Account::new(assertion.display_name());
    if account.email.is_none() {
        account.email = assertion.email().map(str::to_string);
    }
    account.add_identity(identity.clone());

    if let Err(source) = account.validate() {
        debug!("rejecting synthesized account: {}", source);
        return Err(ReconcileError::InvalidAccountData {
            attempted: Box::new(account),
            source,
        });
    }

    match store.create(&account).await {
        Ok(()) => {
            info!(account = %account.name, "account created from provider identity");
            Ok(account)
        }
        Err(err) => Err(store_failure(err, account, identity)),
    }
}

/// Remove one identity from the account.
///
/// # Errors
/// Returns [`StoreError::NotFound`] if the account does not hold it.
#[instrument(skip(store, account), fields(account = %account.name))]
pub async fn unlink(
    store: &dyn AccountStore,
    account: &Account,
    provider: &str,
    uid: &str,
) -> Result<Account, StoreError> {
    let Some(identity) = account.identity(provider, uid).cloned() else {
        return Err(StoreError::NotFound);
    };
    store.detach_identity(account.id, &identity).await?;

    let mut account = account.clone();
    account.identities.retain(|linked| *linked != identity);
    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{Facility, MemoryStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    fn assertion(provider: &str, uid: &str, name: &str) -> Assertion {
        match Assertion::new(provider, uid, name, None) {
            Ok(assertion) => assertion,
            Err(err) => panic!("invalid test assertion: {err}"),
        }
    }

    async fn identity_count(store: &MemoryStore, provider: &str, uid: &str) -> usize {
        store
            .list()
            .await
            .map(|accounts| {
                accounts
                    .iter()
                    .flat_map(|a| a.identities.iter())
                    .filter(|i| i.matches(provider, uid))
                    .count()
            })
            .unwrap_or_default()
    }

    async fn seeded(store: &MemoryStore, name: &str, provider: &str, uid: &str) -> Account {
        let mut account = Account::new(name);
        account.add_identity(LinkedIdentity::new(provider, uid));
        assert!(store.create(&account).await.is_ok());
        account
    }

    #[tokio::test]
    async fn new_identity_creates_account_named_after_provider_name() {
        let store = MemoryStore::new();
        let alice = assertion("twitter", "42", "Alice");

        let result = reconcile(&store, &alice, None).await;
        let Ok(account) = result else {
            panic!("expected a resolved account");
        };
        assert_eq!(account.name, "Alice");
        assert_eq!(account.identities, vec![LinkedIdentity::new("twitter", "42")]);

        let stored = store.find_by_handle("Alice").await.ok().flatten();
        assert_eq!(stored.map(|a| a.id), Some(account.id));
        assert_eq!(identity_count(&store, "twitter", "42").await, 1);
    }

    #[tokio::test]
    async fn repeated_sign_in_returns_same_account() {
        let store = MemoryStore::new();
        let alice = assertion("twitter", "42", "Alice");

        let first = reconcile(&store, &alice, None).await.map(|a| a.id).ok();
        let second = reconcile(&store, &alice, None).await.map(|a| a.id).ok();

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(store.list().await.map(|a| a.len()).ok(), Some(1));
        assert_eq!(identity_count(&store, "twitter", "42").await, 1);
    }

    #[tokio::test]
    async fn existing_link_wins_over_current_account() {
        let store = MemoryStore::new();
        let owner = seeded(&store, "Owner", "twitter", "42").await;
        let other = seeded(&store, "Other", "facebook", "7").await;

        let result = reconcile(&store, &assertion("twitter", "42", "Whoever"), Some(&other)).await;

        assert_eq!(result.map(|a| a.id).ok(), Some(owner.id));
        let other = store.find_by_id(other.id).await.ok().flatten();
        assert_eq!(other.map(|a| a.identities.len()), Some(1));
    }

    #[tokio::test]
    async fn unseen_identity_attaches_to_current_account() {
        let store = MemoryStore::new();
        let current = seeded(&store, "Alice", "identity", "Alice").await;

        let result = reconcile(&store, &assertion("facebook", "99", "Alice F."), Some(&current)).await;

        let Ok(account) = result else {
            panic!("expected a resolved account");
        };
        assert_eq!(account.id, current.id);
        assert!(account.identity("facebook", "99").is_some());
        assert_eq!(store.list().await.map(|a| a.len()).ok(), Some(1));

        let owner = store.find_by_identity("facebook", "99").await.ok().flatten();
        assert_eq!(owner.map(|a| a.id), Some(current.id));
    }

    #[tokio::test]
    async fn repeating_with_created_account_as_current_does_not_relink() {
        let store = MemoryStore::new();
        let alice = assertion("twitter", "42", "Alice");

        let Ok(created) = reconcile(&store, &alice, None).await else {
            panic!("expected a resolved account");
        };
        let again = reconcile(&store, &alice, Some(&created)).await;

        assert_eq!(again.map(|a| a.id).ok(), Some(created.id));
        assert_eq!(identity_count(&store, "twitter", "42").await, 1);
    }

    #[tokio::test]
    async fn email_from_provider_is_copied_to_new_account() {
        let store = MemoryStore::new();
        let alice = Assertion::new("github", "5", "Alice", Some("alice@example.com".into()));
        let Ok(alice) = alice else {
            panic!("invalid test assertion");
        };
        let account = reconcile(&store, &alice, None).await;
        assert_eq!(
            account.ok().and_then(|a| a.email),
            Some("alice@example.com".to_string())
        );
    }

    #[tokio::test]
    async fn first_and_last_name_fallback_names_the_account() {
        let store = MemoryStore::new();
        let callback = crate::accounts::ProviderCallback {
            provider: "foursquare".to_string(),
            uid: serde_json::json!(77),
            info: crate::accounts::assertion::ProviderInfo {
                first_name: Some("Jane".to_string()),
                last_name: Some("Doe".to_string()),
                ..Default::default()
            },
        };
        let Ok(jane) = Assertion::try_from(callback) else {
            panic!("invalid test assertion");
        };
        let account = reconcile(&store, &jane, None).await;
        assert_eq!(account.ok().map(|a| a.name), Some("Jane Doe".to_string()));
        assert_eq!(identity_count(&store, "foursquare", "77").await, 1);
    }

    #[tokio::test]
    async fn empty_name_fails_with_invalid_account_data() {
        let store = MemoryStore::new();
        let nameless = assertion("foursquare", "8", "");

        let result = reconcile(&store, &nameless, None).await;

        assert!(matches!(
            result,
            Err(ReconcileError::InvalidAccountData {
                source: AccountDataError::EmptyHandle,
                ..
            })
        ));
        assert_eq!(store.list().await.map(|a| a.len()).ok(), Some(0));
    }

    #[tokio::test]
    async fn malformed_provider_email_fails_with_invalid_account_data() {
        let store = MemoryStore::new();
        let Ok(bad) = Assertion::new("twitter", "1", "Bob", Some("bob@".into())) else {
            panic!("invalid test assertion");
        };
        let result = reconcile(&store, &bad, None).await;
        let Err(err) = result else {
            panic!("expected a failure");
        };
        assert_eq!(err.kind(), "invalid_account_data");
        assert_eq!(err.attempted().map(|a| a.name.as_str()), Some("Bob"));
    }

    #[tokio::test]
    async fn taken_handle_fails_with_duplicate_handle() {
        let store = MemoryStore::new();
        seeded(&store, "Alice", "identity", "Alice").await;

        let result = reconcile(&store, &assertion("twitter", "42", "Alice"), None).await;

        let Err(err) = result else {
            panic!("expected a failure");
        };
        assert!(matches!(err, ReconcileError::DuplicateHandle { .. }));
        assert_eq!(
            err.attempted().map(|a| a.identities.clone()),
            Some(vec![LinkedIdentity::new("twitter", "42")])
        );
        assert_eq!(identity_count(&store, "twitter", "42").await, 0);
    }

    #[tokio::test]
    async fn deleted_current_account_is_not_found() {
        let store = MemoryStore::new();
        let ghost = Account::new("Ghost");

        let result = reconcile(&store, &assertion("twitter", "1", "Ghost"), Some(&ghost)).await;

        let Err(err) = result else {
            panic!("expected a failure");
        };
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.attempted().map(|a| a.id), Some(ghost.id));
    }

    /// Store whose identity lookup always misses, as if another sign-in
    /// committed between our lookup and our write.
    struct StaleLookup(Arc<MemoryStore>);

    #[async_trait]
    impl AccountStore for StaleLookup {
        fn backend(&self) -> &'static str {
            "stale"
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }
        async fn find_by_identity(&self, _provider: &str, _uid: &str) -> Result<Option<Account>, StoreError> {
            Ok(None)
        }
        async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
            self.0.find_by_id(id).await
        }
        async fn find_by_handle(&self, name: &str) -> Result<Option<Account>, StoreError> {
            self.0.find_by_handle(name).await
        }
        async fn list(&self) -> Result<Vec<Account>, StoreError> {
            self.0.list().await
        }
        async fn create(&self, account: &Account) -> Result<(), StoreError> {
            self.0.create(account).await
        }
        async fn create_local(&self, account: &Account, record: &[u8]) -> Result<(), StoreError> {
            self.0.create_local(account, record).await
        }
        async fn attach_identity(&self, id: Uuid, i: &LinkedIdentity) -> Result<(), StoreError> {
            self.0.attach_identity(id, i).await
        }
        async fn detach_identity(&self, id: Uuid, i: &LinkedIdentity) -> Result<(), StoreError> {
            self.0.detach_identity(id, i).await
        }
        async fn grant(&self, id: Uuid, facility: &Facility) -> Result<(), StoreError> {
            self.0.grant(id, facility).await
        }
        async fn confirm_email(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.0.confirm_email(id, at).await
        }
        async fn destroy(&self, id: Uuid) -> Result<(), StoreError> {
            self.0.destroy(id).await
        }
        async fn put_local_credential(&self, name: &str, record: &[u8]) -> Result<(), StoreError> {
            self.0.put_local_credential(name, record).await
        }
        async fn has_local_credential(&self, name: &str) -> Result<bool, StoreError> {
            self.0.has_local_credential(name).await
        }
    }

    #[tokio::test]
    async fn racing_creation_fails_with_constraint_race() {
        let inner = Arc::new(MemoryStore::new());
        seeded(&inner, "Winner", "twitter", "42").await;
        let racing = StaleLookup(inner.clone());

        let result = reconcile(&racing, &assertion("twitter", "42", "Loser"), None).await;

        let Err(err) = result else {
            panic!("expected a failure");
        };
        assert!(matches!(err, ReconcileError::ConstraintRace { .. }));
        assert_eq!(identity_count(&inner, "twitter", "42").await, 1);
        assert!(matches!(inner.find_by_handle("Loser").await, Ok(None)));
    }

    #[tokio::test]
    async fn racing_attach_fails_with_constraint_race() {
        let inner = Arc::new(MemoryStore::new());
        seeded(&inner, "Winner", "twitter", "42").await;
        let current = seeded(&inner, "Current", "identity", "Current").await;
        let racing = StaleLookup(inner.clone());

        let result = reconcile(&racing, &assertion("twitter", "42", "Current"), Some(&current)).await;

        assert!(matches!(result, Err(ReconcileError::ConstraintRace { .. })));
        assert_eq!(identity_count(&inner, "twitter", "42").await, 1);
    }

    #[tokio::test]
    async fn concurrent_sign_ins_never_duplicate_identity() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let attempt = assertion("twitter", "42", &format!("Alice {n}"));
                reconcile(store.as_ref(), &attempt, None).await.map(|a| a.id)
            }));
        }

        let mut resolved = Vec::new();
        for handle in handles {
            if let Ok(Ok(id)) = handle.await {
                resolved.push(id);
            }
        }

        assert!(!resolved.is_empty());
        assert!(resolved.iter().all(|id| *id == resolved[0]));
        assert_eq!(identity_count(&store, "twitter", "42").await, 1);
        assert_eq!(store.list().await.map(|a| a.len()).ok(), Some(1));
    }

    #[tokio::test]
    async fn unlink_removes_only_the_named_identity() {
        let store = MemoryStore::new();
        let mut alice = Account::new("Alice");
        alice.add_identity(LinkedIdentity::new("twitter", "1"));
        alice.add_identity(LinkedIdentity::new("facebook", "2"));
        assert!(store.create(&alice).await.is_ok());

        let result = unlink(&store, &alice, "twitter", "1").await;
        assert_eq!(
            result.map(|a| a.identities).ok(),
            Some(vec![LinkedIdentity::new("facebook", "2")])
        );
        assert!(matches!(store.find_by_identity("twitter", "1").await, Ok(None)));

        let result = unlink(&store, &alice, "github", "3").await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }
}
