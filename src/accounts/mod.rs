//! Local accounts, the external identities linked to them, and the stores
//! that persist both.
//!
//! ## Uniqueness
//!
//! Two invariants are owned by the store, not by callers:
//!
//! - an account handle (`name`) is used by at most one account;
//! - a `(provider, uid)` pair is linked to at most one account.
//!
//! The reconciler reads before it writes, so two sign-ins racing for the same
//! new identity both miss the lookup. The store rejects the second write and
//! the reconciler reports [`ReconcileError::ConstraintRace`].

pub mod access;
pub mod assertion;
pub mod memory;
pub mod postgres;
pub mod reconcile;
pub mod store;

pub use access::{Access, Facility, ADMIN_FACILITY};
pub use assertion::{Assertion, AssertionError, ProviderCallback};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use reconcile::{reconcile, unlink, ReconcileError};
pub use store::{AccountStore, Constraint, SessionStore, StoreError, StoreResult};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Provider name used by the local-credential identity provider.
pub const LOCAL_PROVIDER: &str = "identity";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountDataError {
    #[error("account name must not be empty")]
    EmptyHandle,
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
}

/// One external-provider binding owned by an account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct LinkedIdentity {
    pub provider: String,
    pub uid: String,
}

impl LinkedIdentity {
    #[must_use]
    pub fn new(provider: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            uid: uid.into(),
        }
    }

    #[must_use]
    pub fn matches(&self, provider: &str, uid: &str) -> bool {
        self.provider == provider && self.uid == uid
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub email_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub identities: Vec<LinkedIdentity>,
    pub facilities: Vec<Facility>,
}

impl Account {
    /// Build an unsaved account with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: None,
            email_confirmed_at: None,
            created_at: Utc::now(),
            identities: Vec::new(),
            facilities: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Check the shape rules a store would otherwise reject.
    ///
    /// # Errors
    /// Returns the first rule the account breaks.
    pub fn validate(&self) -> Result<(), AccountDataError> {
        if self.name.trim().is_empty() {
            return Err(AccountDataError::EmptyHandle);
        }
        if let Some(email) = &self.email {
            if !valid_email(email) {
                return Err(AccountDataError::InvalidEmail(email.clone()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn has_email(&self) -> bool {
        self.email.as_deref().is_some_and(|email| !email.trim().is_empty())
    }

    #[must_use]
    pub const fn email_confirmed(&self) -> bool {
        self.email_confirmed_at.is_some()
    }

    /// Attach an identity unless the account already holds it.
    /// Returns `false` when it was already attached.
    pub fn add_identity(&mut self, identity: LinkedIdentity) -> bool {
        if self.identities.contains(&identity) {
            return false;
        }
        self.identities.push(identity);
        true
    }

    #[must_use]
    pub fn identity(&self, provider: &str, uid: &str) -> Option<&LinkedIdentity> {
        self.identities
            .iter()
            .find(|identity| identity.matches(provider, uid))
    }

    /// Add a facility, replacing any grant with the same name.
    pub fn grant(&mut self, facility: Facility) {
        match self.facilities.iter_mut().find(|f| f.name == facility.name) {
            Some(existing) => existing.access = facility.access,
            None => self.facilities.push(facility),
        }
    }

    fn facility(&self, name: &str) -> Option<&Facility> {
        self.facilities.iter().find(|facility| facility.name == name)
    }

    #[must_use]
    pub fn can_read(&self, what: &str) -> bool {
        self.facility(what).is_some_and(|f| f.access.can_read())
    }

    #[must_use]
    pub fn can_write(&self, what: &str) -> bool {
        self.facility(what).is_some_and(|f| f.access.can_write())
    }

    #[must_use]
    pub fn can_execute(&self, what: &str) -> bool {
        self.facility(what).is_some_and(|f| f.access.can_execute())
    }

    /// `"Admin (rwx), Editor (rw)"`, or `None` without any facility.
    #[must_use]
    pub fn facilities_summary(&self) -> Option<String> {
        if self.facilities.is_empty() {
            return None;
        }
        Some(
            self.facilities
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

/// Address shape accepted for account emails.
#[must_use]
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"(?i)^[-a-z0-9_+.]+@([-a-z0-9]+\.)+[a-z0-9]{2,4}$")
        .is_ok_and(|regex| regex.is_match(email))
}
