//! # Folio
//!
//! `folio` serves sectioned site content and signs visitors in through local
//! credentials or third-party OAuth providers.
//!
//! ## Account reconciliation
//!
//! Every provider sign-in arrives as an external identity assertion
//! (`provider`, `uid`, display name, optional email). The reconciler maps it to
//! exactly one local account:
//!
//! 1. an account already linked to `(provider, uid)` wins, even over the
//!    caller's current session;
//! 2. otherwise the identity is attached to the signed-in account, if any;
//! 3. otherwise a new account is created from the display name and email.
//!
//! Handles and `(provider, uid)` pairs are unique. The store enforces both,
//! so concurrent first sign-ins for the same identity end with one account and
//! one link; the loser gets a `ConstraintRace` error.
//!
//! ## Storage
//!
//! With `--dsn` accounts and sessions live in `PostgreSQL` (`sql/schema.sql`
//! is applied at startup). Without it an in-process store is used.
//!
//! ## Access control
//!
//! Accounts hold named facilities with `rwx` flags. The `Admin` facility gates
//! listing and managing other accounts.

pub mod accounts;
pub mod api;
pub mod cli;
pub mod content;
