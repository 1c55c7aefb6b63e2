//! PostgreSQL-backed account and session store.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Connection, PgConnection, PgPool, Row};
use std::collections::HashMap;
use tracing::{info_span, instrument, Instrument, Span};
use uuid::Uuid;

use super::{
    store::{AccountStore, Constraint, SessionStore, StoreError, StoreResult},
    Access, Account, Facility, LinkedIdentity,
};

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const ACCOUNT_COLUMNS: &str = "id, name, email, email_confirmed_at, created_at";

fn query_span(operation: &'static str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

/// Uniqueness rule named by a `23505` error, if we know it.
pub(crate) fn unique_violation(err: &sqlx::Error) -> Option<Constraint> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if db_err.code().as_deref() != Some("23505") {
        return None;
    }
    match db_err.constraint() {
        Some("accounts_name_key") => Some(Constraint::Handle),
        Some("linked_identities_provider_uid_key") => Some(Constraint::Identity),
        Some("sessions_pkey") => Some(Constraint::Session),
        Some("local_credentials_pkey") => Some(Constraint::Handle),
        _ => None,
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23503"),
        _ => false,
    }
}

fn map_err(err: sqlx::Error, context: &'static str) -> StoreError {
    if let Some(constraint) = unique_violation(&err) {
        return StoreError::UniqueViolation(constraint);
    }
    if is_foreign_key_violation(&err) {
        return StoreError::NotFound;
    }
    StoreError::Backend(anyhow::Error::new(err).context(context))
}

/// Split the schema into statements; each ends with `;` at end of line.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            statements.push(current.trim().to_string());
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

fn account_from_row(row: &PgRow) -> Account {
    Account {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        email_confirmed_at: row.get("email_confirmed_at"),
        created_at: row.get("created_at"),
        identities: Vec::new(),
        facilities: Vec::new(),
    }
}

/// Account row plus its identities and facilities, inside the caller's
/// transaction.
async fn insert_account(conn: &mut PgConnection, account: &Account) -> StoreResult<()> {
    let query = r"
        INSERT INTO accounts (id, name, email, email_confirmed_at, created_at)
        VALUES ($1, $2, $3, $4, $5)
    ";
    sqlx::query(query)
        .bind(account.id)
        .bind(&account.name)
        .bind(&account.email)
        .bind(account.email_confirmed_at)
        .bind(account.created_at)
        .execute(&mut *conn)
        .instrument(query_span("INSERT", query))
        .await
        .map_err(|e| map_err(e, "failed to insert account"))?;

    let query = "INSERT INTO linked_identities (account_id, provider, uid) VALUES ($1, $2, $3)";
    for identity in &account.identities {
        sqlx::query(query)
            .bind(account.id)
            .bind(&identity.provider)
            .bind(&identity.uid)
            .execute(&mut *conn)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| map_err(e, "failed to insert linked identity"))?;
    }

    let query = "INSERT INTO facilities (account_id, name, access) VALUES ($1, $2, $3)";
    for facility in &account.facilities {
        sqlx::query(query)
            .bind(account.id)
            .bind(&facility.name)
            .bind(facility.access.to_string())
            .execute(&mut *conn)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| map_err(e, "failed to insert facility"))?;
    }

    Ok(())
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create missing tables and indexes.
    ///
    /// # Errors
    /// Returns an error if any schema statement fails.
    pub async fn apply_schema(&self) -> anyhow::Result<()> {
        for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
            sqlx::query(statement)
                .execute(&self.pool)
                .instrument(query_span("DDL", statement))
                .await
                .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
        }
        Ok(())
    }

    async fn fetch_one_account(&self, filter: &str, bind: AccountKey<'_>) -> StoreResult<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {filter}");
        let statement = sqlx::query(&query);
        let statement = match bind {
            AccountKey::Id(id) => statement.bind(id),
            AccountKey::Name(name) => statement.bind(name),
        };
        let row = statement
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|e| map_err(e, "failed to fetch account"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut accounts = self.hydrate(vec![account_from_row(&row)]).await?;
        Ok(accounts.pop())
    }

    /// Load identities and facilities for the given accounts in two queries.
    async fn hydrate(&self, mut accounts: Vec<Account>) -> StoreResult<Vec<Account>> {
        if accounts.is_empty() {
            return Ok(accounts);
        }
        let ids: Vec<Uuid> = accounts.iter().map(|account| account.id).collect();

        let query = r"
            SELECT account_id, provider, uid FROM linked_identities
            WHERE account_id = ANY($1) ORDER BY id
        ";
        let rows = sqlx::query(query)
            .bind(ids.as_slice())
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_err(e, "failed to load linked identities"))?;
        let mut identities: HashMap<Uuid, Vec<LinkedIdentity>> = HashMap::new();
        for row in rows {
            identities
                .entry(row.get("account_id"))
                .or_default()
                .push(LinkedIdentity::new(
                    row.get::<String, _>("provider"),
                    row.get::<String, _>("uid"),
                ));
        }

        let query = r"
            SELECT account_id, name, access FROM facilities
            WHERE account_id = ANY($1) ORDER BY id
        ";
        let rows = sqlx::query(query)
            .bind(ids.as_slice())
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_err(e, "failed to load facilities"))?;
        let mut facilities: HashMap<Uuid, Vec<Facility>> = HashMap::new();
        for row in rows {
            let access: String = row.get("access");
            let access: Access = access
                .parse()
                .with_context(|| format!("invalid stored access flags `{access}`"))?;
            facilities
                .entry(row.get("account_id"))
                .or_default()
                .push(Facility::new(row.get::<String, _>("name"), access));
        }

        for account in &mut accounts {
            account.identities = identities.remove(&account.id).unwrap_or_default();
            account.facilities = facilities.remove(&account.id).unwrap_or_default();
        }
        Ok(accounts)
    }
}

enum AccountKey<'a> {
    Id(Uuid),
    Name(&'a str),
}

#[async_trait]
impl AccountStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgresql"
    }

    async fn ping(&self) -> StoreResult<()> {
        let acquire_span = info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .context("failed to acquire database connection")?;
        let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        conn.ping()
            .instrument(ping_span)
            .await
            .context("failed to ping database")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_identity(&self, provider: &str, uid: &str) -> StoreResult<Option<Account>> {
        let query = r"
            SELECT a.id, a.name, a.email, a.email_confirmed_at, a.created_at
            FROM accounts a
            JOIN linked_identities li ON li.account_id = a.id
            WHERE li.provider = $1 AND li.uid = $2
        ";
        let row = sqlx::query(query)
            .bind(provider)
            .bind(uid)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_err(e, "failed to look up identity"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut accounts = self.hydrate(vec![account_from_row(&row)]).await?;
        Ok(accounts.pop())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Account>> {
        self.fetch_one_account("id = $1", AccountKey::Id(id)).await
    }

    async fn find_by_handle(&self, name: &str) -> StoreResult<Option<Account>> {
        self.fetch_one_account("name = $1", AccountKey::Name(name))
            .await
    }

    async fn list(&self) -> StoreResult<Vec<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY name");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|e| map_err(e, "failed to list accounts"))?;
        self.hydrate(rows.iter().map(account_from_row).collect())
            .await
    }

    #[instrument(skip(self, account), fields(name = %account.name))]
    async fn create(&self, account: &Account) -> StoreResult<()> {
        // Account, identities and facilities land together or not at all.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_err(e, "begin create account transaction"))?;

        insert_account(&mut *tx, account).await?;

        tx.commit()
            .await
            .map_err(|e| map_err(e, "commit create account transaction"))
    }

    #[instrument(skip(self, account, record), fields(name = %account.name))]
    async fn create_local(&self, account: &Account, record: &[u8]) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_err(e, "begin create local account transaction"))?;

        insert_account(&mut *tx, account).await?;

        // Plain insert: a leftover record under this handle aborts the account too.
        let query = "INSERT INTO local_credentials (name, record) VALUES ($1, $2)";
        sqlx::query(query)
            .bind(&account.name)
            .bind(record)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| map_err(e, "failed to insert local credential"))?;

        tx.commit()
            .await
            .map_err(|e| map_err(e, "commit create local account transaction"))
    }

    #[instrument(skip(self, identity), fields(provider = %identity.provider, uid = %identity.uid))]
    async fn attach_identity(
        &self,
        account_id: Uuid,
        identity: &LinkedIdentity,
    ) -> StoreResult<()> {
        let query = "INSERT INTO linked_identities (account_id, provider, uid) VALUES ($1, $2, $3)";
        sqlx::query(query)
            .bind(account_id)
            .bind(&identity.provider)
            .bind(&identity.uid)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| map_err(e, "failed to attach linked identity"))?;
        Ok(())
    }

    async fn detach_identity(
        &self,
        account_id: Uuid,
        identity: &LinkedIdentity,
    ) -> StoreResult<()> {
        let query =
            "DELETE FROM linked_identities WHERE account_id = $1 AND provider = $2 AND uid = $3";
        let result = sqlx::query(query)
            .bind(account_id)
            .bind(&identity.provider)
            .bind(&identity.uid)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .map_err(|e| map_err(e, "failed to detach linked identity"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn grant(&self, account_id: Uuid, facility: &Facility) -> StoreResult<()> {
        let query = r"
            INSERT INTO facilities (account_id, name, access) VALUES ($1, $2, $3)
            ON CONFLICT (account_id, name) DO UPDATE SET access = EXCLUDED.access
        ";
        sqlx::query(query)
            .bind(account_id)
            .bind(&facility.name)
            .bind(facility.access.to_string())
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| map_err(e, "failed to grant facility"))?;
        Ok(())
    }

    async fn confirm_email(&self, account_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let query = r"
            UPDATE accounts SET email_confirmed_at = COALESCE(email_confirmed_at, $2)
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(account_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|e| map_err(e, "failed to confirm email"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy(&self, account_id: Uuid) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_err(e, "begin destroy account transaction"))?;

        let query = "SELECT name FROM accounts WHERE id = $1 FOR UPDATE";
        let row = sqlx::query(query)
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_err(e, "failed to lock account"))?;
        let Some(row) = row else {
            return Err(StoreError::NotFound);
        };
        let name: String = row.get("name");

        // Local credentials are keyed by handle, not by account id.
        let query = "DELETE FROM local_credentials WHERE name = $1";
        sqlx::query(query)
            .bind(&name)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .map_err(|e| map_err(e, "failed to delete local credential"))?;

        let query = "DELETE FROM accounts WHERE id = $1";
        sqlx::query(query)
            .bind(account_id)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .map_err(|e| map_err(e, "failed to delete account"))?;

        tx.commit()
            .await
            .map_err(|e| map_err(e, "commit destroy account transaction"))
    }

    async fn put_local_credential(&self, name: &str, record: &[u8]) -> StoreResult<()> {
        let query = r"
            INSERT INTO local_credentials (name, record) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET record = EXCLUDED.record
        ";
        sqlx::query(query)
            .bind(name)
            .bind(record)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| map_err(e, "failed to store local credential"))?;
        Ok(())
    }

    async fn has_local_credential(&self, name: &str) -> StoreResult<bool> {
        let query = "SELECT EXISTS(SELECT 1 FROM local_credentials WHERE name = $1) AS exists";
        let row = sqlx::query(query)
            .bind(name)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_err(e, "failed to check local credential"))?;
        Ok(row.get("exists"))
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(
        &self,
        account_id: Uuid,
        session_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let query = "INSERT INTO sessions (session_hash, account_id, expires_at) VALUES ($1, $2, $3)";
        sqlx::query(query)
            .bind(session_hash)
            .bind(account_id)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| map_err(e, "failed to insert session"))?;
        Ok(())
    }

    async fn lookup_session(&self, session_hash: &[u8]) -> StoreResult<Option<Uuid>> {
        let query = "SELECT account_id FROM sessions WHERE session_hash = $1 AND expires_at > NOW()";
        let row = sqlx::query(query)
            .bind(session_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_err(e, "failed to look up session"))?;
        Ok(row.map(|row| row.get("account_id")))
    }

    async fn delete_session(&self, session_hash: &[u8]) -> StoreResult<()> {
        let query = "DELETE FROM sessions WHERE session_hash = $1";
        sqlx::query(query)
            .bind(session_hash)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .map_err(|e| map_err(e, "failed to delete session"))?;
        Ok(())
    }
}
