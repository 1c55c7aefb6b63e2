use crate::{
    accounts::{MemoryStore, PgStore},
    api::{self, AppState},
    cli::telemetry,
    content::Catalog,
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<SecretString>,
    pub exchange_secret: Option<SecretString>,
    pub catalog: Option<PathBuf>,
    pub session_ttl_seconds: u32,
    pub default_preview_length: u32,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the catalog cannot be loaded, the database is
/// unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let catalog = match &args.catalog {
        Some(path) => Catalog::load(path, args.default_preview_length)?,
        None => Catalog::new(args.default_preview_length),
    };
    info!("Loaded {} sections", catalog.sections().len());

    let state = match &args.dsn {
        Some(dsn) => {
            let pool = PgPoolOptions::new()
                .min_connections(1)
                .max_connections(5)
                .max_lifetime(Duration::from_secs(60 * 2))
                .test_before_acquire(true)
                .connect(dsn.expose_secret())
                .await
                .context("Failed to connect to database")?;
            let store = Arc::new(PgStore::new(pool));
            store
                .apply_schema()
                .await
                .context("Failed to apply database schema")?;
            AppState::new(store.clone(), store, catalog)
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            AppState::new(store.clone(), store, catalog)
        }
    }
    .with_session_ttl_seconds(i64::from(args.session_ttl_seconds));

    if args.exchange_secret.is_none() {
        warn!("No exchange secret configured; provider callbacks will be refused");
    }
    let state = state.with_exchange_secret(args.exchange_secret);

    let result = api::new(args.port, Arc::new(state)).await;
    telemetry::shutdown_tracer();
    result
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "store",
            args.dsn.as_ref().map_or_else(
                || "memory".to_string(),
                |dsn| redact_dsn(dsn.expose_secret()),
            ),
        ),
        (
            "exchange_secret",
            if args.exchange_secret.is_some() {
                "set".to_string()
            } else {
                "unset".to_string()
            },
        ),
        (
            "catalog",
            args.catalog
                .as_ref()
                .map_or_else(|| "none".to_string(), |path| path.display().to_string()),
        ),
        ("session_ttl_seconds", args.session_ttl_seconds.to_string()),
        (
            "default_preview_length",
            args.default_preview_length.to_string(),
        ),
    ];
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "folio {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_VERSION"),
        short_commit(api::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_dsn_hides_password() {
        assert_eq!(
            redact_dsn("postgres://folio:hunter2@db:5432/folio"),
            "postgres://folio:REDACTED@db:5432/folio"
        );
        assert_eq!(
            redact_dsn("postgres://folio@db/folio"),
            "postgres://folio@db/folio"
        );
        assert_eq!(redact_dsn("not a url"), "invalid-dsn");
    }

    #[test]
    fn short_commit_truncates() {
        assert_eq!(short_commit("0123456789abcdef"), "0123456");
        assert_eq!(short_commit("unknown"), "unknown");
        assert_eq!(short_commit("abc"), "abc");
    }
}
