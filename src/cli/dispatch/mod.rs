use crate::cli::actions::{server::Args, Action};
use anyhow::Result;
use secrecy::SecretString;
use std::path::PathBuf;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .filter(|dsn| !dsn.trim().is_empty())
        .map(|dsn| SecretString::from(dsn.clone()));
    let exchange_secret = matches
        .get_one::<String>("exchange-secret")
        .filter(|secret| !secret.trim().is_empty())
        .map(|secret| SecretString::from(secret.clone()));
    let catalog = matches.get_one::<String>("catalog").map(PathBuf::from);
    let session_ttl_seconds = matches
        .get_one::<u32>("session-ttl-seconds")
        .copied()
        .unwrap_or(43_200);
    let default_preview_length = matches
        .get_one::<u32>("default-preview-length")
        .copied()
        .unwrap_or(crate::content::DEFAULT_PREVIEW_LENGTH);

    Ok(Action::Server(Args {
        port,
        dsn,
        exchange_secret,
        catalog,
        session_ttl_seconds,
        default_preview_length,
    }))
}
