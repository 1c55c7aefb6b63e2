//! Cookie sessions: the browser holds a random token, the store holds its
//! SHA-256 hash.

use anyhow::{Context, Result};
use axum::http::{
    header::{InvalidHeaderValue, AUTHORIZATION, COOKIE},
    HeaderMap, HeaderValue, StatusCode,
};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::error;
use uuid::Uuid;

use super::AppState;
use crate::accounts::Account;

pub const SESSION_COOKIE_NAME: &str = "folio_session";

/// Twelve hours.
pub const DEFAULT_SESSION_TTL_SECONDS: i64 = 43_200;

/// Create a new session token for the cookie.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_session_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

#[must_use]
pub fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// # Errors
/// Returns an error if the token contains bytes not allowed in a header.
pub fn session_cookie(token: &str, ttl_seconds: i64) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    ))
}

#[must_use]
pub fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("folio_session=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

/// Session token from a bearer header, falling back to the cookie.
#[must_use]
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    let value = headers.get(COOKIE)?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        let (key, val) = pair.trim().split_once('=')?;
        (key.trim() == SESSION_COOKIE_NAME && !val.trim().is_empty())
            .then(|| val.trim().to_string())
    })
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Persist a new session for the account and return its cookie.
///
/// # Errors
/// Returns an error if the token cannot be generated or stored.
pub async fn start_session(state: &AppState, account_id: Uuid) -> Result<HeaderValue> {
    let token = generate_session_token()?;
    let expires_at = Utc::now() + Duration::seconds(state.session_ttl_seconds);
    state
        .sessions
        .insert_session(account_id, &hash_session_token(&token), expires_at)
        .await
        .context("failed to store session")?;
    session_cookie(&token, state.session_ttl_seconds).context("invalid session cookie")
}

/// Drop the session named by the request, if any.
pub async fn end_session(state: &AppState, headers: &HeaderMap) {
    if let Some(token) = extract_session_token(headers) {
        if let Err(err) = state
            .sessions
            .delete_session(&hash_session_token(&token))
            .await
        {
            error!("Failed to delete session: {err}");
        }
    }
}

/// Resolve the request's session into its account.
///
/// Returns `Ok(None)` when there is no cookie, the session expired, or the
/// account no longer exists.
///
/// # Errors
/// Returns `500` when a store lookup fails.
pub async fn current_account(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Account>, StatusCode> {
    let Some(token) = extract_session_token(headers) else {
        return Ok(None);
    };
    let account_id = match state
        .sessions
        .lookup_session(&hash_session_token(&token))
        .await
    {
        Ok(Some(account_id)) => account_id,
        Ok(None) => return Ok(None),
        Err(err) => {
            error!("Failed to lookup session: {err}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    state.accounts.find_by_id(account_id).await.map_err(|err| {
        error!("Failed to load session account: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Like [`current_account`], but a missing session is `401`.
///
/// # Errors
/// Returns `401` without a live session, `500` on store failure.
pub async fn require_account(state: &AppState, headers: &HeaderMap) -> Result<Account, StatusCode> {
    current_account(state, headers)
        .await?
        .ok_or(StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_url_safe_and_unique() -> Result<()> {
        let first = generate_session_token()?;
        let second = generate_session_token()?;
        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
        assert!(first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        Ok(())
    }

    #[test]
    fn hash_is_stable_sha256() {
        let hash = hash_session_token("token");
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, hash_session_token("token"));
        assert_ne!(hash, hash_session_token("other"));
    }

    #[test]
    fn cookie_carries_flags_and_ttl() -> Result<()> {
        let cookie = session_cookie("abc", 60)?;
        assert_eq!(
            cookie.to_str()?,
            "folio_session=abc; Path=/; HttpOnly; SameSite=Lax; Max-Age=60"
        );
        assert!(clear_session_cookie().to_str()?.contains("Max-Age=0"));
        Ok(())
    }

    #[test]
    fn extracts_token_from_cookie_or_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_session_token(&headers), None);

        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; folio_session=abc123"),
        );
        assert_eq!(extract_session_token(&headers), Some("abc123".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_session_token(&headers), Some("xyz".to_string()));
    }

    #[test]
    fn empty_cookie_value_is_no_session() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("folio_session="));
        assert_eq!(extract_session_token(&headers), None);
    }
}
