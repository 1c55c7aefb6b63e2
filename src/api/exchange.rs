//! Shared-secret gate for callbacks relayed by the identity exchange.
//!
//! Only the exchange has verified the provider, so a callback without its
//! token is never reconciled.

use axum::{
    http::{HeaderMap, StatusCode},
    response::Response,
};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use super::handlers::error_response;

pub const EXCHANGE_TOKEN_HEADER: &str = "x-folio-exchange-token";

#[derive(Debug, PartialEq, Eq)]
pub enum ExchangeTokenError {
    NotConfigured,
    Missing,
    Invalid,
}

/// # Errors
/// Returns why the request may not be treated as coming from the exchange.
pub fn require_exchange_token(
    headers: &HeaderMap,
    secret: Option<&SecretString>,
) -> Result<(), ExchangeTokenError> {
    let Some(secret) = secret else {
        return Err(ExchangeTokenError::NotConfigured);
    };
    let Some(token) = extract_exchange_token(headers) else {
        return Err(ExchangeTokenError::Missing);
    };

    // Compare digests so the comparison time does not track the secret.
    let expected = Sha256::digest(secret.expose_secret().as_bytes());
    let presented = Sha256::digest(token.as_bytes());
    if expected == presented {
        Ok(())
    } else {
        Err(ExchangeTokenError::Invalid)
    }
}

pub fn exchange_token_error_response(err: &ExchangeTokenError) -> Response {
    match err {
        ExchangeTokenError::NotConfigured => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Identity exchange is not configured",
        ),
        ExchangeTokenError::Missing => {
            error_response(StatusCode::UNAUTHORIZED, "Missing exchange token")
        }
        ExchangeTokenError::Invalid => {
            error_response(StatusCode::UNAUTHORIZED, "Invalid exchange token")
        }
    }
}

fn extract_exchange_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(EXCHANGE_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn secret() -> SecretString {
        SecretString::from("s3cret-exchange".to_string())
    }

    #[test]
    fn extract_exchange_token_trims_value() {
        let mut headers = HeaderMap::new();
        headers.insert(EXCHANGE_TOKEN_HEADER, HeaderValue::from_static("  token  "));
        assert_eq!(extract_exchange_token(&headers), Some("token".to_string()));

        headers.insert(EXCHANGE_TOKEN_HEADER, HeaderValue::from_static("   "));
        assert_eq!(extract_exchange_token(&headers), None);
    }

    #[test]
    fn require_exchange_token_checks_secret() {
        let secret = secret();
        let mut headers = HeaderMap::new();
        assert_eq!(
            require_exchange_token(&headers, Some(&secret)),
            Err(ExchangeTokenError::Missing)
        );

        headers.insert(EXCHANGE_TOKEN_HEADER, HeaderValue::from_static("guess"));
        assert_eq!(
            require_exchange_token(&headers, Some(&secret)),
            Err(ExchangeTokenError::Invalid)
        );

        headers.insert(
            EXCHANGE_TOKEN_HEADER,
            HeaderValue::from_static("s3cret-exchange"),
        );
        assert_eq!(require_exchange_token(&headers, Some(&secret)), Ok(()));
    }

    #[test]
    fn unconfigured_secret_rejects_everything() {
        let mut headers = HeaderMap::new();
        headers.insert(EXCHANGE_TOKEN_HEADER, HeaderValue::from_static("anything"));
        assert_eq!(
            require_exchange_token(&headers, None),
            Err(ExchangeTokenError::NotConfigured)
        );
    }

    #[test]
    fn error_response_maps_status() {
        let response = exchange_token_error_response(&ExchangeTokenError::Missing);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = exchange_token_error_response(&ExchangeTokenError::Invalid);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = exchange_token_error_response(&ExchangeTokenError::NotConfigured);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
