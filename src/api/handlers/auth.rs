//! Provider sign-in callback, failure landing and sign-out.

use axum::{
    extract::{Extension, Query},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use utoipa::{IntoParams, ToSchema};

use super::{error_response, users::AccountView};
use crate::{
    accounts::{reconcile, Account, Assertion, ProviderCallback, ReconcileError},
    api::{
        exchange::{exchange_token_error_response, require_exchange_token},
        mailer::enqueue_confirmation,
        session, AppState,
    },
};

const CONNECT_HINT: &str =
    "Create a local account first, then connect this provider from your account page.";

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    EditEmail,
    ConfirmEmail,
    SignedIn,
}

impl NextStep {
    fn for_account(account: &Account) -> Self {
        if !account.has_email() {
            Self::EditEmail
        } else if !account.email_confirmed() {
            Self::ConfirmEmail
        } else {
            Self::SignedIn
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CallbackResponse {
    pub account: AccountView,
    pub next: NextStep,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CallbackFailure {
    pub error: String,
    pub message: String,
    pub attempted_name: Option<String>,
    pub hint: Option<String>,
}

impl From<&ReconcileError> for CallbackFailure {
    fn from(err: &ReconcileError) -> Self {
        let attempted = err.attempted();
        Self {
            error: err.kind().to_string(),
            message: err.to_string(),
            attempted_name: attempted.map(|account| account.name.clone()),
            hint: attempted.map(|_| CONNECT_HINT.to_string()),
        }
    }
}

#[utoipa::path(
    post,
    path= "/v1/auth/callback",
    request_body = ProviderCallback,
    responses (
        (status = 200, description = "Signed in; session cookie set", body = CallbackResponse),
        (status = 400, description = "Malformed provider callback", body = super::ErrorBody),
        (status = 401, description = "Missing or invalid exchange token", body = super::ErrorBody),
        (status = 422, description = "No account could be resolved", body = CallbackFailure),
        (status = 503, description = "Identity exchange not configured", body = super::ErrorBody),
    ),
    tag= "auth"
)]
#[instrument(skip(headers, state, payload))]
pub async fn callback(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<ProviderCallback>>,
) -> Response {
    if let Err(err) = require_exchange_token(&headers, state.exchange_secret.as_ref()) {
        info!("Rejecting provider callback: {:?}", err);
        return exchange_token_error_response(&err);
    }

    let callback: ProviderCallback = match payload {
        Some(Json(payload)) => payload,
        None => return error_response(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let assertion = match Assertion::try_from(callback) {
        Ok(assertion) => assertion,
        Err(err) => {
            debug!("Rejecting provider callback: {}", err);
            return error_response(StatusCode::BAD_REQUEST, err.to_string());
        }
    };

    let current = match session::current_account(&state, &headers).await {
        Ok(current) => current,
        Err(status) => return status.into_response(),
    };

    let mut account = match reconcile(state.accounts.as_ref(), &assertion, current.as_ref()).await
    {
        Ok(account) => account,
        Err(err) => {
            info!("Sign-in via {} failed: {}", assertion.provider(), err);
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(CallbackFailure::from(&err)),
            )
                .into_response();
        }
    };

    if account.has_email() && !assertion.is_local() {
        // The external provider vouches for the address.
        if !account.email_confirmed() {
            let now = Utc::now();
            match state.accounts.confirm_email(account.id, now).await {
                Ok(()) => account.email_confirmed_at = Some(now),
                Err(err) => error!("Failed to confirm email for {}: {}", account.name, err),
            }
        }
    } else if account.has_email() && !account.email_confirmed() {
        enqueue_confirmation(state.mailer.as_ref(), &account);
    }

    // Rotate: the old session, if any, is replaced.
    session::end_session(&state, &headers).await;
    let cookie = match session::start_session(&state, account.id).await {
        Ok(cookie) => cookie,
        Err(err) => {
            error!("Failed to start session: {:?}", err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Error starting session");
        }
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, cookie);

    let body = CallbackResponse {
        next: NextStep::for_account(&account),
        account: AccountView::from(&account),
    };
    (StatusCode::OK, response_headers, Json(body)).into_response()
}

#[derive(Deserialize, Debug, IntoParams)]
pub struct FailureQuery {
    /// Machine-readable reason sent by the identity exchange.
    pub message: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AuthFailure {
    pub error: String,
    pub message: String,
}

/// `invalid_credentials` -> `Invalid credentials`.
fn humanize(reason: &str) -> String {
    let spaced = reason.trim().replace('_', " ");
    let mut chars = spaced.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

#[utoipa::path(
    get,
    path= "/v1/auth/failure",
    params(FailureQuery),
    responses (
        (status = 401, description = "Provider sign-in failed", body = AuthFailure),
    ),
    tag= "auth"
)]
pub async fn failure(Query(query): Query<FailureQuery>) -> impl IntoResponse {
    let reason = query
        .message
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| "unknown_error".to_string());
    let message = humanize(&reason);
    (
        StatusCode::UNAUTHORIZED,
        Json(AuthFailure {
            error: reason,
            message,
        }),
    )
}

#[utoipa::path(
    post,
    path= "/v1/auth/signout",
    responses (
        (status = 204, description = "Session cleared"),
    ),
    tag= "auth"
)]
pub async fn signout(headers: HeaderMap, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    session::end_session(&state, &headers).await;

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, session::clear_session_cookie());
    (StatusCode::NO_CONTENT, response_headers)
}
