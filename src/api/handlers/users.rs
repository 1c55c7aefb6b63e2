//! Account endpoints: local registration, listing, lookup, deletion,
//! identity unlinking and confirmation resend.

use axum::{
    extract::{Extension, Path},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::error_response;
use crate::{
    accounts::{
        unlink, valid_email, Account, AccountStore, Constraint, LinkedIdentity, StoreError,
        ADMIN_FACILITY, LOCAL_PROVIDER,
    },
    api::{mailer::enqueue_confirmation, session, AppState},
};

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountView {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub email_confirmed: bool,
    pub identities: Vec<LinkedIdentity>,
    /// e.g. `Admin (rwx), Editor (rw)`
    pub facilities: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Whether the local identity provider holds a record for this handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_credential: Option<bool>,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            name: account.name.clone(),
            email: account.email.clone(),
            email_confirmed: account.email_confirmed(),
            identities: account.identities.clone(),
            facilities: account.facilities_summary(),
            created_at: account.created_at,
            local_credential: None,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Registration {
    pub name: String,
    pub email: Option<String>,
    /// Opaque record kept by the local identity provider, base64 encoded.
    pub credential: String,
}

async fn find_target(store: &dyn AccountStore, name: &str) -> Result<Account, Response> {
    match store.find_by_handle(name).await {
        Ok(Some(account)) => Ok(account),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Account not found")),
        Err(err) => {
            error!("Failed to load account {}: {}", name, err);
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

#[utoipa::path(
    post,
    path= "/v1/users",
    request_body = Registration,
    responses (
        (status = 201, description = "Account created", body = AccountView),
        (status = 400, description = "Invalid registration", body = super::ErrorBody),
        (status = 409, description = "Account name already taken", body = super::ErrorBody),
    ),
    tag= "users"
)]
#[instrument(skip(state, payload))]
pub async fn register(
    state: Extension<Arc<AppState>>,
    payload: Option<Json<Registration>>,
) -> Response {
    let registration: Registration = match payload {
        Some(Json(payload)) => payload,
        None => return error_response(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let Ok(record) = Base64::decode_vec(registration.credential.trim()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid credential encoding");
    };
    if record.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing credential");
    }

    let name = registration.name.trim().to_string();
    let mut account = Account::new(name.clone());
    account.email = registration
        .email
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty());
    account.add_identity(LinkedIdentity::new(LOCAL_PROVIDER, name.clone()));

    if let Err(err) = account.validate() {
        debug!("Invalid registration: {}", err);
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }

    // The local credential commits with the account or not at all.
    match state.accounts.create_local(&account, &record).await {
        Ok(()) => (),
        Err(StoreError::UniqueViolation(Constraint::Handle | Constraint::Identity)) => {
            return error_response(StatusCode::CONFLICT, "Account name already taken");
        }
        Err(err) => {
            error!("Failed to create account {}: {}", name, err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Error creating account");
        }
    }

    if account.has_email() {
        enqueue_confirmation(state.mailer.as_ref(), &account);
    }

    info!("Registered account {}", name);
    (StatusCode::CREATED, Json(AccountView::from(&account))).into_response()
}

#[utoipa::path(
    get,
    path= "/v1/users",
    responses (
        (status = 200, description = "All accounts ordered by name", body = [AccountView]),
        (status = 401, description = "Not signed in"),
        (status = 403, description = "Admin read access required"),
    ),
    tag= "users"
)]
pub async fn list(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    let current = match session::require_account(&state, &headers).await {
        Ok(current) => current,
        Err(status) => return status.into_response(),
    };
    if !current.can_read(ADMIN_FACILITY) {
        return StatusCode::FORBIDDEN.into_response();
    }

    match state.accounts.list().await {
        Ok(accounts) => {
            let views: Vec<AccountView> = accounts.iter().map(AccountView::from).collect();
            (StatusCode::OK, Json(views)).into_response()
        }
        Err(err) => {
            error!("Failed to list accounts: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    get,
    path= "/v1/users/{name}",
    params(("name" = String, Path, description = "Account name")),
    responses (
        (status = 200, description = "Account", body = AccountView),
        (status = 401, description = "Not signed in"),
        (status = 403, description = "Neither the owner nor an admin"),
        (status = 404, description = "Account not found", body = super::ErrorBody),
    ),
    tag= "users"
)]
pub async fn show(
    Path(name): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Response {
    let current = match session::require_account(&state, &headers).await {
        Ok(current) => current,
        Err(status) => return status.into_response(),
    };
    let target = match find_target(state.accounts.as_ref(), &name).await {
        Ok(target) => target,
        Err(response) => return response,
    };
    if current.id != target.id && !current.can_read(ADMIN_FACILITY) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let mut view = AccountView::from(&target);
    match state.accounts.has_local_credential(&target.name).await {
        Ok(present) => view.local_credential = Some(present),
        Err(err) => error!("Failed to check local credential for {}: {}", target.name, err),
    }
    (StatusCode::OK, Json(view)).into_response()
}

#[utoipa::path(
    delete,
    path= "/v1/users/{name}",
    params(("name" = String, Path, description = "Account name")),
    responses (
        (status = 204, description = "Account deleted"),
        (status = 401, description = "Not signed in"),
        (status = 403, description = "Neither the owner nor an admin"),
        (status = 404, description = "Account not found", body = super::ErrorBody),
    ),
    tag= "users"
)]
#[instrument(skip(headers, state))]
pub async fn destroy(
    Path(name): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Response {
    let current = match session::require_account(&state, &headers).await {
        Ok(current) => current,
        Err(status) => return status.into_response(),
    };
    let target = match find_target(state.accounts.as_ref(), &name).await {
        Ok(target) => target,
        Err(response) => return response,
    };
    let is_self = current.id == target.id;
    if !is_self && !current.can_write(ADMIN_FACILITY) {
        return StatusCode::FORBIDDEN.into_response();
    }

    match state.accounts.destroy(target.id).await {
        Ok(()) => {
            info!("Account {} deleted by {}", target.name, current.name);
            let mut response_headers = HeaderMap::new();
            if is_self {
                response_headers.insert(SET_COOKIE, session::clear_session_cookie());
            }
            (StatusCode::NO_CONTENT, response_headers).into_response()
        }
        Err(StoreError::NotFound) => error_response(StatusCode::NOT_FOUND, "Account not found"),
        Err(err) => {
            error!("Failed to delete account {}: {}", target.name, err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    delete,
    path= "/v1/users/{name}/identities/{provider}/{uid}",
    params(
        ("name" = String, Path, description = "Account name"),
        ("provider" = String, Path, description = "Provider name"),
        ("uid" = String, Path, description = "Provider-scoped user id"),
    ),
    responses (
        (status = 200, description = "Identity unlinked", body = AccountView),
        (status = 401, description = "Not signed in"),
        (status = 403, description = "Only the owner may unlink"),
        (status = 404, description = "Identity not linked to this account", body = super::ErrorBody),
    ),
    tag= "users"
)]
pub async fn unlink_identity(
    Path((name, provider, uid)): Path<(String, String, String)>,
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Response {
    let current = match session::require_account(&state, &headers).await {
        Ok(current) => current,
        Err(status) => return status.into_response(),
    };
    if current.name != name {
        return StatusCode::FORBIDDEN.into_response();
    }

    match unlink(state.accounts.as_ref(), &current, &provider, &uid).await {
        Ok(account) => (StatusCode::OK, Json(AccountView::from(&account))).into_response(),
        Err(StoreError::NotFound) => {
            error_response(StatusCode::NOT_FOUND, "Identity not linked to this account")
        }
        Err(err) => {
            error!("Failed to unlink {}/{} from {}: {}", provider, uid, name, err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path= "/v1/users/{name}/confirmation",
    params(("name" = String, Path, description = "Account name")),
    responses (
        (status = 202, description = "Confirmation mail queued"),
        (status = 401, description = "Not signed in"),
        (status = 403, description = "Only the owner may resend"),
        (status = 409, description = "Email already confirmed", body = super::ErrorBody),
        (status = 422, description = "No email on file", body = super::ErrorBody),
    ),
    tag= "users"
)]
pub async fn resend_confirmation(
    Path(name): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Response {
    let current = match session::require_account(&state, &headers).await {
        Ok(current) => current,
        Err(status) => return status.into_response(),
    };
    if current.name != name {
        return StatusCode::FORBIDDEN.into_response();
    }
    if !current.has_email() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "No email on file");
    }
    if current.email_confirmed() {
        return error_response(StatusCode::CONFLICT, "Email already confirmed");
    }
    if current.email.as_deref().is_some_and(|email| !valid_email(email)) {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "Invalid email on file");
    }

    enqueue_confirmation(state.mailer.as_ref(), &current);
    StatusCode::ACCEPTED.into_response()
}
