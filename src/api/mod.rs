#![allow(clippy::needless_for_each)]

use crate::{
    accounts::{AccountStore, SessionStore},
    content::Catalog,
};
use anyhow::Result;
use secrecy::SecretString;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::{delete, get, post},
    Extension, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod exchange;
pub mod handlers;
pub mod mailer;
pub mod session;

pub use mailer::{EmailMessage, LogMailer, Mailer};

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

/// Shared handler state, injected as `Extension<Arc<AppState>>`.
pub struct AppState {
    pub accounts: Arc<dyn AccountStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub catalog: Arc<Catalog>,
    pub mailer: Arc<dyn Mailer>,
    pub session_ttl_seconds: i64,
    /// Shared with the identity exchange; callbacks are refused while unset.
    pub exchange_secret: Option<SecretString>,
}

impl AppState {
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        sessions: Arc<dyn SessionStore>,
        catalog: Catalog,
    ) -> Self {
        Self {
            accounts,
            sessions,
            catalog: Arc::new(catalog),
            mailer: Arc::new(LogMailer),
            session_ttl_seconds: session::DEFAULT_SESSION_TTL_SECONDS,
            exchange_secret: None,
        }
    }

    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    #[must_use]
    pub fn with_exchange_secret(mut self, secret: Option<SecretString>) -> Self {
        self.exchange_secret = secret;
        self
    }

    #[must_use]
    pub const fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::auth::callback,
        handlers::auth::failure,
        handlers::auth::signout,
        handlers::users::register,
        handlers::users::list,
        handlers::users::show,
        handlers::users::destroy,
        handlers::users::unlink_identity,
        handlers::users::resend_confirmation,
        handlers::sections::list,
        handlers::sections::show,
        handlers::sections::banners,
    ),
    components(schemas(
        handlers::ErrorBody,
        handlers::health::Health,
        handlers::auth::NextStep,
        handlers::auth::CallbackResponse,
        handlers::auth::CallbackFailure,
        handlers::auth::AuthFailure,
        handlers::users::AccountView,
        handlers::users::Registration,
        handlers::sections::SectionSummary,
        crate::accounts::ProviderCallback,
        crate::accounts::assertion::ProviderInfo,
        crate::accounts::LinkedIdentity,
        crate::content::Section,
        crate::content::Page,
        crate::content::Banner,
    )),
    tags(
        (name = "folio", description = "Sectioned content with multi-provider sign-in")
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// All routes with request-id and tracing layers applied.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "folio" }))
        .route("/v1/auth/callback", post(handlers::auth::callback))
        .route("/v1/auth/failure", get(handlers::auth::failure))
        .route("/v1/auth/signout", post(handlers::auth::signout))
        .route(
            "/v1/users",
            get(handlers::users::list).post(handlers::users::register),
        )
        .route(
            "/v1/users/:name",
            get(handlers::users::show).delete(handlers::users::destroy),
        )
        .route(
            "/v1/users/:name/identities/:provider/:uid",
            delete(handlers::users::unlink_identity),
        )
        .route(
            "/v1/users/:name/confirmation",
            post(handlers::users::resend_confirmation),
        )
        .route("/v1/sections", get(handlers::sections::list))
        .route("/v1/sections/:permalink", get(handlers::sections::show))
        .route("/v1/banners", get(handlers::sections::banners))
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state.clone())),
        )
        .route(
            "/health",
            get(handlers::health::health).options(handlers::health::health),
        )
        .layer(Extension(state))
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Gracefully shutdown");
            }
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
