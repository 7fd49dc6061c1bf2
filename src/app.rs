use std::{any::Any, convert::Infallible, sync::Arc};

use axum::{
    http::{header, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any as AnyOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

use crate::completion::{fallback_reply, OpenAiClient};
use crate::concierge::handle_ai_concierge;
use crate::config::Settings;
use crate::identity::AuthClient;
use crate::notify::StaffNotifier;
use crate::reservation_notify::{handle_reservation_notify, ExpoPushClient};
use crate::store::{ConciergeStore, PgStore};
use crate::types::Language;

pub const CONCIERGE_PATH: &str = "/functions/v1/ai-concierge";
pub const RESERVATION_NOTIFY_PATH: &str = "/functions/v1/reservation-notify";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid database configuration: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server runtime failure: {0}")]
    Serve(std::io::Error),
}

/// Shared handles for every request. Upstream clients are absent when their
/// secrets are missing; handlers answer with a configuration error then.
pub struct AppState {
    pub settings: Settings,
    pub store: Option<Arc<dyn ConciergeStore>>,
    pub auth: Option<AuthClient>,
    pub completion: Option<OpenAiClient>,
    pub notifier: StaffNotifier,
    pub expo: ExpoPushClient,
}

impl AppState {
    pub fn new(settings: Settings, store: Option<Arc<dyn ConciergeStore>>) -> Self {
        let http = reqwest::Client::new();
        let auth = match (&settings.supabase_url, &settings.supabase_anon_key) {
            (Some(url), Some(key)) => Some(AuthClient::new(http.clone(), url, key)),
            _ => None,
        };
        let completion = settings.openai_api_key.as_deref().map(|key| {
            OpenAiClient::new(
                http.clone(),
                &settings.openai_base_url,
                key,
                settings.completion_timeout,
            )
        });
        let notifier = StaffNotifier::new(
            http.clone(),
            settings.email.clone(),
            settings.whatsapp.clone(),
        );
        let expo = ExpoPushClient::new(http, &settings.expo_push_endpoint);
        Self {
            settings,
            store,
            auth,
            completion,
            notifier,
            expo,
        }
    }
}

fn cors(extra_headers: &[&'static str]) -> CorsLayer {
    let mut headers = vec![
        header::AUTHORIZATION,
        HeaderName::from_static("x-client-info"),
        HeaderName::from_static("apikey"),
        header::CONTENT_TYPE,
    ];
    headers.extend(extra_headers.iter().copied().map(HeaderName::from_static));
    CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(headers)
}

async fn method_not_allowed() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

fn panic_message(err: &(dyn Any + Send)) -> &str {
    err.downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}

fn concierge_panic_reply(err: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!(panic = panic_message(err.as_ref()), "ai-concierge handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Unexpected error in ai-concierge",
            "assistant_reply": fallback_reply(Language::default()),
            "needs_human": true,
        })),
    )
        .into_response()
}

fn reservation_notify_panic_reply(err: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!(panic = panic_message(err.as_ref()), "reservation-notify handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Unexpected error in reservation-notify" })),
    )
        .into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            CONCIERGE_PATH,
            post(handle_ai_concierge)
                .fallback(method_not_allowed)
                .layer::<_, Infallible>(CatchPanicLayer::custom(concierge_panic_reply))
                .layer(cors(&[])),
        )
        .route(
            RESERVATION_NOTIFY_PATH,
            post(handle_reservation_notify)
                .fallback(method_not_allowed)
                .layer::<_, Infallible>(CatchPanicLayer::custom(reservation_notify_panic_reply))
                .layer(cors(&["x-webhook-secret"])),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    tracing::debug!(?settings, "loaded settings");
    let missing = settings.missing_secrets();
    if !missing.is_empty() {
        tracing::warn!(
            missing = ?missing,
            "required secrets are missing; the concierge endpoint will answer 500"
        );
    }

    let store = match settings.database_url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect_lazy(url)?;
            if settings.run_migrations {
                sqlx::migrate!("./migrations").run(&pool).await?;
                tracing::info!("migrations applied");
            }
            Some(Arc::new(PgStore::new(pool)) as Arc<dyn ConciergeStore>)
        }
        None => None,
    };

    let port = settings.port;
    let app = router(Arc::new(AppState::new(settings, store)));

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| AppError::Bind {
            addr: addr.clone(),
            source,
        })?;

    tracing::info!("concierge server running at http://localhost:{port}");
    axum::serve(listener, app).await.map_err(AppError::Serve)
}
