//! Webhook that pushes reservation lifecycle updates to the member's device.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Datelike, Timelike, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::app::AppState;
use crate::notify::DeliveryError;
use crate::store::StoreError;
use crate::types::{Language, ReservationDetails, ReservationNotifyBody};

const SECRET_HEADER: &str = "x-webhook-secret";
const SECRET_DOMAIN: &[u8] = b"reservation-notify";
const MONTHS_ES: [&str; 12] = [
    "ene", "feb", "mar", "abr", "may", "jun", "jul", "ago", "sep", "oct", "nov", "dic",
];

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Missing reservationId or event")]
    MissingFields,
    #[error("Reservation not found")]
    NotFound,
    #[error("invalid webhook body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("store unavailable")]
    NotConfigured,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::MissingFields => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Body(_) | Self::NotConfigured | Self::Store(_) => {
                tracing::error!(error = %self, "reservation-notify failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Unexpected error in reservation-notify" })),
                )
                    .into_response();
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationEvent {
    Confirmed,
    Created,
    Cancelled,
    Other(String),
}

impl ReservationEvent {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "reservation_confirmed" => Self::Confirmed,
            "reservation_created" => Self::Created,
            "reservation_cancelled" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Confirmed => "reservation_confirmed",
            Self::Created => "reservation_created",
            Self::Cancelled => "reservation_cancelled",
            Self::Other(raw) => raw,
        }
    }
}

/// Compares the shared secret without leaking timing. An unset secret
/// rejects everything.
pub fn secret_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    let (Some(expected), Some(provided)) = (expected, provided) else {
        return false;
    };
    if expected.is_empty() {
        return false;
    }
    let Ok(mut expected_mac) = Hmac::<Sha256>::new_from_slice(expected.as_bytes()) else {
        return false;
    };
    expected_mac.update(SECRET_DOMAIN);
    let expected_tag = expected_mac.finalize().into_bytes();

    let Ok(mut provided_mac) = Hmac::<Sha256>::new_from_slice(provided.as_bytes()) else {
        return false;
    };
    provided_mac.update(SECRET_DOMAIN);
    provided_mac.verify_slice(&expected_tag).is_ok()
}

pub fn format_schedule(at: DateTime<Utc>, language: Language) -> String {
    match language {
        Language::Es => format!(
            "{} {} {}, {:02}:{:02} UTC",
            at.day(),
            MONTHS_ES[at.month0() as usize],
            at.year(),
            at.hour(),
            at.minute()
        ),
        Language::En => at.format("%b %-d, %Y, %-I:%M %p UTC").to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushContent {
    pub title: String,
    pub body: String,
}

pub fn compose_push(
    event: &ReservationEvent,
    language: Language,
    reservation: &ReservationDetails,
) -> PushContent {
    let es = language == Language::Es;
    let experience = reservation
        .experience_title
        .as_deref()
        .unwrap_or(if es { "tu experiencia" } else { "your experience" });
    let destination = reservation
        .destination_name
        .as_deref()
        .unwrap_or(if es { "tu destino" } else { "your destination" });
    let when = reservation
        .scheduled_at
        .map(|at| format_schedule(at, language));

    let (title, body) = match (event, es) {
        (ReservationEvent::Confirmed, true) => (
            "Reserva confirmada".to_string(),
            format!(
                "Tu experiencia \"{experience}\" en {destination} está confirmada{}.",
                when.map(|w| format!(" para {w}")).unwrap_or_default()
            ),
        ),
        (ReservationEvent::Confirmed, false) => (
            "Reservation confirmed".to_string(),
            format!(
                "Your experience \"{experience}\" in {destination} is confirmed{}.",
                when.map(|w| format!(" for {w}")).unwrap_or_default()
            ),
        ),
        (ReservationEvent::Created, true) => (
            "Solicitud de reserva recibida".to_string(),
            format!(
                "Hemos recibido tu solicitud para \"{experience}\" en {destination}. Te confirmaremos en breve."
            ),
        ),
        (ReservationEvent::Created, false) => (
            "Reservation request received".to_string(),
            format!(
                "We received your request for \"{experience}\" in {destination}. We will confirm it shortly."
            ),
        ),
        (ReservationEvent::Cancelled, true) => (
            "Reserva cancelada".to_string(),
            format!("Tu reserva de \"{experience}\" ha sido cancelada."),
        ),
        (ReservationEvent::Cancelled, false) => (
            "Reservation cancelled".to_string(),
            format!("Your reservation for \"{experience}\" has been cancelled."),
        ),
        (ReservationEvent::Other(_), true) => {
            ("Duke Life".to_string(), "Actualización de tu reserva.".to_string())
        }
        (ReservationEvent::Other(_), false) => {
            ("Duke Life".to_string(), "Your reservation was updated.".to_string())
        }
    };
    PushContent { title, body }
}

#[derive(Debug, Serialize)]
struct ExpoPushMessage<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    sound: &'static str,
    data: Value,
}

#[derive(Clone)]
pub struct ExpoPushClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ExpoPushClient {
    pub fn new(http: reqwest::Client, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
        }
    }

    pub async fn send(
        &self,
        token: &str,
        content: &PushContent,
        data: Value,
    ) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("accept", "application/json")
            .json(&ExpoPushMessage {
                to: token,
                title: &content.title,
                body: &content.body,
                sound: "default",
                data,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status { status, body });
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Skipped,
}

pub async fn notify_reservation(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<NotifyOutcome, WebhookError> {
    let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if !secret_matches(state.settings.reservation_notify_secret.as_deref(), provided) {
        return Err(WebhookError::Unauthorized);
    }

    let payload = serde_json::from_slice::<ReservationNotifyBody>(body)?;
    let (Some(reservation_id), Some(event)) = (
        payload.reservation_id.filter(|v| !v.trim().is_empty()),
        payload.event.filter(|v| !v.trim().is_empty()),
    ) else {
        return Err(WebhookError::MissingFields);
    };
    let event = ReservationEvent::parse(event.trim());

    let store = state.store.as_ref().ok_or(WebhookError::NotConfigured)?;
    let Ok(reservation_id) = Uuid::parse_str(reservation_id.trim()) else {
        return Err(WebhookError::NotFound);
    };
    let reservation = store
        .reservation_details(reservation_id)
        .await?
        .ok_or(WebhookError::NotFound)?;

    let target = match store.push_target(reservation.user_id).await {
        Ok(target) => target.unwrap_or_default(),
        Err(err) => {
            tracing::error!(user_id = %reservation.user_id, error = %err, "failed to load push target");
            Default::default()
        }
    };
    let Some(token) = target.expo_push_token.filter(|t| !t.trim().is_empty()) else {
        tracing::warn!(user_id = %reservation.user_id, "member has no expo push token, skipping");
        return Ok(NotifyOutcome::Skipped);
    };

    let language = Language::from_profile(target.preferred_language.as_deref());
    let content = compose_push(&event, language, &reservation);
    let data = json!({
        "event": event.as_str(),
        "reservationId": reservation.id,
        "experienceId": reservation.experience_id,
    });
    if let Err(err) = state.expo.send(&token, &content, data).await {
        tracing::error!(reservation_id = %reservation.id, error = %err, "expo push failed");
    }
    Ok(NotifyOutcome::Sent)
}

pub async fn handle_reservation_notify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match notify_reservation(&state, &headers, &body).await {
        Ok(NotifyOutcome::Sent) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Ok(NotifyOutcome::Skipped) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "skipped": "no_expo_push_token" })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}
