//! Staff alerts for escalated requests, delivered by email and WhatsApp.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::completion::ConciergeResult;
use crate::config::{EmailSettings, WhatsAppSettings};
use crate::prompting::{render_staff_alert_html, render_staff_alert_text, StaffAlertContext};
use crate::store::ConciergeStore;
use crate::types::{ChannelType, MemberContext, StaffNotificationChannel};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{0} provider is not configured")]
    NotConfigured(&'static str),
    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Rendered alert, shared by every channel of one dispatch.
#[derive(Debug, Clone)]
pub struct StaffAlert {
    pub concierge_request_id: Uuid,
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl StaffAlert {
    pub fn compose(
        member: &MemberContext,
        result: &ConciergeResult,
        concierge_request_id: Uuid,
        created_at: DateTime<Utc>,
        console_url: Option<&str>,
    ) -> Self {
        let deep_link = console_url.map(|base| format!("{base}/requests/{concierge_request_id}"));
        let created_at = created_at.to_rfc3339();
        let ctx = StaffAlertContext {
            tier: member.tier.as_str(),
            intent: result.intent.as_str(),
            destination: member.default_destination.as_deref().unwrap_or("no_definido"),
            language: member.language,
            member_name: member.full_name.as_deref(),
            member_email: member.email.as_deref(),
            summary: &result.summary,
            created_at: &created_at,
            sla_minutes: member.tier.sla_minutes(),
            deep_link: deep_link.as_deref(),
        };
        Self {
            concierge_request_id,
            subject: format!(
                "Nueva solicitud de concierge · {} · {}",
                member.tier.as_str().replace('_', " ").to_uppercase(),
                result.intent.as_str()
            ),
            html: render_staff_alert_html(&ctx),
            text: render_staff_alert_text(&ctx),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct StaffNotifier {
    http: reqwest::Client,
    email: EmailSettings,
    whatsapp: WhatsAppSettings,
}

impl StaffNotifier {
    pub fn new(http: reqwest::Client, email: EmailSettings, whatsapp: WhatsAppSettings) -> Self {
        Self {
            http,
            email,
            whatsapp,
        }
    }

    async fn send_email(&self, to: &str, alert: &StaffAlert) -> Result<(), DeliveryError> {
        let (Some(api_key), Some(from)) =
            (self.email.api_key.as_deref(), self.email.from.as_deref())
        else {
            return Err(DeliveryError::NotConfigured("email"));
        };
        let response = self
            .http
            .post(&self.email.api_url)
            .bearer_auth(api_key)
            .json(&json!({
                "from": from,
                "to": [to],
                "subject": alert.subject,
                "html": alert.html,
            }))
            .send()
            .await?;
        check_status(response).await
    }

    async fn send_whatsapp(&self, to: &str, alert: &StaffAlert) -> Result<(), DeliveryError> {
        let (Some(access_token), Some(phone_number_id)) = (
            self.whatsapp.access_token.as_deref(),
            self.whatsapp.phone_number_id.as_deref(),
        ) else {
            return Err(DeliveryError::NotConfigured("whatsapp"));
        };
        let response = self
            .http
            .post(format!("{}/{phone_number_id}/messages", self.whatsapp.api_url))
            .bearer_auth(access_token)
            .json(&json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "text",
                "text": { "body": alert.text },
            }))
            .send()
            .await?;
        check_status(response).await
    }

    pub async fn deliver(
        &self,
        channel: &StaffNotificationChannel,
        alert: &StaffAlert,
    ) -> Result<(), DeliveryError> {
        match channel.channel_type {
            ChannelType::Email => self.send_email(&channel.address, alert).await,
            ChannelType::Whatsapp => self.send_whatsapp(&channel.address, alert).await,
        }
    }

    /// Sends to every channel concurrently; each failure is logged on its own.
    pub async fn dispatch(
        &self,
        channels: &[StaffNotificationChannel],
        alert: &StaffAlert,
    ) -> DispatchReport {
        let results = join_all(channels.iter().map(|channel| async move {
            (channel, self.deliver(channel, alert).await)
        }))
        .await;

        let mut report = DispatchReport::default();
        for (channel, result) in results {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::info!(
                        concierge_request_id = %alert.concierge_request_id,
                        channel = channel.channel_type.as_str(),
                        address = %channel.address,
                        "staff notified"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        concierge_request_id = %alert.concierge_request_id,
                        channel = channel.channel_type.as_str(),
                        address = %channel.address,
                        error = %err,
                        "staff notification failed"
                    );
                }
            }
        }
        report
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(DeliveryError::Status { status, body })
}

/// Runs the whole dispatch in the background. Callers that only fire and
/// forget can drop the handle.
pub fn spawn_staff_dispatch(
    store: Arc<dyn ConciergeStore>,
    notifier: StaffNotifier,
    alert: StaffAlert,
) -> JoinHandle<DispatchReport> {
    tokio::spawn(async move {
        let channels = match store.active_staff_channels().await {
            Ok(channels) => channels,
            Err(err) => {
                tracing::error!(
                    concierge_request_id = %alert.concierge_request_id,
                    error = %err,
                    "failed to load staff notification channels"
                );
                return DispatchReport::default();
            }
        };
        if channels.is_empty() {
            tracing::warn!(
                concierge_request_id = %alert.concierge_request_id,
                "no active staff notification channels"
            );
            return DispatchReport::default();
        }
        notifier.dispatch(&channels, &alert).await
    })
}
