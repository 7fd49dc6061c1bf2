//! Chat-completion client and the parser for the concierge's structured reply.
//!
//! Nothing in here fails the member's request: transport errors, non-2xx
//! answers, timeouts and unparseable output all collapse into
//! [`fallback_result`], which always escalates to a human.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::prompting::{AiConciergeConfig, ChatTurn};
use crate::types::{Intent, Language, MemberContext};

const DEFAULT_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("completion API returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion had empty content")]
    EmptyContent,
    #[error("completion content is not a JSON object: {0}")]
    Malformed(String),
}

#[derive(Debug, Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatTurn],
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

impl<'a> CompletionRequest<'a> {
    pub fn new(config: &'a AiConciergeConfig, messages: &'a [ChatTurn]) -> Self {
        Self {
            model: &config.model,
            messages,
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            response_format: config.response_format.map(|format| format.to_request_value()),
        }
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
        }
    }

    /// Text content of the first choice.
    pub async fn complete(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<String, CompletionError> {
        tokio::time::timeout(self.timeout, self.send(request))
            .await
            .map_err(|_| CompletionError::Timeout(self.timeout))?
    }

    async fn send(&self, request: &CompletionRequest<'_>) -> Result<String, CompletionError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status { status, body });
        }
        let payload = response.json::<Value>().await?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(CompletionError::EmptyContent);
        }
        Ok(text)
    }
}

/// Normalised outcome of one concierge turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ConciergeResult {
    pub assistant_reply: String,
    pub intent: Intent,
    pub needs_human: bool,
    pub confidence: f64,
    pub summary: String,
    pub structured_payload: Option<Value>,
}

pub fn fallback_reply(language: Language) -> &'static str {
    match language {
        Language::Es => {
            "En este momento no puedo procesar tu solicitud, pero un concierge humano te apoyará en breve."
        }
        Language::En => {
            "I can't process your request right now, but a human concierge will assist you shortly."
        }
    }
}

fn default_reply(language: Language) -> &'static str {
    match language {
        Language::Es => "Estoy aquí para ayudarte con tus experiencias. ¿Qué necesitas exactamente?",
        Language::En => "I'm here to help with your experiences. What exactly do you need?",
    }
}

fn default_summary(language: Language, intent: Intent, user_id: Uuid) -> String {
    match language {
        Language::Es => format!(
            "Solicitud de tipo {} por parte del usuario {user_id}",
            intent.as_str()
        ),
        Language::En => format!("Request of type {} from user {user_id}", intent.as_str()),
    }
}

pub fn fallback_result(language: Language) -> ConciergeResult {
    ConciergeResult {
        assistant_reply: fallback_reply(language).to_string(),
        intent: Intent::Other,
        needs_human: true,
        confidence: 0.0,
        summary: "AI failure, auto-escalated to human concierge".to_string(),
        structured_payload: None,
    }
}

/// Removes a surrounding ```json / ``` fence if the model added one.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if text
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("```json"))
    {
        text = text.get(7..).unwrap_or_default().trim_start();
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn non_empty_text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

pub fn parse_concierge_result(
    raw: &str,
    member: &MemberContext,
) -> Result<ConciergeResult, CompletionError> {
    let cleaned = strip_code_fences(raw);
    let parsed = serde_json::from_str::<Value>(cleaned)
        .map_err(|err| CompletionError::Malformed(err.to_string()))?;
    let Some(fields) = parsed.as_object() else {
        return Err(CompletionError::Malformed(format!(
            "expected object, got {cleaned}"
        )));
    };

    let intent = Intent::coerce(fields.get("intent").and_then(Value::as_str));
    let confidence = fields
        .get("confidence")
        .and_then(Value::as_f64)
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_CONFIDENCE);
    let structured_payload = fields
        .get("structured_payload")
        .filter(|payload| payload.is_object())
        .cloned();

    Ok(ConciergeResult {
        assistant_reply: non_empty_text(fields.get("assistant_reply"))
            .unwrap_or_else(|| default_reply(member.language).to_string()),
        intent,
        needs_human: is_truthy(fields.get("needs_human")),
        confidence,
        summary: non_empty_text(fields.get("summary"))
            .unwrap_or_else(|| default_summary(member.language, intent, member.user_id)),
        structured_payload,
    })
}

/// Runs one completion and always returns a usable result.
pub async fn complete_or_escalate(
    client: &OpenAiClient,
    config: &AiConciergeConfig,
    transcript: &[ChatTurn],
    member: &MemberContext,
) -> ConciergeResult {
    let request = CompletionRequest::new(config, transcript);
    let raw = match client.complete(&request).await {
        Ok(raw) => raw,
        Err(err) => {
            tracing::error!(model = %config.model, error = %err, "completion failed, escalating to a human");
            return fallback_result(member.language);
        }
    };
    match parse_concierge_result(&raw, member) {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(error = %err, content = %raw, "could not parse completion, escalating to a human");
            fallback_result(member.language)
        }
    }
}
