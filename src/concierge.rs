//! The AI concierge turn: authenticate, resume the conversation, ask the
//! model, record the outcome and alert staff when a human is needed.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::app::AppState;
use crate::completion::{complete_or_escalate, fallback_reply};
use crate::escalation::record_outcome;
use crate::identity::{bearer_token, resolve_member, AuthError};
use crate::notify::{spawn_staff_dispatch, DispatchReport, StaffAlert};
use crate::prompting::{assemble_transcript, render_system_prompt, AiConciergeConfig};
use crate::store::{ConciergeStore, StoreError};
use crate::types::{Caller, ConciergeReply, ConciergeRequestBody, Language, MemberContext};

#[derive(Debug, Error)]
pub enum ConciergeError {
    #[error("Server not configured correctly")]
    NotConfigured,
    #[error("Missing auth token")]
    MissingToken,
    #[error("Invalid user")]
    InvalidUser(#[source] AuthError),
    #[error("Missing or invalid \"message\"")]
    InvalidMessage,
    #[error("Conversation not allowed")]
    ConversationForbidden,
    #[error("{context}")]
    Pipeline {
        context: &'static str,
        #[source]
        source: StoreError,
        language: Language,
    },
}

impl IntoResponse for ConciergeError {
    fn into_response(self) -> Response {
        match &self {
            Self::NotConfigured => {
                tracing::error!("concierge called without required secrets");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": self.to_string() })),
                )
                    .into_response()
            }
            Self::MissingToken => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            Self::InvalidUser(err) => {
                tracing::warn!(error = %err, "token verification failed");
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": self.to_string() })),
                )
                    .into_response()
            }
            Self::InvalidMessage => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            Self::ConversationForbidden => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            Self::Pipeline {
                context,
                source,
                language,
            } => {
                tracing::error!(error = %source, "{context}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": context,
                        "assistant_reply": fallback_reply(*language),
                        "needs_human": true,
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// A finished turn. `dispatch` is the background staff alert, present only
/// when a handoff was recorded.
pub struct ConciergeTurn {
    pub reply: ConciergeReply,
    pub dispatch: Option<JoinHandle<DispatchReport>>,
}

pub fn parse_request_body(body: &[u8]) -> Result<ConciergeRequestBody, ConciergeError> {
    let value =
        serde_json::from_slice::<Value>(body).map_err(|_| ConciergeError::InvalidMessage)?;
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .filter(|message| !message.is_empty())
        .ok_or(ConciergeError::InvalidMessage)?;
    let conversation_id = match value.get("conversationId") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) if id.trim().is_empty() => None,
        Some(Value::String(id)) => Some(id.trim().to_string()),
        Some(other) => Some(other.to_string()),
    };
    Ok(ConciergeRequestBody {
        conversation_id,
        message: message.to_string(),
    })
}

/// Creates a conversation when none is given, otherwise checks the caller
/// owns it. Unknown, foreign and malformed ids are indistinguishable.
pub async fn resolve_conversation(
    store: &dyn ConciergeStore,
    member: &MemberContext,
    requested: Option<&str>,
) -> Result<Uuid, ConciergeError> {
    let Some(requested) = requested else {
        let conversation = store
            .create_conversation(member.user_id, member.tier.priority())
            .await
            .map_err(|source| ConciergeError::Pipeline {
                context: "Could not create conversation",
                source,
                language: member.language,
            })?;
        tracing::info!(conversation_id = %conversation.id, user_id = %member.user_id, "conversation created");
        return Ok(conversation.id);
    };

    let Ok(id) = Uuid::parse_str(requested) else {
        return Err(ConciergeError::ConversationForbidden);
    };
    let conversation = store
        .find_conversation(id)
        .await
        .map_err(|source| ConciergeError::Pipeline {
            context: "Could not load conversation",
            source,
            language: member.language,
        })?;
    match conversation {
        Some(conversation) if conversation.user_id == member.user_id => Ok(conversation.id),
        _ => {
            tracing::warn!(conversation_id = %id, user_id = %member.user_id, "conversation not found or owned by another member");
            Err(ConciergeError::ConversationForbidden)
        }
    }
}

async fn load_ai_config(store: &dyn ConciergeStore, default_model: &str) -> AiConciergeConfig {
    match store.active_ai_config().await {
        Ok(row) => AiConciergeConfig::from_row(row.as_ref(), default_model),
        Err(err) => {
            tracing::warn!(error = %err, "could not load AI config, using built-in defaults");
            AiConciergeConfig::builtin(default_model)
        }
    }
}

pub async fn run_concierge(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<ConciergeTurn, ConciergeError> {
    let (Some(store), Some(auth), Some(completion)) =
        (state.store.as_ref(), state.auth.as_ref(), state.completion.as_ref())
    else {
        return Err(ConciergeError::NotConfigured);
    };

    let token = bearer_token(headers).ok_or(ConciergeError::MissingToken)?;
    let caller: Caller = auth
        .verify(&token)
        .await
        .map_err(ConciergeError::InvalidUser)?;
    let request = parse_request_body(body)?;

    let member = resolve_member(store.as_ref(), &caller).await;
    let conversation_id =
        resolve_conversation(store.as_ref(), &member, request.conversation_id.as_deref()).await?;

    store
        .insert_user_message(&caller, conversation_id, &request.message)
        .await
        .map_err(|source| ConciergeError::Pipeline {
            context: "Could not insert user message",
            source,
            language: member.language,
        })?;

    let config = load_ai_config(store.as_ref(), &state.settings.default_model).await;
    let system_prompt = render_system_prompt(&config, &member);
    let history = store
        .recent_messages(&caller, conversation_id, state.settings.history_limit)
        .await
        .map_err(|source| ConciergeError::Pipeline {
            context: "Could not fetch history",
            source,
            language: member.language,
        })?;
    let transcript = assemble_transcript(system_prompt, &history);

    let result = complete_or_escalate(completion, &config, &transcript, &member).await;
    let outcome = record_outcome(store.as_ref(), &member, conversation_id, &result).await;

    let dispatch = match (outcome.handoff_id, outcome.concierge_request_id) {
        (Some(_), Some(concierge_request_id)) => {
            let alert = StaffAlert::compose(
                &member,
                &result,
                concierge_request_id,
                Utc::now(),
                state.settings.staff_console_url.as_deref(),
            );
            Some(spawn_staff_dispatch(
                Arc::clone(store),
                state.notifier.clone(),
                alert,
            ))
        }
        _ => None,
    };

    tracing::info!(
        %conversation_id,
        intent = result.intent.as_str(),
        needs_human = result.needs_human,
        confidence = result.confidence,
        "concierge turn complete"
    );

    Ok(ConciergeTurn {
        reply: ConciergeReply {
            conversation_id,
            assistant_reply: result.assistant_reply,
            intent: result.intent,
            needs_human: result.needs_human,
            confidence: result.confidence,
            concierge_request_id: outcome.concierge_request_id,
        },
        dispatch,
    })
}

pub async fn handle_ai_concierge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match run_concierge(&state, &headers, &body).await {
        Ok(turn) => (StatusCode::OK, Json(turn.reply)).into_response(),
        Err(err) => err.into_response(),
    }
}
