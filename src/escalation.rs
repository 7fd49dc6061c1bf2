use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::completion::ConciergeResult;
use crate::store::ConciergeStore;
use crate::types::{
    ConciergeRequestDraft, ConversationStatus, HandoffTrigger, MemberContext, MembershipTier,
    NewHandoff, RequestStatus,
};

pub const HANDOFF_REASON: &str = "needs_human_or_low_confidence";

/// What the bookkeeping for one turn managed to write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EscalationOutcome {
    pub concierge_request_id: Option<Uuid>,
    pub handoff_id: Option<Uuid>,
}

pub fn sla_deadline(tier: MembershipTier, now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::minutes(tier.sla_minutes())
}

pub fn request_draft(
    conversation_id: Uuid,
    member: &MemberContext,
    result: &ConciergeResult,
    now: DateTime<Utc>,
) -> ConciergeRequestDraft {
    let (status, deadline) = if result.needs_human {
        (RequestStatus::PendingHuman, Some(sla_deadline(member.tier, now)))
    } else {
        (RequestStatus::PendingAi, None)
    };
    ConciergeRequestDraft {
        conversation_id,
        user_id: member.user_id,
        category: result.intent,
        status,
        ai_confidence: result.confidence,
        summary: result.summary.clone(),
        structured_payload: result.structured_payload.clone(),
        sla_deadline: deadline,
    }
}

/// Persists the assistant reply, the live request, the optional handoff and
/// the conversation state, in that order. Every write is best-effort: a
/// failure is logged and the remaining steps still run.
pub async fn record_outcome(
    store: &dyn ConciergeStore,
    member: &MemberContext,
    conversation_id: Uuid,
    result: &ConciergeResult,
) -> EscalationOutcome {
    let mut outcome = EscalationOutcome::default();

    if let Err(err) = store
        .insert_ai_message(conversation_id, &result.assistant_reply)
        .await
    {
        tracing::error!(%conversation_id, error = %err, "failed to store assistant reply");
    }

    let draft = request_draft(conversation_id, member, result, Utc::now());
    match store.upsert_live_request(&draft).await {
        Ok(upsert) => {
            tracing::info!(
                %conversation_id,
                concierge_request_id = %upsert.id,
                created = upsert.created,
                status = draft.status.as_str(),
                "concierge request recorded"
            );
            outcome.concierge_request_id = Some(upsert.id);
        }
        Err(err) => {
            tracing::error!(%conversation_id, error = %err, "failed to upsert concierge request");
        }
    }

    if result.needs_human {
        if let Some(concierge_request_id) = outcome.concierge_request_id {
            let handoff = NewHandoff {
                concierge_request_id,
                triggered_by: HandoffTrigger::Ai,
                reason: HANDOFF_REASON.to_string(),
            };
            match store.insert_handoff(&handoff).await {
                Ok(id) => outcome.handoff_id = Some(id),
                Err(err) => {
                    tracing::error!(%conversation_id, %concierge_request_id, error = %err, "failed to create handoff");
                }
            }
        }
    }

    let status = if result.needs_human {
        ConversationStatus::WaitingForHuman
    } else {
        ConversationStatus::Active
    };
    if let Err(err) = store
        .update_conversation_state(conversation_id, status, member.tier.priority())
        .await
    {
        tracing::error!(%conversation_id, error = %err, "failed to update conversation state");
    }

    outcome
}
