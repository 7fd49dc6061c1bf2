use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{ConciergeStore, StoreError};
use crate::types::{
    Caller, ChannelType, ConciergeRequestDraft, Conversation, ConversationStatus, MembershipTier,
    Message, NewHandoff, Profile, PushTarget, RequestUpsert, ReservationDetails, SenderType,
    StaffNotificationChannel,
};

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_type, content, is_internal_note, created_at";
const CONVERSATION_COLUMNS: &str = "id, user_id, status, priority, created_at, updated_at";

/// Postgres-backed store. The pool connects with the service role; member
/// scoped statements downgrade to `authenticated` inside a transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn user_scope(
        &self,
        caller: &Caller,
    ) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let claims = json!({ "sub": caller.user_id, "role": "authenticated" }).to_string();
        sqlx::query(
            "SELECT set_config('role', 'authenticated', true), \
                    set_config('request.jwt.claims', $1, true)",
        )
        .bind(claims)
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }
}

fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    let sender: String = row.try_get("sender_type")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_type: SenderType::parse(&sender).ok_or(StoreError::Decode {
            column: "messages.sender_type",
            value: sender,
        })?,
        content: row.try_get("content")?,
        is_internal_note: row.try_get("is_internal_note")?,
        created_at: row.try_get("created_at")?,
    })
}

fn conversation_from_row(row: &PgRow) -> Result<Conversation, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        status: ConversationStatus::parse(&status).ok_or(StoreError::Decode {
            column: "conversations.status",
            value: status,
        })?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ConciergeStore for PgStore {
    async fn active_membership_tier(
        &self,
        caller: &Caller,
    ) -> Result<Option<MembershipTier>, StoreError> {
        let mut tx = self.user_scope(caller).await?;
        let tier = sqlx::query_scalar::<_, String>(
            "SELECT tier FROM memberships \
             WHERE user_id = $1 AND status = 'active' \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(caller.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(tier.as_deref().and_then(MembershipTier::parse))
    }

    async fn profile(&self, caller: &Caller) -> Result<Option<Profile>, StoreError> {
        let mut tx = self.user_scope(caller).await?;
        let row = sqlx::query(
            "SELECT full_name, default_destination, preferred_language FROM profiles WHERE id = $1",
        )
        .bind(caller.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Profile {
            full_name: row.try_get("full_name")?,
            default_destination: row.try_get("default_destination")?,
            preferred_language: row.try_get("preferred_language")?,
        }))
    }

    async fn insert_user_message(
        &self,
        caller: &Caller,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut tx = self.user_scope(caller).await?;
        let row = sqlx::query(&format!(
            "INSERT INTO messages (conversation_id, sender_type, content, is_internal_note) \
             VALUES ($1, 'user', $2, false) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(content)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        message_from_row(&row)
    }

    async fn recent_messages(
        &self,
        caller: &Caller,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let mut tx = self.user_scope(caller).await?;
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                 SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = $1 AND NOT is_internal_note \
                 ORDER BY created_at DESC, id DESC \
                 LIMIT $2 \
             ) recent \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn create_conversation(
        &self,
        user_id: Uuid,
        priority: i16,
    ) -> Result<Conversation, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO conversations (user_id, status, priority) \
             VALUES ($1, 'active', $2) RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(user_id)
        .bind(priority)
        .fetch_one(&self.pool)
        .await?;
        conversation_from_row(&row)
    }

    async fn find_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn update_conversation_state(
        &self,
        id: Uuid,
        status: ConversationStatus,
        priority: i16,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE conversations SET status = $1, priority = $2, updated_at = now() WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(priority)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_ai_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO messages (conversation_id, sender_type, content, is_internal_note) \
             VALUES ($1, 'ai', $2, false) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        message_from_row(&row)
    }

    async fn active_ai_config(&self) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query_scalar::<_, Value>(
            "SELECT to_jsonb(c) FROM ai_concierge_config c \
             WHERE c.is_active \
             ORDER BY c.created_at DESC, c.id DESC \
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_live_request(
        &self,
        draft: &ConciergeRequestDraft,
    ) -> Result<RequestUpsert, StoreError> {
        // Relies on the partial unique index over live statuses.
        let row = sqlx::query(
            r#"
            INSERT INTO concierge_requests (
                conversation_id, user_id, category, status, ai_confidence, summary,
                structured_payload, sla_deadline
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (conversation_id) WHERE status IN ('open', 'pending_ai', 'pending_human')
            DO UPDATE SET
                category = EXCLUDED.category,
                status = EXCLUDED.status,
                ai_confidence = EXCLUDED.ai_confidence,
                summary = EXCLUDED.summary,
                structured_payload = EXCLUDED.structured_payload,
                sla_deadline = EXCLUDED.sla_deadline,
                updated_at = now()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(draft.conversation_id)
        .bind(draft.user_id)
        .bind(draft.category.as_str())
        .bind(draft.status.as_str())
        .bind(draft.ai_confidence)
        .bind(&draft.summary)
        .bind(&draft.structured_payload)
        .bind(draft.sla_deadline)
        .fetch_one(&self.pool)
        .await?;
        Ok(RequestUpsert {
            id: row.try_get("id")?,
            created: row.try_get("inserted")?,
        })
    }

    async fn insert_handoff(&self, handoff: &NewHandoff) -> Result<Uuid, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO handoffs (concierge_request_id, triggered_by, reason) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(handoff.concierge_request_id)
        .bind(handoff.triggered_by.as_str())
        .bind(&handoff.reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn active_staff_channels(&self) -> Result<Vec<StaffNotificationChannel>, StoreError> {
        let rows = sqlx::query(
            "SELECT channel_type, address FROM staff_notification_channels \
             WHERE is_active ORDER BY channel_type, address",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut channels = Vec::with_capacity(rows.len());
        for row in rows {
            let channel_type: String = row.try_get("channel_type")?;
            let address: String = row.try_get("address")?;
            let Some(kind) = ChannelType::parse(&channel_type) else {
                tracing::warn!(channel_type = %channel_type, "skipping staff channel of unknown type");
                continue;
            };
            if address.trim().is_empty() {
                continue;
            }
            channels.push(StaffNotificationChannel {
                channel_type: kind,
                address: address.trim().to_string(),
            });
        }
        Ok(channels)
    }

    async fn reservation_details(
        &self,
        id: Uuid,
    ) -> Result<Option<ReservationDetails>, StoreError> {
        let row = sqlx::query(
            "SELECT r.id, r.user_id, r.experience_id, r.scheduled_at, \
                    e.title AS experience_title, d.name AS destination_name \
             FROM reservations r \
             LEFT JOIN experiences e ON e.id = r.experience_id \
             LEFT JOIN destinations d ON d.id = e.destination_id \
             WHERE r.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ReservationDetails {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            experience_id: row.try_get("experience_id")?,
            scheduled_at: row.try_get("scheduled_at")?,
            experience_title: row.try_get("experience_title")?,
            destination_name: row.try_get("destination_name")?,
        }))
    }

    async fn push_target(&self, user_id: Uuid) -> Result<Option<PushTarget>, StoreError> {
        let row = sqlx::query(
            "SELECT expo_push_token, preferred_language FROM profiles WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PushTarget {
            expo_push_token: row.try_get("expo_push_token")?,
            preferred_language: row.try_get("preferred_language")?,
        }))
    }
}
