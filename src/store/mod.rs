//! Persistence seam for the concierge pipeline.
//!
//! Methods taking a [`Caller`] run in the member's row-level scope; the rest
//! use the privileged service connection.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    Caller, ConciergeRequestDraft, Conversation, ConversationStatus, MembershipTier, Message,
    NewHandoff, Profile, PushTarget, RequestUpsert, ReservationDetails, StaffNotificationChannel,
};

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unexpected value {value:?} in {column}")]
    Decode { column: &'static str, value: String },
}

#[async_trait]
pub trait ConciergeStore: Send + Sync {
    async fn active_membership_tier(
        &self,
        caller: &Caller,
    ) -> Result<Option<MembershipTier>, StoreError>;

    async fn profile(&self, caller: &Caller) -> Result<Option<Profile>, StoreError>;

    async fn insert_user_message(
        &self,
        caller: &Caller,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// The `limit` most recent visible messages, oldest first.
    async fn recent_messages(
        &self,
        caller: &Caller,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    async fn create_conversation(
        &self,
        user_id: Uuid,
        priority: i16,
    ) -> Result<Conversation, StoreError>;

    async fn find_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    async fn update_conversation_state(
        &self,
        id: Uuid,
        status: ConversationStatus,
        priority: i16,
    ) -> Result<(), StoreError>;

    async fn insert_ai_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Latest active AI behaviour row as raw JSON, coerced by the caller.
    async fn active_ai_config(&self) -> Result<Option<Value>, StoreError>;

    /// Update the conversation's live request in place, or insert one.
    async fn upsert_live_request(
        &self,
        draft: &ConciergeRequestDraft,
    ) -> Result<RequestUpsert, StoreError>;

    async fn insert_handoff(&self, handoff: &NewHandoff) -> Result<Uuid, StoreError>;

    async fn active_staff_channels(&self) -> Result<Vec<StaffNotificationChannel>, StoreError>;

    async fn reservation_details(
        &self,
        id: Uuid,
    ) -> Result<Option<ReservationDetails>, StoreError>;

    async fn push_target(&self, user_id: Uuid) -> Result<Option<PushTarget>, StoreError>;
}
