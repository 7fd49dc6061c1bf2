//! In-process store used by the pipeline and router tests.

use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{ConciergeStore, StoreError};
use crate::types::{
    Caller, ConciergeRequestDraft, Conversation, ConversationStatus, MembershipTier, Message,
    NewHandoff, Profile, PushTarget, RequestStatus, RequestUpsert, ReservationDetails, SenderType,
    StaffNotificationChannel,
};

#[derive(Debug, Clone)]
pub struct StoredRequest {
    pub id: Uuid,
    pub draft: ConciergeRequestDraft,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredHandoff {
    pub id: Uuid,
    pub handoff: NewHandoff,
}

#[derive(Default)]
struct Tables {
    memberships: Vec<(Uuid, MembershipTier)>,
    profiles: Vec<(Uuid, Profile, Option<String>)>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    configs: Vec<Value>,
    requests: Vec<StoredRequest>,
    handoffs: Vec<StoredHandoff>,
    channels: Vec<StaffNotificationChannel>,
    reservations: Vec<ReservationDetails>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing timestamps so ordering never ties.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(next);
        next
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing: Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap()
    }

    /// Make the named operation fail with a pool timeout from now on.
    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    fn check(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.failing.lock().unwrap().contains(operation) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    pub fn set_membership(&self, user_id: Uuid, tier: MembershipTier) {
        self.tables().memberships.push((user_id, tier));
    }

    pub fn set_profile(&self, user_id: Uuid, profile: Profile, expo_push_token: Option<&str>) {
        self.tables()
            .profiles
            .push((user_id, profile, expo_push_token.map(str::to_string)));
    }

    pub fn add_config(&self, row: Value) {
        self.tables().configs.push(row);
    }

    pub fn add_channel(&self, channel: StaffNotificationChannel) {
        self.tables().channels.push(channel);
    }

    pub fn add_reservation(&self, reservation: ReservationDetails) {
        self.tables().reservations.push(reservation);
    }

    pub fn seed_conversation(&self, user_id: Uuid) -> Uuid {
        let mut tables = self.tables();
        let now = tables.tick();
        let id = Uuid::new_v4();
        tables.conversations.push(Conversation {
            id,
            user_id,
            status: ConversationStatus::Active,
            priority: 1,
            created_at: now,
            updated_at: now,
        });
        id
    }

    pub fn seed_message(&self, conversation_id: Uuid, sender_type: SenderType, content: &str) {
        self.seed(conversation_id, sender_type, content, false);
    }

    /// Staff-only note; never part of the member's transcript.
    pub fn seed_note(&self, conversation_id: Uuid, content: &str) {
        self.seed(conversation_id, SenderType::Human, content, true);
    }

    fn seed(&self, conversation_id: Uuid, sender_type: SenderType, content: &str, note: bool) {
        let mut tables = self.tables();
        let created_at = tables.tick();
        tables.messages.push(Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_type,
            content: content.to_string(),
            is_internal_note: note,
            created_at,
        });
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.tables().conversations.clone()
    }

    pub fn messages(&self, conversation_id: Uuid) -> Vec<Message> {
        self.tables()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn requests(&self, conversation_id: Uuid) -> Vec<StoredRequest> {
        self.tables()
            .requests
            .iter()
            .filter(|r| r.draft.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn handoffs(&self) -> Vec<StoredHandoff> {
        self.tables().handoffs.clone()
    }

    fn owns(tables: &Tables, caller: &Caller, conversation_id: Uuid) -> bool {
        tables
            .conversations
            .iter()
            .any(|c| c.id == conversation_id && c.user_id == caller.user_id)
    }

    fn push_message(
        tables: &mut Tables,
        conversation_id: Uuid,
        sender_type: SenderType,
        content: &str,
    ) -> Message {
        let created_at = tables.tick();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_type,
            content: content.to_string(),
            is_internal_note: false,
            created_at,
        };
        tables.messages.push(message.clone());
        message
    }
}

#[async_trait]
impl ConciergeStore for MemoryStore {
    async fn active_membership_tier(
        &self,
        caller: &Caller,
    ) -> Result<Option<MembershipTier>, StoreError> {
        self.check("active_membership_tier")?;
        Ok(self
            .tables()
            .memberships
            .iter()
            .rev()
            .find(|(user_id, _)| *user_id == caller.user_id)
            .map(|(_, tier)| *tier))
    }

    async fn profile(&self, caller: &Caller) -> Result<Option<Profile>, StoreError> {
        self.check("profile")?;
        Ok(self
            .tables()
            .profiles
            .iter()
            .find(|(user_id, _, _)| *user_id == caller.user_id)
            .map(|(_, profile, _)| profile.clone()))
    }

    async fn insert_user_message(
        &self,
        caller: &Caller,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.check("insert_user_message")?;
        let mut tables = self.tables();
        if !Self::owns(&tables, caller, conversation_id) {
            return Err(StoreError::Database(sqlx::Error::RowNotFound));
        }
        Ok(Self::push_message(
            &mut tables,
            conversation_id,
            SenderType::User,
            content,
        ))
    }

    async fn recent_messages(
        &self,
        caller: &Caller,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.check("recent_messages")?;
        let tables = self.tables();
        if !Self::owns(&tables, caller, conversation_id) {
            return Ok(Vec::new());
        }
        let mut visible = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && !m.is_internal_note)
            .cloned()
            .collect::<Vec<_>>();
        visible.sort_by_key(|m| m.created_at);
        let skip = visible.len().saturating_sub(usize::try_from(limit).unwrap_or(0));
        Ok(visible.split_off(skip))
    }

    async fn create_conversation(
        &self,
        user_id: Uuid,
        priority: i16,
    ) -> Result<Conversation, StoreError> {
        self.check("create_conversation")?;
        let mut tables = self.tables();
        let now = tables.tick();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            user_id,
            status: ConversationStatus::Active,
            priority,
            created_at: now,
            updated_at: now,
        };
        tables.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn find_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.check("find_conversation")?;
        Ok(self
            .tables()
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn update_conversation_state(
        &self,
        id: Uuid,
        status: ConversationStatus,
        priority: i16,
    ) -> Result<(), StoreError> {
        self.check("update_conversation_state")?;
        let mut tables = self.tables();
        let now = tables.tick();
        if let Some(conversation) = tables.conversations.iter_mut().find(|c| c.id == id) {
            conversation.status = status;
            conversation.priority = priority;
            conversation.updated_at = now;
        }
        Ok(())
    }

    async fn insert_ai_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.check("insert_ai_message")?;
        let mut tables = self.tables();
        Ok(Self::push_message(
            &mut tables,
            conversation_id,
            SenderType::Ai,
            content,
        ))
    }

    async fn active_ai_config(&self) -> Result<Option<Value>, StoreError> {
        self.check("active_ai_config")?;
        Ok(self
            .tables()
            .configs
            .iter()
            .rev()
            .find(|row| row.get("is_active").and_then(Value::as_bool).unwrap_or(false))
            .cloned())
    }

    async fn upsert_live_request(
        &self,
        draft: &ConciergeRequestDraft,
    ) -> Result<RequestUpsert, StoreError> {
        self.check("upsert_live_request")?;
        let mut tables = self.tables();
        let now = tables.tick();
        let live = tables
            .requests
            .iter_mut()
            .filter(|r| {
                r.draft.conversation_id == draft.conversation_id && r.draft.status.is_live()
            })
            .max_by_key(|r| r.created_at);
        if let Some(existing) = live {
            let user_id = existing.draft.user_id;
            existing.draft = ConciergeRequestDraft {
                user_id,
                ..draft.clone()
            };
            existing.updated_at = now;
            return Ok(RequestUpsert {
                id: existing.id,
                created: false,
            });
        }
        let id = Uuid::new_v4();
        tables.requests.push(StoredRequest {
            id,
            draft: draft.clone(),
            created_at: now,
            updated_at: now,
        });
        Ok(RequestUpsert { id, created: true })
    }

    async fn insert_handoff(&self, handoff: &NewHandoff) -> Result<Uuid, StoreError> {
        self.check("insert_handoff")?;
        let id = Uuid::new_v4();
        self.tables().handoffs.push(StoredHandoff {
            id,
            handoff: handoff.clone(),
        });
        Ok(id)
    }

    async fn active_staff_channels(&self) -> Result<Vec<StaffNotificationChannel>, StoreError> {
        self.check("active_staff_channels")?;
        Ok(self.tables().channels.clone())
    }

    async fn reservation_details(
        &self,
        id: Uuid,
    ) -> Result<Option<ReservationDetails>, StoreError> {
        self.check("reservation_details")?;
        Ok(self
            .tables()
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn push_target(&self, user_id: Uuid) -> Result<Option<PushTarget>, StoreError> {
        self.check("push_target")?;
        Ok(self
            .tables()
            .profiles
            .iter()
            .find(|(id, _, _)| *id == user_id)
            .map(|(_, profile, token)| PushTarget {
                expo_push_token: token.clone(),
                preferred_language: profile.preferred_language.clone(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Intent;

    fn draft(conversation_id: Uuid, status: RequestStatus) -> ConciergeRequestDraft {
        ConciergeRequestDraft {
            conversation_id,
            user_id: Uuid::new_v4(),
            category: Intent::Other,
            status,
            ai_confidence: 0.5,
            summary: "s".to_string(),
            structured_payload: None,
            sla_deadline: None,
        }
    }

    #[tokio::test]
    async fn closed_request_is_not_reused() {
        let store = MemoryStore::new();
        let conversation_id = Uuid::new_v4();
        let first = store
            .upsert_live_request(&draft(conversation_id, RequestStatus::Closed))
            .await
            .unwrap();
        let second = store
            .upsert_live_request(&draft(conversation_id, RequestStatus::PendingAi))
            .await
            .unwrap();
        assert!(second.created);
        assert_ne!(first.id, second.id);
        assert_eq!(store.requests(conversation_id).len(), 2);
    }
}
