use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipTier {
    #[default]
    Gold,
    Platinum,
    BlackElite,
}

impl MembershipTier {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gold" => Some(Self::Gold),
            "platinum" => Some(Self::Platinum),
            "black_elite" => Some(Self::BlackElite),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gold => "gold",
            Self::Platinum => "platinum",
            Self::BlackElite => "black_elite",
        }
    }

    /// Conversation priority; higher tiers sort first in the staff queue.
    pub fn priority(self) -> i16 {
        match self {
            Self::Gold => 1,
            Self::Platinum => 2,
            Self::BlackElite => 3,
        }
    }

    /// Minutes staff have to pick up an escalated request.
    pub fn sla_minutes(self) -> i64 {
        match self {
            Self::Gold => 30,
            Self::Platinum => 20,
            Self::BlackElite => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    #[default]
    Es,
    En,
}

impl Language {
    pub fn from_profile(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "en" => Self::En,
            _ => Self::Es,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Es => "es",
            Self::En => "en",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Reservation,
    Upgrade,
    Transport,
    Recommendation,
    Issue,
    Other,
}

impl Intent {
    /// Anything outside the known intents collapses to `Other`.
    pub fn coerce(raw: Option<&str>) -> Self {
        match raw.map(str::trim).unwrap_or_default() {
            "reservation" => Self::Reservation,
            "upgrade" => Self::Upgrade,
            "transport" => Self::Transport,
            "recommendation" => Self::Recommendation,
            "issue" => Self::Issue,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reservation => "reservation",
            Self::Upgrade => "upgrade",
            Self::Transport => "transport",
            Self::Recommendation => "recommendation",
            Self::Issue => "issue",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    WaitingForHuman,
}

impl ConversationStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "waiting_for_human" => Some(Self::WaitingForHuman),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::WaitingForHuman => "waiting_for_human",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Ai,
    Human,
}

impl SenderType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "ai" => Some(Self::Ai),
            "human" => Some(Self::Human),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    PendingAi,
    PendingHuman,
    Closed,
}

impl RequestStatus {
    /// Statuses of a request that is still being worked on.
    #[cfg(test)]
    pub const LIVE: [Self; 3] = [Self::Open, Self::PendingAi, Self::PendingHuman];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::PendingAi => "pending_ai",
            Self::PendingHuman => "pending_human",
            Self::Closed => "closed",
        }
    }

    #[cfg(test)]
    pub fn is_live(self) -> bool {
        Self::LIVE.contains(&self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffTrigger {
    Ai,
    Human,
    System,
}

impl HandoffTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Human => "human",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Whatsapp,
}

impl ChannelType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "whatsapp" => Some(Self::Whatsapp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Whatsapp => "whatsapp",
        }
    }
}

/// Identity handed back by the auth verifier for a bearer token.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Everything the pipeline knows about the member behind a request.
#[derive(Debug, Clone)]
pub struct MemberContext {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub tier: MembershipTier,
    pub language: Language,
    pub default_destination: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: ConversationStatus,
    pub priority: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_type: SenderType,
    pub content: String,
    pub is_internal_note: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub full_name: Option<String>,
    pub default_destination: Option<String>,
    pub preferred_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffNotificationChannel {
    pub channel_type: ChannelType,
    pub address: String,
}

/// Values written to the live concierge request of a conversation.
#[derive(Debug, Clone)]
pub struct ConciergeRequestDraft {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub category: Intent,
    pub status: RequestStatus,
    pub ai_confidence: f64,
    pub summary: String,
    pub structured_payload: Option<Value>,
    pub sla_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestUpsert {
    pub id: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct NewHandoff {
    pub concierge_request_id: Uuid,
    pub triggered_by: HandoffTrigger,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ReservationDetails {
    pub id: Uuid,
    pub user_id: Uuid,
    pub experience_id: Uuid,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub experience_title: Option<String>,
    pub destination_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PushTarget {
    pub expo_push_token: Option<String>,
    pub preferred_language: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConciergeRequestBody {
    pub conversation_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConciergeReply {
    #[serde(rename = "conversationId")]
    pub conversation_id: Uuid,
    pub assistant_reply: String,
    pub intent: Intent,
    pub needs_human: bool,
    pub confidence: f64,
    pub concierge_request_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationNotifyBody {
    #[serde(default)]
    pub reservation_id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
}
