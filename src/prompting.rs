use std::sync::LazyLock;

use minijinja::{context, Environment};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::types::{Language, MemberContext, Message, SenderType};

const DEFAULT_SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.txt");
const STAFF_ALERT_TEMPLATE: &str = include_str!("prompts/staff_alert.html.j2");
const DEFAULT_TEMPERATURE: f64 = 0.3;
const UNSET_DESTINATION: &str = "no_definido";

static PLACEHOLDER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    Text,
}

impl ResponseFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" | "json_object" => Some(Self::Json),
            "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn to_request_value(self) -> Value {
        match self {
            Self::Json => json!({ "type": "json_object" }),
            Self::Text => json!({ "type": "text" }),
        }
    }
}

/// Effective AI behaviour for one request, after defaulting.
#[derive(Debug, Clone, PartialEq)]
pub struct AiConciergeConfig {
    pub name: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
    pub system_prompt_template: String,
}

impl AiConciergeConfig {
    pub fn builtin(default_model: &str) -> Self {
        Self {
            name: None,
            model: default_model.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: None,
            max_tokens: None,
            response_format: None,
            system_prompt_template: DEFAULT_SYSTEM_PROMPT_TEMPLATE.to_string(),
        }
    }

    /// Builds the effective config from an operator-edited row. Every field
    /// is optional and accepts numbers written as strings; out-of-range or
    /// unusable values fall back to the built-in defaults.
    pub fn from_row(row: Option<&Value>, default_model: &str) -> Self {
        let mut config = Self::builtin(default_model);
        let Some(row) = row else {
            return config;
        };

        config.name = row_text(row, "name");
        if let Some(model) = row_text(row, "model") {
            config.model = model;
        }
        if let Some(temperature) =
            row_number(row, "temperature").filter(|t| (0.0..=2.0).contains(t))
        {
            config.temperature = temperature;
        }
        config.top_p = row_number(row, "top_p").filter(|p| *p > 0.0 && *p <= 1.0);
        config.max_tokens = row_number(row, "max_tokens")
            .filter(|n| *n >= 1.0 && *n <= f64::from(u32::MAX) && n.fract() == 0.0)
            .map(|n| n as u32);
        config.response_format = row_text(row, "response_format")
            .as_deref()
            .and_then(ResponseFormat::parse);
        if let Some(template) = row_text(row, "system_prompt_template") {
            config.system_prompt_template = template;
        }
        config
    }
}

fn row_text(row: &Value, key: &str) -> Option<String> {
    row.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn row_number(row: &Value, key: &str) -> Option<f64> {
    match row.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

pub struct PromptVariables<'a> {
    pub membership_tier: &'a str,
    pub preferred_language: &'a str,
    pub default_destination: &'a str,
    pub user_id: &'a str,
}

impl<'a> PromptVariables<'a> {
    pub fn lookup(&self, key: &str) -> Option<&'a str> {
        match key {
            "membership_tier" => Some(self.membership_tier),
            "preferred_language" => Some(self.preferred_language),
            "default_destination" => Some(self.default_destination),
            "user_id" => Some(self.user_id),
            _ => None,
        }
    }
}

/// Substitutes `{{name}}` placeholders; unknown names stay in the text.
pub fn render_prompt_template(template: &str, vars: &PromptVariables<'_>) -> String {
    let Some(re) = PLACEHOLDER_RE.as_ref() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures| {
        vars.lookup(&caps[1])
            .map(str::to_string)
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

pub fn render_system_prompt(config: &AiConciergeConfig, member: &MemberContext) -> String {
    let user_id = member.user_id.to_string();
    let vars = PromptVariables {
        membership_tier: member.tier.as_str(),
        preferred_language: member.language.as_str(),
        default_destination: member
            .default_destination
            .as_deref()
            .unwrap_or(UNSET_DESTINATION),
        user_id: &user_id,
    };
    render_prompt_template(&config.system_prompt_template, &vars)
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// System prompt first, then history; staff and AI turns both read as the assistant.
pub fn assemble_transcript(system_prompt: String, history: &[Message]) -> Vec<ChatTurn> {
    let mut turns = Vec::with_capacity(history.len() + 1);
    turns.push(ChatTurn {
        role: ChatRole::System,
        content: system_prompt,
    });
    turns.extend(history.iter().map(|message| ChatTurn {
        role: match message.sender_type {
            SenderType::User => ChatRole::User,
            SenderType::Ai | SenderType::Human => ChatRole::Assistant,
        },
        content: message.content.clone(),
    }));
    turns
}

pub struct StaffAlertContext<'a> {
    pub tier: &'a str,
    pub intent: &'a str,
    pub destination: &'a str,
    pub language: Language,
    pub member_name: Option<&'a str>,
    pub member_email: Option<&'a str>,
    pub summary: &'a str,
    pub created_at: &'a str,
    pub sla_minutes: i64,
    pub deep_link: Option<&'a str>,
}

pub fn render_staff_alert_html(ctx: &StaffAlertContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("staff_alert.html", STAFF_ALERT_TEMPLATE)
        .is_err()
    {
        return fallback_staff_alert_html(ctx);
    }

    let Ok(template) = env.get_template("staff_alert.html") else {
        return fallback_staff_alert_html(ctx);
    };

    template
        .render(context! {
            tier => ctx.tier,
            tier_label => ctx.tier.replace('_', " ").to_uppercase(),
            intent => ctx.intent,
            destination => ctx.destination,
            language => ctx.language.as_str(),
            member_name => ctx.member_name,
            member_email => ctx.member_email,
            summary => ctx.summary,
            created_at => ctx.created_at,
            sla_minutes => ctx.sla_minutes,
            deep_link => ctx.deep_link,
        })
        .unwrap_or_else(|_| fallback_staff_alert_html(ctx))
}

fn fallback_staff_alert_html(ctx: &StaffAlertContext<'_>) -> String {
    format!("<pre>{}</pre>", escape_html(&render_staff_alert_text(ctx)))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Plain body used for messaging channels.
pub fn render_staff_alert_text(ctx: &StaffAlertContext<'_>) -> String {
    let mut body = format!(
        "Nueva solicitud de concierge ({tier})\n\
         Intención: {intent}\n\
         Destino: {destination}\n\
         Idioma: {language}\n",
        tier = ctx.tier,
        intent = ctx.intent,
        destination = ctx.destination,
        language = ctx.language.as_str(),
    );
    match (ctx.member_name, ctx.member_email) {
        (Some(name), Some(email)) => body.push_str(&format!("Miembro: {name} <{email}>\n")),
        (Some(name), None) => body.push_str(&format!("Miembro: {name}\n")),
        (None, Some(email)) => body.push_str(&format!("Miembro: {email}\n")),
        (None, None) => {}
    }
    body.push_str(&format!(
        "Creada: {}\nSLA: {} min\n\nResumen: {}\n",
        ctx.created_at, ctx.sla_minutes, ctx.summary
    ));
    if let Some(link) = ctx.deep_link {
        body.push_str(&format!("\n{link}\n"));
    }
    body
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::types::MembershipTier;

    fn member() -> MemberContext {
        MemberContext {
            user_id: Uuid::nil(),
            email: None,
            full_name: None,
            tier: MembershipTier::Platinum,
            language: Language::En,
            default_destination: None,
        }
    }

    fn message(sender_type: SenderType, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::nil(),
            sender_type,
            content: content.to_string(),
            is_internal_note: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn missing_row_uses_builtin_defaults() {
        let config = AiConciergeConfig::from_row(None, "gpt-4o");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.temperature, 0.3);
        assert_eq!(config.top_p, None);
        assert_eq!(config.max_tokens, None);
        assert_eq!(config.response_format, None);
        assert!(config.system_prompt_template.contains("{{membership_tier}}"));
    }

    #[test]
    fn row_values_are_coerced_and_range_checked() {
        let row = json!({
            "name": "evening",
            "model": "gpt-4.1-mini",
            "temperature": "0.7",
            "top_p": 1.5,
            "max_tokens": 800,
            "response_format": "json",
            "system_prompt_template": "  "
        });
        let config = AiConciergeConfig::from_row(Some(&row), "gpt-4o");
        assert_eq!(config.name.as_deref(), Some("evening"));
        assert_eq!(config.model, "gpt-4.1-mini");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.top_p, None);
        assert_eq!(config.max_tokens, Some(800));
        assert_eq!(config.response_format, Some(ResponseFormat::Json));
        assert!(config.system_prompt_template.contains("Duke Life"));
    }

    #[test]
    fn bad_temperature_keeps_default() {
        let row = json!({ "temperature": "warm", "max_tokens": 12.5 });
        let config = AiConciergeConfig::from_row(Some(&row), "gpt-4o");
        assert_eq!(config.temperature, 0.3);
        assert_eq!(config.max_tokens, None);
    }

    #[test]
    fn unknown_placeholders_are_left_in_place() {
        let vars = PromptVariables {
            membership_tier: "gold",
            preferred_language: "es",
            default_destination: "tulum",
            user_id: "u-1",
        };
        let rendered = render_prompt_template(
            "tier={{ membership_tier }} dest={{default_destination}} vip={{vip_code}}",
            &vars,
        );
        assert_eq!(rendered, "tier=gold dest=tulum vip={{vip_code}}");
    }

    #[test]
    fn system_prompt_marks_missing_destination() {
        let config = AiConciergeConfig::builtin("gpt-4o");
        let prompt = render_system_prompt(&config, &member());
        assert!(prompt.contains("Membership tier del usuario: platinum"));
        assert!(prompt.contains("Idioma preferido: en"));
        assert!(prompt.contains("Destino por defecto: no_definido"));
        assert!(prompt.contains(&Uuid::nil().to_string()));
    }

    #[test]
    fn transcript_maps_senders_to_roles() {
        let history = vec![
            message(SenderType::User, "hola"),
            message(SenderType::Ai, "¿en qué te ayudo?"),
            message(SenderType::Human, "soy Ana"),
        ];
        let turns = assemble_transcript("sys".to_string(), &history);
        let roles = turns.iter().map(|t| t.role).collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::Assistant]
        );
        assert_eq!(turns[0].content, "sys");
    }

    #[test]
    fn staff_alert_html_escapes_model_text() {
        let ctx = StaffAlertContext {
            tier: "black_elite",
            intent: "transport",
            destination: "cabo",
            language: Language::Es,
            member_name: None,
            member_email: Some("vip@example.com"),
            summary: "<script>alert(1)</script> yate",
            created_at: "2026-01-01T00:00:00Z",
            sla_minutes: 10,
            deep_link: Some("https://console.example.com/requests/1"),
        };
        let html = render_staff_alert_html(&ctx);
        assert!(html.contains("BLACK ELITE"));
        assert!(html.contains("vip@example.com"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("console.example.com"));
    }
}
