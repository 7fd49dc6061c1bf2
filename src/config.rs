use std::{env, fmt, time::Duration};

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o";
const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HISTORY_LIMIT: i64 = 30;
const DEFAULT_EMAIL_API_URL: &str = "https://api.resend.com/emails";
const DEFAULT_WHATSAPP_API_URL: &str = "https://graph.facebook.com/v21.0";
const DEFAULT_EXPO_PUSH_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";

#[derive(Clone)]
pub struct EmailSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub from: Option<String>,
}

#[derive(Clone)]
pub struct WhatsAppSettings {
    pub api_url: String,
    pub access_token: Option<String>,
    pub phone_number_id: Option<String>,
}

/// Process-wide settings read once at start-up.
#[derive(Clone)]
pub struct Settings {
    pub port: u16,
    pub database_url: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub default_model: String,
    pub completion_timeout: Duration,
    pub history_limit: i64,
    pub run_migrations: bool,
    pub email: EmailSettings,
    pub whatsapp: WhatsAppSettings,
    pub staff_console_url: Option<String>,
    pub reservation_notify_secret: Option<String>,
    pub expo_push_endpoint: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let url = |key: &str, default: &str| {
            text(key)
                .unwrap_or_else(|| default.to_string())
                .trim_end_matches('/')
                .to_string()
        };

        Self {
            port: text("PORT")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(DEFAULT_PORT),
            database_url: resolve_database_url(&text),
            supabase_url: text("SUPABASE_URL").map(|v| v.trim_end_matches('/').to_string()),
            supabase_anon_key: text("SUPABASE_ANON_KEY"),
            openai_api_key: text("OPENAI_API_KEY"),
            openai_base_url: url("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE_URL),
            default_model: text("OPENAI_CHAT_MODEL")
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            completion_timeout: Duration::from_secs(
                text("COMPLETION_TIMEOUT_SECS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_COMPLETION_TIMEOUT_SECS),
            ),
            history_limit: text("HISTORY_LIMIT")
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|limit| *limit > 0)
                .unwrap_or(DEFAULT_HISTORY_LIMIT),
            run_migrations: text("RUN_MIGRATIONS")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            email: EmailSettings {
                api_url: url("EMAIL_API_URL", DEFAULT_EMAIL_API_URL),
                api_key: text("EMAIL_API_KEY"),
                from: text("EMAIL_FROM"),
            },
            whatsapp: WhatsAppSettings {
                api_url: url("WHATSAPP_API_URL", DEFAULT_WHATSAPP_API_URL),
                access_token: text("WHATSAPP_ACCESS_TOKEN"),
                phone_number_id: text("WHATSAPP_PHONE_NUMBER_ID"),
            },
            staff_console_url: text("STAFF_CONSOLE_URL")
                .map(|v| v.trim_end_matches('/').to_string()),
            reservation_notify_secret: text("RESERVATION_NOTIFY_SECRET"),
            expo_push_endpoint: url("EXPO_PUSH_ENDPOINT", DEFAULT_EXPO_PUSH_ENDPOINT),
        }
    }

    /// Names of the secrets the concierge endpoint cannot run without.
    pub fn missing_secrets(&self) -> Vec<&'static str> {
        let required = [
            ("DATABASE_URL", self.database_url.is_some()),
            ("SUPABASE_URL", self.supabase_url.is_some()),
            ("SUPABASE_ANON_KEY", self.supabase_anon_key.is_some()),
            ("OPENAI_API_KEY", self.openai_api_key.is_some()),
        ];
        required
            .into_iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| name)
            .collect()
    }
}

#[cfg(test)]
impl Settings {
    /// Fully configured settings whose upstreams all live at `base_url`.
    pub fn for_upstream(base_url: &str) -> Self {
        let vars = [
            ("DATABASE_URL", "postgres://localhost/concierge_test".to_string()),
            ("SUPABASE_URL", base_url.to_string()),
            ("SUPABASE_ANON_KEY", "anon-key".to_string()),
            ("OPENAI_API_KEY", "sk-test".to_string()),
            ("OPENAI_BASE_URL", base_url.to_string()),
            ("COMPLETION_TIMEOUT_SECS", "5".to_string()),
            ("EMAIL_API_URL", format!("{base_url}/emails")),
            ("EMAIL_API_KEY", "re_test".to_string()),
            ("EMAIL_FROM", "concierge@dukelife.test".to_string()),
            ("WHATSAPP_API_URL", base_url.to_string()),
            ("WHATSAPP_ACCESS_TOKEN", "wa-token".to_string()),
            ("WHATSAPP_PHONE_NUMBER_ID", "1234".to_string()),
            ("STAFF_CONSOLE_URL", "https://console.example.com".to_string()),
            ("RESERVATION_NOTIFY_SECRET", "hook-secret".to_string()),
            ("EXPO_PUSH_ENDPOINT", format!("{base_url}/push")),
        ];
        Self::from_lookup(|key| {
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.clone())
        })
    }
}

fn resolve_database_url(text: &impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(url) = text("DATABASE_URL") {
        return Some(url);
    }
    let host = text("POSTGRES_HOST").or_else(|| text("PGHOST"))?;
    let port = text("POSTGRES_PORT")
        .or_else(|| text("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = text("POSTGRES_USER")
        .or_else(|| text("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = text("POSTGRES_PASSWORD")
        .or_else(|| text("PGPASSWORD"))
        .unwrap_or_default();
    let db = text("POSTGRES_DB")
        .or_else(|| text("PGDATABASE"))
        .unwrap_or_else(|| "postgres".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "[redacted]")
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("port", &self.port)
            .field("database_url", &redact(&self.database_url))
            .field("supabase_url", &self.supabase_url)
            .field("supabase_anon_key", &redact(&self.supabase_anon_key))
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("openai_base_url", &self.openai_base_url)
            .field("default_model", &self.default_model)
            .field("completion_timeout", &self.completion_timeout)
            .field("history_limit", &self.history_limit)
            .field("run_migrations", &self.run_migrations)
            .field("email_api_url", &self.email.api_url)
            .field("email_api_key", &redact(&self.email.api_key))
            .field("whatsapp_api_url", &self.whatsapp.api_url)
            .field("whatsapp_access_token", &redact(&self.whatsapp.access_token))
            .field("staff_console_url", &self.staff_console_url)
            .field(
                "reservation_notify_secret",
                &redact(&self.reservation_notify_secret),
            )
            .field("expo_push_endpoint", &self.expo_push_endpoint)
            .finish()
    }
}
