use axum::http::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::store::ConciergeStore;
use crate::types::{Caller, Language, MemberContext, MembershipTier, Profile};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("auth service rejected token with {0}")]
    Rejected(StatusCode),
    #[error("auth service returned an unusable user: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// Token of a well-formed `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Verifies member access tokens against the hosted auth service.
#[derive(Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AuthClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<Caller, AuthError> {
        let response = self
            .http
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected(status));
        }
        let user = response.json::<AuthUser>().await?;
        let user_id = Uuid::parse_str(user.id.trim())
            .map_err(|err| AuthError::Malformed(format!("id {:?}: {err}", user.id)))?;
        Ok(Caller {
            user_id,
            email: user.email.filter(|email| !email.trim().is_empty()),
        })
    }
}

/// Loads tier and profile preferences. Missing rows and read failures both
/// fall back to the defaults: gold tier, Spanish, no default destination.
pub async fn resolve_member(store: &dyn ConciergeStore, caller: &Caller) -> MemberContext {
    let tier = match store.active_membership_tier(caller).await {
        Ok(tier) => tier.unwrap_or_default(),
        Err(err) => {
            tracing::warn!(user_id = %caller.user_id, error = %err, "membership lookup failed, using default tier");
            MembershipTier::default()
        }
    };

    let profile = match store.profile(caller).await {
        Ok(profile) => profile.unwrap_or_default(),
        Err(err) => {
            tracing::warn!(user_id = %caller.user_id, error = %err, "profile lookup failed, using defaults");
            Profile::default()
        }
    };

    MemberContext {
        user_id: caller.user_id,
        email: caller.email.clone(),
        full_name: profile.full_name.filter(|name| !name.trim().is_empty()),
        tier,
        language: Language::from_profile(profile.preferred_language.as_deref()),
        default_destination: profile
            .default_destination
            .filter(|destination| !destination.trim().is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::store::memory::MemoryStore;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_token_requires_prefix_and_value() {
        assert_eq!(bearer_token(&headers_with("Bearer abc")).as_deref(), Some("abc"));
        assert_eq!(bearer_token(&headers_with("Basic abc")), None);
        assert_eq!(bearer_token(&headers_with("Bearer   ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn verify_returns_caller_for_valid_token() {
        let server = MockServer::start().await;
        let user_id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("apikey", "anon-key"))
            .and(header("authorization", "Bearer good-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": user_id.to_string(),
                "email": "member@example.com"
            })))
            .mount(&server)
            .await;

        let client = AuthClient::new(reqwest::Client::new(), &server.uri(), "anon-key");
        let caller = client.verify("good-token").await.unwrap();
        assert_eq!(caller.user_id, user_id);
        assert_eq!(caller.email.as_deref(), Some("member@example.com"));
    }

    #[tokio::test]
    async fn verify_rejects_unknown_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = AuthClient::new(reqwest::Client::new(), &server.uri(), "anon-key");
        let err = client.verify("expired").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(status) if status == StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn member_defaults_when_rows_are_missing() {
        let store = MemoryStore::new();
        let caller = Caller {
            user_id: Uuid::new_v4(),
            email: None,
        };
        let member = resolve_member(&store, &caller).await;
        assert_eq!(member.tier, MembershipTier::Gold);
        assert_eq!(member.language, Language::Es);
        assert_eq!(member.default_destination, None);
    }

    #[tokio::test]
    async fn member_reads_tier_and_profile() {
        let store = MemoryStore::new();
        let caller = Caller {
            user_id: Uuid::new_v4(),
            email: Some("vip@example.com".to_string()),
        };
        store.set_membership(caller.user_id, MembershipTier::BlackElite);
        store.set_profile(
            caller.user_id,
            Profile {
                full_name: Some("Ana".to_string()),
                default_destination: Some("los-cabos".to_string()),
                preferred_language: Some("en".to_string()),
            },
            None,
        );
        let member = resolve_member(&store, &caller).await;
        assert_eq!(member.tier, MembershipTier::BlackElite);
        assert_eq!(member.language, Language::En);
        assert_eq!(member.default_destination.as_deref(), Some("los-cabos"));
        assert_eq!(member.email.as_deref(), Some("vip@example.com"));
    }

    #[tokio::test]
    async fn failed_lookups_fall_back_to_defaults() {
        let store = MemoryStore::new();
        store.fail_on("active_membership_tier");
        store.fail_on("profile");
        let caller = Caller {
            user_id: Uuid::new_v4(),
            email: None,
        };
        store.set_membership(caller.user_id, MembershipTier::Platinum);
        let member = resolve_member(&store, &caller).await;
        assert_eq!(member.tier, MembershipTier::Gold);
    }
}
