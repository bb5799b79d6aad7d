//! User directory and usage accounting: the Sender needs to resolve a
//! bearer token to a user record before admitting a request.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::Deserialize;

use crate::amqp::RoutingMode;
use crate::error::{GatewayError, Result};

/// A registered API user.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    /// Display/account name.
    pub name: String,
    /// Bearer token presented by the client.
    pub token: String,
    /// Broker-level priority assigned to this user's requests.
    pub priority: u8,
    /// Max requests this user may have in flight at once, if bounded.
    pub threshold: Option<u32>,
    /// Organization this user belongs to, for private-pool routing.
    pub organization: Option<String>,
    /// Routing mode applied when the client doesn't specify one.
    pub default_routing_mode: RoutingMode,
    /// Caller kind (e.g. `"chat"`), used to soften error responses that
    /// would otherwise break a chat UI: 503 in general, 200 when
    /// `client_type = chat`.
    pub client_type: Option<String>,
}

/// Looks up users by bearer token.
#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    /// Resolve a bearer token to its user record, if registered.
    async fn find_by_token(&self, token: &str) -> Option<User>;
}

/// A `DashMap`-backed store, suitable for a config-loaded, rarely-changing
/// user directory (mirrors the in-memory registries used elsewhere in this
/// crate, e.g. [`crate::backend::BackendRegistry`]).
#[derive(Default)]
pub struct InMemoryUserStore {
    by_token: DashMap<String, User>,
}

impl InMemoryUserStore {
    /// An empty store.
    pub fn new() -> Self {
        Self { by_token: DashMap::new() }
    }

    /// Build a store from a pre-loaded user list (e.g. parsed from config).
    pub fn from_users(users: Vec<User>) -> Self {
        let by_token = DashMap::new();
        for user in users {
            by_token.insert(user.token.clone(), user);
        }
        Self { by_token }
    }

    /// Insert or replace a user record.
    pub fn insert(&self, user: User) {
        self.by_token.insert(user.token.clone(), user);
    }

    /// Parse `USERS` (a JSON object `token -> {name, priority?, threshold?,
    /// organization?, default_routing_mode?, client_type?}`) into a store.
    /// Mirrors [`crate::backend::BackendRegistry::from_json`]'s shape and
    /// error reporting.
    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: BTreeMap<String, RawUserEntry> =
            serde_json::from_str(raw).map_err(|e| GatewayError::config(format!("USERS is not valid JSON: {e}")))?;

        if entries.is_empty() {
            return Err(GatewayError::config("USERS must not be empty"));
        }

        let by_token = DashMap::new();
        for (token, entry) in entries {
            if token.trim().is_empty() {
                return Err(GatewayError::config("user token must not be empty"));
            }
            by_token.insert(
                token.clone(),
                User {
                    name: entry.name,
                    token,
                    priority: entry.priority.unwrap_or(0),
                    threshold: entry.threshold,
                    organization: entry.organization,
                    default_routing_mode: entry.default_routing_mode.unwrap_or(RoutingMode::Any),
                    client_type: entry.client_type,
                },
            );
        }
        Ok(Self { by_token })
    }
}

/// Raw shape of one entry in the `USERS` JSON object, before its token (the
/// map key) is attached.
#[derive(Debug, Deserialize)]
struct RawUserEntry {
    name: String,
    priority: Option<u8>,
    threshold: Option<u32>,
    organization: Option<String>,
    default_routing_mode: Option<RoutingMode>,
    client_type: Option<String>,
}

#[async_trait::async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_token(&self, token: &str) -> Option<User> {
        self.by_token.get(token).map(|entry| entry.value().clone())
    }
}

/// One usage record published after a completed call, for downstream
/// billing/analytics.
#[derive(Debug, Clone)]
pub struct UsageMetric {
    /// The user who made the request.
    pub user: String,
    /// The model served.
    pub model: String,
    /// The backend that served it.
    pub server: String,
    /// Completion timestamp.
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn user(name: &str, token: &str) -> User {
        User {
            name: name.to_string(),
            token: token.to_string(),
            priority: 0,
            threshold: None,
            organization: None,
            default_routing_mode: RoutingMode::Any,
            client_type: None,
        }
    }

    #[tokio::test]
    async fn finds_registered_user_by_token() {
        let store = InMemoryUserStore::from_users(vec![user("alice", "tok-a"), user("bob", "tok-b")]);
        let found = store.find_by_token("tok-a").await.unwrap();
        assert_eq!(found.name, "alice");
    }

    #[tokio::test]
    async fn unknown_token_is_none() {
        let store = InMemoryUserStore::new();
        assert!(store.find_by_token("nope").await.is_none());
    }

    #[tokio::test]
    async fn insert_replaces_existing_token() {
        let store = InMemoryUserStore::new();
        store.insert(user("alice", "tok-a"));
        store.insert(User { priority: 7, ..user("alice", "tok-a") });
        assert_eq!(store.find_by_token("tok-a").await.unwrap().priority, 7);
    }

    #[tokio::test]
    async fn from_json_applies_defaults() {
        let raw = r#"{"tok-a": {"name": "alice", "organization": "acme"}}"#;
        let store = InMemoryUserStore::from_json(raw).unwrap();
        let found = store.find_by_token("tok-a").await.unwrap();
        assert_eq!(found.name, "alice");
        assert_eq!(found.priority, 0);
        assert_eq!(found.default_routing_mode, RoutingMode::Any);
        assert_eq!(found.organization.as_deref(), Some("acme"));
    }

    #[test]
    fn from_json_rejects_empty_object() {
        assert!(InMemoryUserStore::from_json("{}").is_err());
    }
}
