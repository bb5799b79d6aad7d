//! Backend registry — immutable-per-reload list of vLLM-compatible
//! backends, loaded once from the `VLLM_SERVERS` configuration object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Default `max_parallel_requests` applied when a backend entry omits it.
pub const DEFAULT_MAX_PARALLEL_REQUESTS: u32 = 20;

/// An immutable backend record. Equality is by all fields, so it is usable
/// directly as a map key for in-flight counters and metrics state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Backend {
    /// Base URL of the backend (e.g. `http://vllm-0:8000`).
    pub url: String,
    /// Bearer token to present to the backend, if configured.
    pub token: Option<String>,
    /// Organization this backend belongs to, for private-pool routing.
    pub organization: String,
    /// Maximum number of requests this backend should have in flight.
    pub max_parallel_requests: u32,
}

impl Backend {
    /// The `Authorization` header value for this backend, if a token is set.
    pub fn authorization_header(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }
}

/// Raw shape of one entry in the `VLLM_SERVERS` JSON object, before the
/// `DEFAULT_MAX_PARALLEL_REQUESTS` default is applied.
#[derive(Debug, Deserialize)]
struct RawBackendEntry {
    token: Option<String>,
    organization: String,
    max_parallel_requests: Option<u32>,
}

/// Immutable-per-reload list of backends for one model, built once from
/// configuration at consumer startup and never mutated afterward.
///
/// Internally a `BTreeMap` keyed by URL so iteration order is stable and
/// deterministic (registry order, as referenced by §4.4's "preserving
/// registry order").
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Vec<Backend>,
}

impl BackendRegistry {
    /// Parse `VLLM_SERVERS` (a JSON object `url -> {token?, organization,
    /// max_parallel_requests?}`) into a registry. Fails fast on malformed
    /// entries or an empty object.
    pub fn from_json(raw: &str, default_max_parallel_requests: u32) -> Result<Self> {
        let entries: BTreeMap<String, RawBackendEntry> = serde_json::from_str(raw)
            .map_err(|e| GatewayError::config(format!("VLLM_SERVERS is not valid JSON: {e}")))?;

        if entries.is_empty() {
            return Err(GatewayError::config("VLLM_SERVERS must not be empty"));
        }

        let backends = entries
            .into_iter()
            .map(|(url, entry)| {
                if url.trim().is_empty() {
                    return Err(GatewayError::config("backend url must not be empty"));
                }
                if entry.organization.trim().is_empty() {
                    return Err(GatewayError::config(format!(
                        "backend {url} is missing an organization"
                    )));
                }
                Ok(Backend {
                    url,
                    token: entry.token,
                    organization: entry.organization,
                    max_parallel_requests: entry
                        .max_parallel_requests
                        .unwrap_or(default_max_parallel_requests),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { backends })
    }

    /// All backends, in registry (insertion-sorted-by-url) order.
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Backends belonging to the given organization, preserving registry order.
    pub fn by_organization<'a>(&'a self, organization: &'a str) -> impl Iterator<Item = &'a Backend> {
        self.backends.iter().filter(move |b| b.organization == organization)
    }

    /// Distinct organizations present across the registry, in first-seen order.
    pub fn organizations(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for b in &self.backends {
            if !seen.contains(&b.organization) {
                seen.push(b.organization.clone());
            }
        }
        seen
    }

    /// Look up a backend by its URL (used by the completion handler).
    pub fn find_by_url(&self, url: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.url == url)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_registry_applying_default() {
        let raw = r#"{
            "http://a:8000": {"organization": "org-a", "max_parallel_requests": 5},
            "http://b:8000": {"organization": "org-b"}
        }"#;
        let registry = BackendRegistry::from_json(raw, DEFAULT_MAX_PARALLEL_REQUESTS).unwrap();
        assert_eq!(registry.backends().len(), 2);
        let b = registry.find_by_url("http://b:8000").unwrap();
        assert_eq!(b.max_parallel_requests, DEFAULT_MAX_PARALLEL_REQUESTS);
    }

    #[test]
    fn rejects_empty_registry() {
        let err = BackendRegistry::from_json("{}", DEFAULT_MAX_PARALLEL_REQUESTS).unwrap_err();
        assert!(matches!(err, GatewayError::Config { .. }));
    }

    #[test]
    fn rejects_malformed_entry() {
        let raw = r#"{"http://a:8000": {"max_parallel_requests": 5}}"#;
        let err = BackendRegistry::from_json(raw, DEFAULT_MAX_PARALLEL_REQUESTS).unwrap_err();
        assert!(matches!(err, GatewayError::Config { .. }));
    }

    #[test]
    fn groups_by_organization_preserving_order() {
        let raw = r#"{
            "http://a:8000": {"organization": "org-a"},
            "http://b:8000": {"organization": "org-b"},
            "http://c:8000": {"organization": "org-a"}
        }"#;
        let registry = BackendRegistry::from_json(raw, DEFAULT_MAX_PARALLEL_REQUESTS).unwrap();
        let org_a: Vec<_> = registry.by_organization("org-a").map(|b| b.url.clone()).collect();
        assert_eq!(org_a, vec!["http://a:8000".to_string(), "http://c:8000".to_string()]);
        assert_eq!(registry.organizations(), vec!["org-a".to_string(), "org-b".to_string()]);
    }
}
