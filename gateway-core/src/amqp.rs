//! The AMQP wire contract: queue names, header/message shapes,
//! and the `FieldTable`/`QueueDeclareOptions` each declared queue carries.
//!
//! Kept separate from the `lapin`-driven consume loop in `consumer` so both
//! the Consumer and (conceptually) the Sender agree on one source of truth
//! for routing keys and declare arguments.

use lapin::options::QueueDeclareOptions;
use lapin::types::{AMQPValue, FieldTable, LongLongInt, ShortShortUInt};
use serde::{Deserialize, Serialize};

/// Header carrying the requeue count on every request-direction message.
pub const X_REQUEUE_COUNT: &str = "x-requeue-count";

/// Literal body used for `routing_mode = any` requests.
pub const AVAILABLE_BODY: &str = "AVAILABLE?";

/// The per-model shared queue name.
pub fn model_queue(model: &str) -> String {
    model.to_string()
}

/// The per-model completion queue name.
pub fn completed_queue(model: &str) -> String {
    format!("{model}_completed")
}

/// The per-model, per-organization private queue name.
pub fn private_queue(model: &str, organization: &str) -> String {
    format!("{model}_{organization}_private")
}

/// Declare arguments for `{model}`: durable, priority-enabled, queue and
/// message TTLs.
pub fn model_queue_args(rpc_max_priority: u8, queue_expiration_ms: i64, message_expiration_ms: i64) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-expires".into(), AMQPValue::LongLongInt(queue_expiration_ms as LongLongInt));
    args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(message_expiration_ms as LongLongInt));
    args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(rpc_max_priority as ShortShortUInt));
    args
}

/// Declare arguments for `{model}_completed` and the private pool queues:
/// durable with only a queue TTL.
pub fn plain_queue_args(queue_expiration_ms: i64) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-expires".into(), AMQPValue::LongLongInt(queue_expiration_ms as LongLongInt));
    args
}

/// Options shared by every Consumer-declared queue: durable, not
/// auto-deleted, not exclusive.
pub fn declare_options() -> QueueDeclareOptions {
    QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() }
}

/// Per-request routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// Either pool may serve the request.
    Any,
    /// Prefer the organization-private pool; fall back to the shared pool
    /// on overload (via requeue).
    PrivateFirst,
    /// Only the organization-private pool may serve the request; on
    /// overload, defer and retry rather than fall back.
    PrivateOnly,
}

/// Body of a private-pool request: `{routing_mode, organization}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateRequestBody {
    /// The requester's routing mode.
    pub routing_mode: RoutingMode,
    /// The organization to restrict backend selection to.
    pub organization: String,
}

/// Reply published to `reply_to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReply {
    /// The chosen backend's URL, or the literal `"None"` sentinel.
    #[serde(rename = "llmUrl")]
    pub llm_url: String,
    /// The chosen backend's token, or the literal `"None"` sentinel.
    #[serde(rename = "llmToken")]
    pub llm_token: String,
    /// Backend-side priority, if the priority handler produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

impl DispatchReply {
    /// `{llmUrl:"None", llmToken:"None"}` — "no backend available".
    pub fn sentinel() -> Self {
        Self { llm_url: "None".to_string(), llm_token: "None".to_string(), priority: None }
    }

    /// A real dispatch to `url`/`token`, with an optional backend priority.
    pub fn dispatch(url: String, token: Option<String>, priority: Option<u32>) -> Self {
        Self { llm_url: url, llm_token: token.unwrap_or_else(|| "None".to_string()), priority }
    }

    /// True iff this is the "no backend available" sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.llm_url == "None"
    }
}

/// Published to `{model}_completed` once the Sender finishes streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// Identifier of the original request message.
    pub message_id: String,
    /// Completion timestamp (RFC3339).
    pub completed_at: chrono::DateTime<chrono::Utc>,
    /// The model the request was served by.
    pub model: String,
    /// The authenticated user's name.
    pub user: String,
    /// The backend URL that served the request.
    pub server: String,
}

/// A dispatch-direction request as seen by the Consumer: decoded headers
/// plus the broker-level metadata needed to ack, reply, or requeue it.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    /// Correlation id, unique per logical request; preserved across requeues.
    pub correlation_id: String,
    /// The Sender's exclusive inbox queue name.
    pub reply_to: String,
    /// Broker-level priority (0..N).
    pub priority: u8,
    /// `x-requeue-count`, default 0.
    pub requeue_count: u32,
    /// Raw body bytes (either `AVAILABLE?` or a [`PrivateRequestBody`]).
    pub body: Vec<u8>,
}

impl RequestMessage {
    /// Build the message to republish for a requeue: identical body,
    /// correlation id, reply-to, and priority, with `x-requeue-count`
    /// incremented by exactly 1.
    pub fn requeued(&self) -> RequestMessage {
        RequestMessage { requeue_count: self.requeue_count + 1, ..self.clone() }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_match_wire_contract() {
        assert_eq!(model_queue("llama3"), "llama3");
        assert_eq!(completed_queue("llama3"), "llama3_completed");
        assert_eq!(private_queue("llama3", "acme"), "llama3_acme_private");
    }

    #[test]
    fn sentinel_reply_has_exact_literal_shape() {
        let reply = DispatchReply::sentinel();
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(json, r#"{"llmUrl":"None","llmToken":"None"}"#);
        assert!(reply.is_sentinel());
    }

    #[test]
    fn requeue_preserves_identity_and_increments_count() {
        let original = RequestMessage {
            correlation_id: "abc".to_string(),
            reply_to: "inbox-1".to_string(),
            priority: 3,
            requeue_count: 0,
            body: AVAILABLE_BODY.as_bytes().to_vec(),
        };
        let requeued = original.requeued();
        assert_eq!(requeued.correlation_id, original.correlation_id);
        assert_eq!(requeued.reply_to, original.reply_to);
        assert_eq!(requeued.priority, original.priority);
        assert_eq!(requeued.requeue_count, 1);

        let twice = requeued.requeued();
        assert_eq!(twice.requeue_count, 2);
    }

    #[test]
    fn private_request_body_round_trips() {
        let body = PrivateRequestBody { routing_mode: RoutingMode::PrivateFirst, organization: "acme".to_string() };
        let json = serde_json::to_string(&body).unwrap();
        let back: PrivateRequestBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.organization, "acme");
        assert_eq!(back.routing_mode, RoutingMode::PrivateFirst);
    }
}
