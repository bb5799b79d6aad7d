//! The HTTP front door: authenticates a bearer token and runs the AMQP RPC
//! `Call`. Forwarding the request on to the chosen backend and relaying a
//! streamed response is an external relay's job — these handlers stop at
//! the [`CallOutcome`] that layer would consume, and at accepting its
//! completion signal.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::{CompletionEvent, GatewayError, User, UserStore};
use serde::{Deserialize, Serialize};

use crate::rpc_client::{CallOutcome, SenderRPCClient};

/// Shared state for every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Resolves bearer tokens to registered users.
    pub users: Arc<dyn UserStore>,
    /// The AMQP RPC client used to dispatch `Call`s and signal completion.
    pub rpc: Arc<SenderRPCClient>,
    /// Per-call dispatch reply timeout.
    pub message_timeout: Duration,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization")?.to_str().ok()?.strip_prefix("Bearer ")
}

/// Extract the `model` field from an OpenAI-compatible JSON request body.
fn extract_model(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

/// `200` is returned instead of `503` for `chat` clients so a browser UI
/// doesn't render a hard error for a condition the user can simply retry.
fn unavailable_status(user: &User) -> StatusCode {
    if user.client_type.as_deref() == Some("chat") {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Body returned by a dispatch call: a 1:1 mirror of [`CallOutcome`], shaped
/// for the (unbuilt) relay layer to consume.
#[derive(Debug, Serialize)]
#[serde(tag = "status")]
enum DispatchResponse {
    #[serde(rename = "dispatched")]
    Dispatched {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "llmUrl")]
        llm_url: String,
        #[serde(rename = "llmToken")]
        llm_token: Option<String>,
        priority: Option<u32>,
    },
    #[serde(rename = "unavailable")]
    Unavailable,
}

/// `call`/`send_completion` only surface `Err` for genuine broker/protocol
/// failures — admission rejection, an empty healthy set, and a timed-out
/// wait are [`CallOutcome`] values instead, so every remaining case maps to
/// 500.
fn error_response(error: GatewayError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
}

/// Authenticates the caller, extracts `model` from the request body, and
/// runs the dispatch `Call`. Returns the chosen backend (for the relay
/// layer to forward to) or an availability status — it never contacts the
/// backend itself.
pub async fn dispatch(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    let Some(user) = state.users.find_by_token(token).await else {
        return (StatusCode::UNAUTHORIZED, "unknown token").into_response();
    };
    let Some(model) = extract_model(&body) else {
        return (StatusCode::BAD_REQUEST, "request body is missing \"model\"").into_response();
    };

    let outcome = match state
        .rpc
        .call(
            &model,
            user.organization.as_deref(),
            user.default_routing_mode,
            user.priority,
            user.threshold,
            state.message_timeout,
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(error) => return error_response(error),
    };

    match outcome {
        CallOutcome::Dispatched { correlation_id, llm_url, llm_token, priority } => {
            (StatusCode::OK, Json(DispatchResponse::Dispatched { message_id: correlation_id, llm_url, llm_token, priority }))
                .into_response()
        }
        CallOutcome::NoBackendAvailable | CallOutcome::Rejected { .. } | CallOutcome::TimedOut => {
            (unavailable_status(&user), Json(DispatchResponse::Unavailable)).into_response()
        }
    }
}

/// Body the relay layer posts once it has finished forwarding a dispatched
/// call: a `CompletionEvent` minus the fields this service already knows
/// from the dispatch call.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    /// Correlation id returned by the matching `dispatch` call.
    pub message_id: String,
    /// The model the request was served by.
    pub model: String,
    /// The backend URL that served it.
    pub server: String,
}

/// Publishes a `CompletionEvent` to `{model}_completed`, releasing the
/// backend's in-flight slot the Consumer is holding for `message_id`.
pub async fn complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    let Some(user) = state.users.find_by_token(token).await else {
        return (StatusCode::UNAUTHORIZED, "unknown token").into_response();
    };

    let event = CompletionEvent {
        message_id: request.message_id,
        completed_at: chrono::Utc::now(),
        model: request.model,
        user: user.name,
        server: request.server,
    };

    match state.rpc.send_completion(&event.model, &event).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn extracts_model_field() {
        let body = br#"{"model": "llama3", "messages": []}"#;
        assert_eq!(extract_model(body), Some("llama3".to_string()));
    }

    #[test]
    fn missing_model_field_is_none() {
        assert_eq!(extract_model(br#"{"messages": []}"#), None);
    }

    #[test]
    fn bearer_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("sk-abc"));
    }

    #[test]
    fn chat_client_downgrades_to_200() {
        let user = User {
            name: "alice".to_string(),
            token: "tok".to_string(),
            priority: 0,
            threshold: None,
            organization: None,
            default_routing_mode: gateway_core::RoutingMode::Any,
            client_type: Some("chat".to_string()),
        };
        assert_eq!(unavailable_status(&user), StatusCode::OK);
    }

    #[test]
    fn non_chat_client_gets_503() {
        let user = User {
            name: "alice".to_string(),
            token: "tok".to_string(),
            priority: 0,
            threshold: None,
            organization: None,
            default_routing_mode: gateway_core::RoutingMode::Any,
            client_type: None,
        };
        assert_eq!(unavailable_status(&user), StatusCode::SERVICE_UNAVAILABLE);
    }
}
