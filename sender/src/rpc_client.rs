//! SenderRPCClient — publishes dispatch requests and correlates
//! replies arriving on this process's exclusive inbox queue.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use gateway_core::amqp::{self, RoutingMode};
use gateway_core::{CompletionEvent, DispatchReply, GatewayError, PrivateRequestBody, Result};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::admission::AdmissionGate;

type PendingReplies = Arc<DashMap<String, oneshot::Sender<DispatchReply>>>;

/// Tagged outcome of a `Call`: ordinary control-flow paths are values of
/// this enum rather than `Err`, reserving `Err` for genuine broker/protocol
/// failures. The actual HTTP reverse-proxying and streaming body relay to
/// the chosen backend is handled by an external layer; this type is the
/// seam it consumes.
///
/// HTTP mapping for that (unbuilt) layer:
/// - `Dispatched` → forward to `llm_url`; 200 once the relay completes.
/// - `NoBackendAvailable` → 503, or 200 when the caller's `client_type` is
///   `chat` (avoids breaking chat UIs that can't render a 503).
/// - `Rejected` → same 503/200(chat) rule; no broker message was sent.
/// - `TimedOut` → same 503/200(chat) rule as `Rejected`.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// A backend was chosen; `correlation_id` ties this call to the later
    /// `CompletionEvent` the relay must publish via [`SenderRPCClient::send_completion`].
    Dispatched {
        /// Correlation id of the original request.
        correlation_id: String,
        /// Chosen backend's base URL.
        llm_url: String,
        /// Chosen backend's bearer token, if any.
        llm_token: Option<String>,
        /// Backend-side priority, if the priority handler produced one.
        priority: Option<u32>,
    },
    /// The healthy set was empty when the Consumer dequeued this request.
    NoBackendAvailable,
    /// The admission gate rejected this call before it was ever published.
    Rejected {
        /// Observed queue depth.
        depth: u32,
        /// The caller's configured threshold.
        threshold: u32,
    },
    /// No dispatch reply arrived before `message_timeout` elapsed.
    TimedOut,
}

/// RPC client bound to one exclusive reply queue. `Call` publishes a
/// request and awaits the matching reply by correlation id; a background
/// task drains the reply queue and completes whichever pending call it
/// belongs to.
pub struct SenderRPCClient {
    channel: Channel,
    reply_queue: String,
    pending: PendingReplies,
    admission: AdmissionGate,
    consumer_handle: tokio::task::JoinHandle<()>,
}

impl SenderRPCClient {
    /// Declare this process's exclusive inbox queue and start draining it.
    pub async fn connect(channel: Channel) -> Result<Self> {
        let declared = channel
            .queue_declare(
                "",
                QueueDeclareOptions { exclusive: true, auto_delete: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        let reply_queue = declared.name().to_string();

        let pending: PendingReplies = Arc::new(DashMap::new());
        let consumer = channel
            .basic_consume(&reply_queue, "sender-reply", BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        let consumer_handle = tokio::spawn(Self::drain_replies(consumer, Arc::clone(&pending)));
        let admission = AdmissionGate::new(channel.clone());

        Ok(Self { channel, reply_queue, pending, admission, consumer_handle })
    }

    async fn drain_replies(mut consumer: lapin::Consumer, pending: PendingReplies) {
        while let Some(delivery) = consumer.next().await {
            let Ok(delivery) = delivery else { continue };
            let correlation_id = delivery.properties.correlation_id().as_ref().map(|id| id.to_string());
            if let Some(correlation_id) = correlation_id {
                if let Ok(reply) = serde_json::from_slice::<DispatchReply>(&delivery.data) {
                    if let Some((_, sender)) = pending.remove(&correlation_id) {
                        let _ = sender.send(reply);
                    }
                }
            }
            let _ = delivery.ack(BasicAckOptions::default()).await;
        }
    }

    /// Dispatch a request for `model`. `organization`/`routing_mode`
    /// determine whether this publishes to the shared queue (`AVAILABLE?`
    /// body) or an organization's private queue (`PrivateRequestBody`).
    /// Admission is checked against the target queue before publishing;
    /// the call then waits up to `message_timeout` for a reply.
    /// `Err` is reserved for broker/protocol failures — admission
    /// rejection, an empty healthy set, and a timed-out wait are all
    /// ordinary [`CallOutcome`] values.
    pub async fn call(
        &self,
        model: &str,
        organization: Option<&str>,
        routing_mode: RoutingMode,
        priority: u8,
        admission_threshold: Option<u32>,
        message_timeout: Duration,
    ) -> Result<CallOutcome> {
        let queue = match organization {
            Some(org) if routing_mode != RoutingMode::Any => amqp::private_queue(model, org),
            _ => amqp::model_queue(model),
        };

        match self.admission.check(&queue, admission_threshold).await {
            Ok(()) => {}
            Err(GatewayError::QueueOverloaded { depth, threshold }) => {
                return Ok(CallOutcome::Rejected { depth, threshold });
            }
            Err(other) => return Err(other),
        }

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        let body = match organization {
            Some(org) if routing_mode != RoutingMode::Any => {
                serde_json::to_vec(&PrivateRequestBody { routing_mode, organization: org.to_string() })
                    .map_err(|e| GatewayError::protocol(e.to_string()))?
            }
            _ => amqp::AVAILABLE_BODY.as_bytes().to_vec(),
        };

        let properties = BasicProperties::default()
            .with_correlation_id(correlation_id.clone().into())
            .with_reply_to(self.reply_queue.clone().into())
            .with_priority(priority)
            .with_delivery_mode(2);

        if let Err(error) = self
            .channel
            .basic_publish("", &queue, BasicPublishOptions::default(), &body, properties)
            .await
        {
            self.pending.remove(&correlation_id);
            return Err(error.into());
        }

        match tokio::time::timeout(message_timeout, rx).await {
            Ok(Ok(reply)) if reply.is_sentinel() => Ok(CallOutcome::NoBackendAvailable),
            Ok(Ok(reply)) => Ok(CallOutcome::Dispatched {
                correlation_id,
                llm_url: reply.llm_url,
                llm_token: (reply.llm_token != "None").then_some(reply.llm_token),
                priority: reply.priority,
            }),
            Ok(Err(_)) => Err(GatewayError::protocol("reply channel dropped before a reply arrived")),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Ok(CallOutcome::TimedOut)
            }
        }
    }

    /// Publish a completion event once streaming from the chosen backend
    /// has finished.
    pub async fn send_completion(&self, model: &str, event: &CompletionEvent) -> Result<()> {
        let body = serde_json::to_vec(event).map_err(|e| GatewayError::protocol(e.to_string()))?;
        self.channel
            .basic_publish(
                "",
                &amqp::completed_queue(model),
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default(),
            )
            .await?;
        Ok(())
    }

    /// True iff the underlying broker channel is still usable.
    pub fn check_connection(&self) -> bool {
        self.channel.status().connected()
    }
}

impl Drop for SenderRPCClient {
    fn drop(&mut self) {
        self.consumer_handle.abort();
    }
}
