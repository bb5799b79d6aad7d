//! ConsumerDispatcher — owns the AMQP channel, declares the model's
//! queue topology, and runs the main/private/completion consume loops.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{select_all, BoxStream, StreamExt};
use gateway_core::amqp::{self, RequestMessage, RoutingMode};
use gateway_core::{
    Backend, BackendRegistry, CompletionEvent, DispatchReply, GatewayError, PriorityHandler,
    PrivateRequestBody, QoSPolicy, Requeuer, Result, SelectionStrategy, X_REQUEUE_COUNT,
};
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use tokio::sync::oneshot;

use crate::inflight::InFlightCounters;

/// Publishes requeues onto a live `lapin::Channel`, fire-and-forget after
/// the optional delay so `apply_policy` returns without blocking the
/// consume loop.
pub struct ChannelRequeuer {
    channel: Channel,
}

impl ChannelRequeuer {
    /// Wrap a channel for use as a [`Requeuer`].
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait::async_trait]
impl Requeuer for ChannelRequeuer {
    async fn requeue(
        &self,
        message: &RequestMessage,
        target: Option<&str>,
        exchange: &str,
        delay: Option<Duration>,
    ) {
        let channel = self.channel.clone();
        let routing_key = target.unwrap_or(exchange).to_string();
        let message = message.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut headers = FieldTable::default();
            headers.insert(X_REQUEUE_COUNT.into(), AMQPValue::LongUInt(message.requeue_count));
            let properties = BasicProperties::default()
                .with_correlation_id(message.correlation_id.clone().into())
                .with_reply_to(message.reply_to.clone().into())
                .with_priority(message.priority)
                .with_delivery_mode(2)
                .with_headers(headers);
            if let Err(error) = channel
                .basic_publish("", &routing_key, BasicPublishOptions::default(), &message.body, properties)
                .await
            {
                tracing::error!(%error, routing_key, "failed to publish requeued message");
            }
        });
    }
}

/// Ties together the selection strategy, priority handler, QoS policy, and
/// in-flight counters behind one AMQP channel for a single model.
pub struct ConsumerDispatcher {
    model: String,
    channel: Channel,
    registry: Arc<BackendRegistry>,
    strategy: Arc<dyn SelectionStrategy>,
    priority_handler: Arc<dyn PriorityHandler>,
    qos_policy: Arc<dyn QoSPolicy>,
    requeuer: Arc<dyn Requeuer>,
    inflight: Arc<InFlightCounters>,
    requeue_delay: Duration,
}

impl ConsumerDispatcher {
    /// Declare every queue this model owns: the shared request queue, the
    /// completion queue, and one private queue per known organization.
    pub async fn declare_topology(
        channel: &Channel,
        model: &str,
        organizations: &[String],
        rpc_max_priority: u8,
        queue_expiration_ms: i64,
        message_expiration_ms: i64,
    ) -> Result<()> {
        channel
            .queue_declare(
                &amqp::model_queue(model),
                amqp::declare_options(),
                amqp::model_queue_args(rpc_max_priority, queue_expiration_ms, message_expiration_ms),
            )
            .await?;
        channel
            .queue_declare(
                &amqp::completed_queue(model),
                amqp::declare_options(),
                amqp::plain_queue_args(queue_expiration_ms),
            )
            .await?;
        for organization in organizations {
            channel
                .queue_declare(
                    &amqp::private_queue(model, organization),
                    amqp::declare_options(),
                    amqp::plain_queue_args(queue_expiration_ms),
                )
                .await?;
        }
        Ok(())
    }

    /// Build a dispatcher. `channel` must already have `basic_qos(1, ...)`
    /// applied by the caller so only one unacked message is in flight at a time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: String,
        channel: Channel,
        registry: Arc<BackendRegistry>,
        strategy: Arc<dyn SelectionStrategy>,
        priority_handler: Arc<dyn PriorityHandler>,
        qos_policy: Arc<dyn QoSPolicy>,
        requeuer: Arc<dyn Requeuer>,
        inflight: Arc<InFlightCounters>,
        requeue_delay: Duration,
    ) -> Self {
        Self {
            model,
            channel,
            registry,
            strategy,
            priority_handler,
            qos_policy,
            requeuer,
            inflight,
            requeue_delay,
        }
    }

    /// Run the consume loop until `shutdown` fires, merging the main queue,
    /// one stream per private queue, and the completion queue.
    pub async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        enum Incoming {
            Main(Delivery),
            Private(String, Delivery),
            Completed(Delivery),
        }

        let main_tag = format!("consumer-{}-main", self.model);
        let main_consumer = self
            .channel
            .basic_consume(&amqp::model_queue(&self.model), &main_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        let completed_tag = format!("consumer-{}-completed", self.model);
        let completed_consumer = self
            .channel
            .basic_consume(
                &amqp::completed_queue(&self.model),
                &completed_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut streams: Vec<BoxStream<'static, Incoming>> = vec![
            main_consumer
                .filter_map(|item| async move { item.ok().map(Incoming::Main) })
                .boxed(),
            completed_consumer
                .filter_map(|item| async move { item.ok().map(Incoming::Completed) })
                .boxed(),
        ];

        for organization in self.registry.organizations() {
            let tag = format!("consumer-{}-{}-private", self.model, organization);
            let consumer = self
                .channel
                .basic_consume(
                    &amqp::private_queue(&self.model, &organization),
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            let org = organization.clone();
            streams.push(
                consumer
                    .filter_map(move |item| {
                        let org = org.clone();
                        async move { item.ok().map(|delivery| Incoming::Private(org, delivery)) }
                    })
                    .boxed(),
            );
        }

        let mut merged = select_all(streams);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                incoming = merged.next() => {
                    match incoming {
                        None => break,
                        Some(Incoming::Main(delivery)) => self.handle_request(delivery, None).await,
                        Some(Incoming::Private(organization, delivery)) => self.handle_request(delivery, Some(organization)).await,
                        Some(Incoming::Completed(delivery)) => self.handle_completion(delivery).await,
                    }
                }
            }
        }
        Ok(())
    }

    fn decode_request(delivery: &Delivery) -> Result<RequestMessage> {
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.to_string())
            .ok_or_else(|| GatewayError::protocol("missing correlation_id"))?;
        let reply_to = delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|r| r.to_string())
            .ok_or_else(|| GatewayError::protocol("missing reply_to"))?;
        let priority = delivery.properties.priority().unwrap_or(0);
        let requeue_count = delivery
            .properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(X_REQUEUE_COUNT))
            .and_then(|value| match value {
                AMQPValue::LongUInt(v) => Some(*v),
                _ => None,
            })
            .unwrap_or(0);

        Ok(RequestMessage { correlation_id, reply_to, priority, requeue_count, body: delivery.data.clone() })
    }

    /// Candidates are sourced strictly from the organization's private pool
    /// whenever `organization` is set; an empty private pool is not padded
    /// out with the shared active set. Overload handling (falling back to
    /// the shared queue for `private-first`) happens at the QoS-requeue
    /// level, not by widening the candidate list here.
    async fn candidates_for(&self, organization: Option<&str>) -> Vec<Backend> {
        match organization {
            None => self.strategy.active_servers().as_ref().clone(),
            Some(org) => self.registry.by_organization(org).cloned().collect(),
        }
    }

    /// Where a rejected/overloaded request gets requeued to, given the
    /// queue it arrived on. The shared queue requeues to itself;
    /// `private-only` defers and retries in its own private queue;
    /// `private-first` (and any other org-scoped mode) falls over to the
    /// shared queue as an explicit target.
    ///
    /// Free of `self.channel`/`self.registry` so it can be exercised
    /// directly in unit tests without standing up a real AMQP connection.
    fn requeue_destination(model: &str, organization: &Option<String>, routing_mode: Option<RoutingMode>) -> (Option<String>, String) {
        match organization {
            None => (None, amqp::model_queue(model)),
            Some(org) => match routing_mode {
                Some(RoutingMode::PrivateOnly) => (None, amqp::private_queue(model, org)),
                _ => (Some(amqp::model_queue(model)), amqp::model_queue(model)),
            },
        }
    }

    async fn handle_request(&self, delivery: Delivery, organization: Option<String>) {
        let message = match Self::decode_request(&delivery) {
            Ok(m) => m,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed request");
                let _ = delivery.ack(BasicAckOptions::default()).await;
                return;
            }
        };

        let routing_mode = match &organization {
            None => None,
            Some(_) => match serde_json::from_slice::<PrivateRequestBody>(&message.body) {
                Ok(body) => Some(body.routing_mode),
                Err(error) => {
                    tracing::warn!(%error, "dropping request with malformed routing_mode");
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                    return;
                }
            },
        };

        let candidates = self.candidates_for(organization.as_deref()).await;
        let choice = self.strategy.choose_from(&candidates);
        let (target_requeue, requeue_exchange) = Self::requeue_destination(&self.model, &organization, routing_mode);

        let reply = match choice {
            Err(_) => DispatchReply::sentinel(),
            Ok(choice) => {
                let current_in_flight = self.inflight.get(&choice.backend.url);
                let admitted = self
                    .qos_policy
                    .apply_policy(
                        choice.score,
                        current_in_flight,
                        choice.backend.max_parallel_requests,
                        &message,
                        self.requeuer.as_ref(),
                        target_requeue.as_deref(),
                        &requeue_exchange,
                        Some(self.requeue_delay),
                    )
                    .await;

                if !admitted {
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                    return;
                }

                self.inflight.increment(&choice.backend.url);
                let backend_priority = self.priority_handler.apply_priority(message.priority);
                DispatchReply::dispatch(choice.backend.url, choice.backend.token, backend_priority)
            }
        };

        match self.publish_reply(&message.reply_to, &reply).await {
            Ok(()) => {
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to publish dispatch reply, leaving unacked for redelivery");
            }
        }
    }

    async fn publish_reply(&self, reply_to: &str, reply: &DispatchReply) -> Result<()> {
        let body = serde_json::to_vec(reply).map_err(|e| GatewayError::protocol(e.to_string()))?;
        self.channel
            .basic_publish("", reply_to, BasicPublishOptions::default(), &body, BasicProperties::default())
            .await?;
        Ok(())
    }

    async fn handle_completion(&self, delivery: Delivery) {
        match serde_json::from_slice::<CompletionEvent>(&delivery.data) {
            Ok(event) => {
                self.inflight.decrement(&event.server);
                tracing::info!(
                    user = %event.user,
                    model = %event.model,
                    server = %event.server,
                    "request completed"
                );
            }
            Err(error) => {
                tracing::warn!(%error, "dropping malformed completion event");
            }
        }
        let _ = delivery.ack(BasicAckOptions::default()).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn shared_queue_requests_requeue_to_themselves() {
        let (target, exchange) = ConsumerDispatcher::requeue_destination("llama3", &None, None);
        assert_eq!(target, None);
        assert_eq!(exchange, "llama3");
    }

    #[test]
    fn private_only_requeues_within_its_own_private_queue() {
        let organization = Some("acme".to_string());
        let (target, exchange) =
            ConsumerDispatcher::requeue_destination("llama3", &organization, Some(RoutingMode::PrivateOnly));
        assert_eq!(target, None);
        assert_eq!(exchange, amqp::private_queue("llama3", "acme"));
    }

    #[test]
    fn private_first_falls_over_to_the_shared_queue() {
        let organization = Some("acme".to_string());
        let (target, exchange) =
            ConsumerDispatcher::requeue_destination("llama3", &organization, Some(RoutingMode::PrivateFirst));
        assert_eq!(target, Some("llama3".to_string()));
        assert_eq!(exchange, "llama3");
    }

    #[test]
    fn any_mode_with_an_organization_behaves_like_private_first() {
        let organization = Some("acme".to_string());
        let (target, exchange) = ConsumerDispatcher::requeue_destination("llama3", &organization, Some(RoutingMode::Any));
        assert_eq!(target, Some("llama3".to_string()));
        assert_eq!(exchange, "llama3");
    }
}
