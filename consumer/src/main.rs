//! Consumer binary entry point: one process dispatches requests for exactly
//! one model.

mod config;
mod dispatcher;
mod inflight;
mod probes;

use std::sync::Arc;

use gateway_core::{
    Backend, BackendRegistry, GatewayError, HealthSink, Ignore, LeastBusy, MetricsTracker, Passthrough,
    PriorityHandler, QoSPolicy, Requeuer, Result, RoundRobin, SelectionStrategy, ServerPinger,
};
use lapin::options::BasicQosOptions;
use lapin::{Connection, ConnectionProperties};

use config::{ConsumerConfig, PriorityHandlerKind, QualityOfServicePolicyKind, RoutingStrategy};
use dispatcher::{ChannelRequeuer, ConsumerDispatcher};
use inflight::InFlightCounters;
use probes::{ReqwestHealthProbe, ReqwestMetricsFetcher};

/// Delegates `HealthSink::update_servers` through a trait object, so a
/// single `ServerPinger` can drive whichever `SelectionStrategy` the
/// configuration selected.
struct StrategySink(Arc<dyn SelectionStrategy>);

impl HealthSink for StrategySink {
    fn update_servers(&self, healthy: Vec<Backend>) {
        self.0.update_servers(healthy);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ConsumerConfig::load()?;
    tracing::info!(model = %config.model, "starting consumer");

    let registry = Arc::new(BackendRegistry::from_json(
        &config.vllm_servers,
        config.default_max_parallel_requests,
    )?);

    let urls: Vec<String> = registry.backends().iter().map(|b| b.url.clone()).collect();

    let strategy: Arc<dyn SelectionStrategy> = match config.routing_strategy {
        RoutingStrategy::RoundRobin => Arc::new(RoundRobin::new()),
        RoutingStrategy::LeastBusy => {
            let fetcher = Arc::new(ReqwestMetricsFetcher::new());
            let tracker = MetricsTracker::new(fetcher, &urls, config.metrics_refresh_rate, config.refresh_count_per_window);
            tracker.monitor();
            Arc::new(LeastBusy::new(tracker))
        }
    };

    let priority_handler: Arc<dyn PriorityHandler> = match config.priority_handler {
        PriorityHandlerKind::Ignore => Arc::new(Ignore),
        PriorityHandlerKind::Passthrough => Arc::new(Passthrough { best_priority: config.best_priority }),
    };

    let qos_policy: Arc<dyn QoSPolicy> = match config.quality_of_service_policy {
        QualityOfServicePolicyKind::WarningLog => {
            Arc::new(gateway_core::WarningLog { threshold: config.time_to_first_token_threshold })
        }
        QualityOfServicePolicyKind::PerformanceBasedRequeue => {
            Arc::new(gateway_core::PerformanceBasedRequeue {
                threshold: config.time_to_first_token_threshold,
                best_priority: config.best_priority,
            })
        }
        QualityOfServicePolicyKind::ParallelThresholdRequeue => {
            Arc::new(gateway_core::ParallelThresholdRequeue { best_priority: config.best_priority })
        }
    };

    let pinger = ServerPinger::new(Arc::new(ReqwestHealthProbe::new()), registry.backends().to_vec(), config.ping_refresh_rate);
    await_initial_liveness(&pinger, &config).await?;
    let (ping_shutdown, ping_handle) = pinger.spawn(StrategySink(Arc::clone(&strategy)));

    let connection = Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel.basic_qos(1, BasicQosOptions::default()).await?;

    ConsumerDispatcher::declare_topology(
        &channel,
        &config.model,
        &registry.organizations(),
        config.rpc_max_priority,
        config.rpc_queue_expiration_ms,
        config.rpc_message_expiration_ms,
    )
    .await?;

    let requeuer: Arc<dyn Requeuer> = Arc::new(ChannelRequeuer::new(channel.clone()));
    let inflight = Arc::new(InFlightCounters::new());

    let dispatcher = Arc::new(ConsumerDispatcher::new(
        config.model.clone(),
        channel,
        Arc::clone(&registry),
        Arc::clone(&strategy),
        priority_handler,
        qos_policy,
        requeuer,
        inflight,
        config.metrics_refresh_rate,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(wait_for_shutdown_signal(shutdown_tx));

    let result = dispatcher.run(shutdown_rx).await;

    let _ = ping_shutdown.send(());
    let _ = ping_handle.await;

    result
}

async fn await_initial_liveness(pinger: &ServerPinger<ReqwestHealthProbe>, config: &ConsumerConfig) -> Result<()> {
    for attempt in 1..=config.max_vllm_connection_attempts {
        if !pinger.check_once().await.is_empty() {
            return Ok(());
        }
        tracing::warn!(attempt, "no healthy backend yet, retrying");
        tokio::time::sleep(config.initial_metrics_wait).await;
    }
    Err(GatewayError::BackendNotReady {
        attempts: config.max_vllm_connection_attempts,
        wait: config.initial_metrics_wait,
    })
}

async fn wait_for_shutdown_signal(shutdown_tx: tokio::sync::oneshot::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());
}
