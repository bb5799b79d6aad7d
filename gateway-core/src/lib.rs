//! # gateway-core — domain logic for the inference gateway
//!
//! Backend registry, histogram/metrics tracking, liveness pinging,
//! selection strategies, priority handling, QoS policies, the AMQP wire
//! contract, and the user directory shared by the `consumer` and `sender`
//! binaries.
//!
//! This crate holds no broker connection of its own: it depends on `lapin`
//! only for wire-level types (`FieldTable`, `QueueDeclareOptions`,
//! `lapin::Error`) so that `consumer` and `sender` share one definition of
//! the queue contract instead of duplicating it.
//!
//! # Module Organization
//!
//! - [`backend`] — `Backend`, `BackendRegistry`
//! - [`histogram`] — Prometheus histogram parsing, diffing, percentiles
//! - [`metrics`] — `MetricsTracker`, sliding-window per-backend state
//! - [`pinger`] — `ServerPinger`, liveness probing and healthy-set fan-out
//! - [`strategy`] — `RoundRobin`, `LeastBusy` selection strategies
//! - [`priority`] — `PriorityHandler` implementations
//! - [`qos`] — `QoSPolicy` implementations and requeue semantics
//! - [`amqp`] — queue names, declare arguments, and wire message types
//! - [`user`] — `User`, `UserStore`, usage accounting
//! - [`error`] — the crate-wide [`error::GatewayError`]

pub mod amqp;
pub mod backend;
pub mod error;
pub mod histogram;
pub mod metrics;
pub mod pinger;
pub mod priority;
pub mod qos;
pub mod strategy;
pub mod user;

pub use amqp::{
    CompletionEvent, DispatchReply, PrivateRequestBody, RequestMessage, RoutingMode,
    X_REQUEUE_COUNT,
};
pub use backend::{Backend, BackendRegistry, DEFAULT_MAX_PARALLEL_REQUESTS};
pub use error::{GatewayError, Result};
pub use histogram::{Bound, Histogram};
pub use metrics::{MetricsFetcher, MetricsTracker};
pub use pinger::{HealthProbe, HealthSink, HealthyBackends, ServerPinger, PING_TIMEOUT};
pub use priority::{Ignore, Passthrough, PriorityHandler};
pub use qos::{ParallelThresholdRequeue, PerformanceBasedRequeue, QoSPolicy, Requeuer, WarningLog};
pub use strategy::{Choice, LeastBusy, RoundRobin, SelectionStrategy, NO_DATA_SCORE, SCORE_PERCENTILE};
pub use user::{InMemoryUserStore, UsageMetric, User, UserStore};
