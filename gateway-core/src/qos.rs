//! QoSPolicy — decides whether a dispatch proceeds immediately or gets
//! deferred back onto the broker for a later attempt.

use std::time::Duration;

use crate::amqp::RequestMessage;

/// Publishes a requeued message, preserving its identity per
/// [`RequestMessage::requeued`]. Implemented with `lapin` in `consumer`;
/// abstracted here so policy decisions are testable without a broker.
#[async_trait::async_trait]
pub trait Requeuer: Send + Sync {
    /// Publish `message` to `target` (a queue name) if given, otherwise back
    /// to `exchange` using the message's original routing key, optionally
    /// after `delay`.
    async fn requeue(
        &self,
        message: &RequestMessage,
        target: Option<&str>,
        exchange: &str,
        delay: Option<Duration>,
    );
}

/// `ApplyPolicy` implementations.
#[async_trait::async_trait]
pub trait QoSPolicy: Send + Sync {
    /// Decide whether to admit the current dispatch attempt.
    ///
    /// `score` is the selection strategy's chosen score (`None` for
    /// round-robin, the least-busy p95 bucket otherwise).
    /// `current_in_flight`/`max_in_flight` describe the chosen backend's
    /// load. Returns `true` if the caller should dispatch now; `false` if
    /// this policy already requeued the message and the caller should stop.
    async fn apply_policy(
        &self,
        score: Option<f64>,
        current_in_flight: u32,
        max_in_flight: u32,
        message: &RequestMessage,
        requeuer: &dyn Requeuer,
        target_requeue: Option<&str>,
        exchange: &str,
        delay: Option<Duration>,
    ) -> bool;
}

/// VIP-band bypass: messages whose broker priority is within one step of
/// `best_priority` are always admitted, regardless of policy.
fn is_vip(message: &RequestMessage, best_priority: u8) -> bool {
    message.priority >= best_priority.saturating_sub(1)
}

/// Never requeues; logs a warning when the backend looks overloaded and
/// always admits. The no-op baseline policy.
#[derive(Debug, Clone, Copy)]
pub struct WarningLog {
    /// Bucket value, in seconds, above which a backend is considered
    /// overloaded for logging purposes (`TIME_TO_FIRST_TOKEN_THRESHOLD`).
    pub threshold: f64,
}

#[async_trait::async_trait]
impl QoSPolicy for WarningLog {
    async fn apply_policy(
        &self,
        score: Option<f64>,
        current_in_flight: u32,
        max_in_flight: u32,
        message: &RequestMessage,
        _requeuer: &dyn Requeuer,
        _target_requeue: Option<&str>,
        _exchange: &str,
        _delay: Option<Duration>,
    ) -> bool {
        let over_threshold = matches!(score, Some(s) if s > self.threshold);
        let at_capacity = current_in_flight >= max_in_flight;
        if over_threshold || at_capacity {
            tracing::warn!(
                score,
                threshold = self.threshold,
                current_in_flight,
                max_in_flight,
                correlation_id = %message.correlation_id,
                "dispatching to a backend over its time-to-first-token threshold or in-flight capacity"
            );
        }
        true
    }
}

/// Requeues when the chosen backend's p95 time-to-first-token bucket
/// exceeds `threshold`, unless the message is in the VIP band.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceBasedRequeue {
    /// Bucket value, in seconds, above which the request is deferred
    /// (`TIME_TO_FIRST_TOKEN_THRESHOLD`).
    pub threshold: f64,
    /// The best (highest) broker-level priority, from `BEST_PRIORITY`.
    pub best_priority: u8,
}

#[async_trait::async_trait]
impl QoSPolicy for PerformanceBasedRequeue {
    async fn apply_policy(
        &self,
        score: Option<f64>,
        _current_in_flight: u32,
        _max_in_flight: u32,
        message: &RequestMessage,
        requeuer: &dyn Requeuer,
        target_requeue: Option<&str>,
        exchange: &str,
        delay: Option<Duration>,
    ) -> bool {
        if is_vip(message, self.best_priority) {
            return true;
        }
        let overloaded = matches!(score, Some(s) if s > self.threshold) || score == Some(f64::INFINITY);
        if overloaded {
            let requeued = message.requeued();
            requeuer.requeue(&requeued, target_requeue, exchange, delay).await;
            return false;
        }
        true
    }
}

/// Requeues when the chosen backend already has `max_in_flight` requests in
/// flight, unless the message is in the VIP band.
#[derive(Debug, Clone, Copy)]
pub struct ParallelThresholdRequeue {
    /// The best (highest) broker-level priority, from `BEST_PRIORITY`.
    pub best_priority: u8,
}

#[async_trait::async_trait]
impl QoSPolicy for ParallelThresholdRequeue {
    async fn apply_policy(
        &self,
        _score: Option<f64>,
        current_in_flight: u32,
        max_in_flight: u32,
        message: &RequestMessage,
        requeuer: &dyn Requeuer,
        target_requeue: Option<&str>,
        exchange: &str,
        delay: Option<Duration>,
    ) -> bool {
        if is_vip(message, self.best_priority) {
            return true;
        }
        if current_in_flight >= max_in_flight {
            let requeued = message.requeued();
            requeuer.requeue(&requeued, target_requeue, exchange, delay).await;
            return false;
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn message(priority: u8) -> RequestMessage {
        RequestMessage {
            correlation_id: "c".to_string(),
            reply_to: "r".to_string(),
            priority,
            requeue_count: 0,
            body: b"AVAILABLE?".to_vec(),
        }
    }

    struct CountingRequeuer(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Requeuer for CountingRequeuer {
        async fn requeue(&self, _message: &RequestMessage, _target: Option<&str>, _exchange: &str, _delay: Option<Duration>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn warning_log_never_requeues() {
        let policy = WarningLog { threshold: 1.0 };
        let calls = Arc::new(AtomicUsize::new(0));
        let requeuer = CountingRequeuer(Arc::clone(&calls));
        let admitted = policy
            .apply_policy(Some(5.0), 0, 10, &message(0), &requeuer, None, "ex", None)
            .await;
        assert!(admitted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn warning_log_warns_on_capacity_alone_and_still_admits() {
        // Below threshold but at in-flight capacity: still admitted (warning-log
        // never requeues), but the warning fires on the capacity branch, not
        // the score branch.
        let policy = WarningLog { threshold: 10.0 };
        let calls = Arc::new(AtomicUsize::new(0));
        let requeuer = CountingRequeuer(Arc::clone(&calls));
        let admitted = policy
            .apply_policy(Some(0.1), 10, 10, &message(0), &requeuer, None, "ex", None)
            .await;
        assert!(admitted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn performance_based_requeues_when_over_threshold() {
        let policy = PerformanceBasedRequeue { threshold: 1.0, best_priority: 5 };
        let calls = Arc::new(AtomicUsize::new(0));
        let requeuer = CountingRequeuer(Arc::clone(&calls));
        let admitted = policy
            .apply_policy(Some(2.0), 0, 10, &message(0), &requeuer, Some("q"), "ex", None)
            .await;
        assert!(!admitted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn performance_based_admits_within_threshold() {
        let policy = PerformanceBasedRequeue { threshold: 1.0, best_priority: 5 };
        let calls = Arc::new(AtomicUsize::new(0));
        let requeuer = CountingRequeuer(Arc::clone(&calls));
        let admitted = policy
            .apply_policy(Some(0.5), 0, 10, &message(0), &requeuer, Some("q"), "ex", None)
            .await;
        assert!(admitted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vip_band_bypasses_performance_policy() {
        let policy = PerformanceBasedRequeue { threshold: 1.0, best_priority: 5 };
        let calls = Arc::new(AtomicUsize::new(0));
        let requeuer = CountingRequeuer(Arc::clone(&calls));
        // priority 4 >= best_priority(5) - 1 = 4, so VIP.
        let admitted = policy
            .apply_policy(Some(f64::INFINITY), 0, 10, &message(4), &requeuer, Some("q"), "ex", None)
            .await;
        assert!(admitted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parallel_threshold_requeues_at_capacity() {
        let policy = ParallelThresholdRequeue { best_priority: 5 };
        let calls = Arc::new(AtomicUsize::new(0));
        let requeuer = CountingRequeuer(Arc::clone(&calls));
        let admitted = policy
            .apply_policy(None, 10, 10, &message(0), &requeuer, None, "ex", Some(Duration::from_secs(1)))
            .await;
        assert!(!admitted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parallel_threshold_admits_below_capacity() {
        let policy = ParallelThresholdRequeue { best_priority: 5 };
        let calls = Arc::new(AtomicUsize::new(0));
        let requeuer = CountingRequeuer(Arc::clone(&calls));
        let admitted = policy
            .apply_policy(None, 9, 10, &message(0), &requeuer, None, "ex", None)
            .await;
        assert!(admitted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
