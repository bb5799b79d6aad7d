//! AdmissionGate — rejects a Call before it is ever published if the
//! target queue is already deeper than the caller's configured threshold.

use gateway_core::amqp;
use gateway_core::{GatewayError, Result};
use lapin::options::QueueDeclareOptions;
use lapin::types::FieldTable;
use lapin::Channel;

/// Checks queue depth via a passive declare, which returns the current
/// `message_count` without altering the queue.
pub struct AdmissionGate {
    channel: Channel,
}

impl AdmissionGate {
    /// Wrap a channel for admission checks.
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Reject the call if `queue`'s current depth exceeds `threshold`. A
    /// `None` threshold means the caller is unbounded.
    pub async fn check(&self, queue: &str, threshold: Option<u32>) -> Result<()> {
        let Some(threshold) = threshold else {
            return Ok(());
        };
        let options = QueueDeclareOptions { passive: true, ..amqp::declare_options() };
        let info = self.channel.queue_declare(queue, options, FieldTable::default()).await?;
        let depth = info.message_count();
        if depth > threshold {
            return Err(GatewayError::QueueOverloaded { depth, threshold });
        }
        Ok(())
    }
}
