//! PriorityHandler — maps broker-level message priority onto an
//! optional backend-side priority field.

/// `ApplyPriority` implementations.
pub trait PriorityHandler: Send + Sync {
    /// Given the broker message's priority, return the backend-side
    /// priority to attach to the dispatch reply, or `None`.
    fn apply_priority(&self, message_priority: u8) -> Option<u32>;
}

/// Never attaches a backend priority.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ignore;

impl PriorityHandler for Ignore {
    fn apply_priority(&self, _message_priority: u8) -> Option<u32> {
        None
    }
}

/// Inverts broker priority into backend priority: higher broker priority
/// becomes lower numeric backend priority, floored at 0.
#[derive(Debug, Clone, Copy)]
pub struct Passthrough {
    /// The best (highest) broker-level priority, from `BEST_PRIORITY`.
    pub best_priority: u8,
}

impl PriorityHandler for Passthrough {
    fn apply_priority(&self, message_priority: u8) -> Option<u32> {
        Some(self.best_priority.saturating_sub(message_priority) as u32)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn ignore_always_none() {
        let handler = Ignore;
        assert_eq!(handler.apply_priority(0), None);
        assert_eq!(handler.apply_priority(5), None);
    }

    #[test]
    fn passthrough_inverts_and_floors_at_zero() {
        let handler = Passthrough { best_priority: 5 };
        assert_eq!(handler.apply_priority(0), Some(5));
        assert_eq!(handler.apply_priority(5), Some(0));
        assert_eq!(handler.apply_priority(7), Some(0)); // saturating, never negative
    }
}
