use std::time::Duration;

use crate::hci::{DEFAULT_EVENT_MASK, DEFAULT_LE_EVENT_MASK};
use crate::types::ACL_PKT_PAYLOAD_MIN_SIZE;

/// Host tuning knobs. `Default` gives values that work against any LE controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// Upper bound of one transport poll.
    pub poll_timeout: Duration,
    /// Polls spent waiting for each bring-up command to complete.
    pub command_attempts: u32,
    pub tx_queue_capacity: usize,
    pub event_queue_capacity: usize,
    /// Used when LE Read Buffer Size reports zero buffers.
    pub fallback_acl_slots: usize,
    /// Used when LE Read Buffer Size reports a zero length.
    pub fallback_acl_max_len: usize,
    pub event_mask: u64,
    pub le_event_mask: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            command_attempts: 50,
            tx_queue_capacity: 64,
            event_queue_capacity: 32,
            fallback_acl_slots: 12,
            fallback_acl_max_len: ACL_PKT_PAYLOAD_MIN_SIZE,
            event_mask: DEFAULT_EVENT_MASK,
            le_event_mask: DEFAULT_LE_EVENT_MASK,
        }
    }
}

impl HostConfig {
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_command_attempts(mut self, attempts: u32) -> Self {
        self.command_attempts = attempts.max(1);
        self
    }

    pub fn with_tx_queue_capacity(mut self, capacity: usize) -> Self {
        self.tx_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_fallback_acl_slots(mut self, slots: usize) -> Self {
        self.fallback_acl_slots = slots.max(1);
        self
    }

    pub fn with_fallback_acl_max_len(mut self, len: usize) -> Self {
        self.fallback_acl_max_len = len.max(ACL_PKT_PAYLOAD_MIN_SIZE);
        self
    }

    pub fn with_event_mask(mut self, mask: u64) -> Self {
        self.event_mask = mask;
        self
    }

    pub fn with_le_event_mask(mut self, mask: u64) -> Self {
        self.le_event_mask = mask;
        self
    }
}
