//! Mailbox monitoring for the subscription hub.
//!
//! | Depth     | Level    |
//! |-----------|----------|
//! | < 500     | Normal   |
//! | 500-2000  | Warning  |
//! | > 2000    | Critical |

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::observability::metrics;

/// Mailbox depth above which the hub is considered busy.
pub const HUB_MAILBOX_NORMAL: usize = 500;

/// Mailbox depth above which the hub is considered overloaded.
pub const HUB_MAILBOX_WARNING: usize = 2000;

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth of an actor mailbox and mirrors it to
/// `relay_hub_mailbox_depth`.
#[derive(Debug, Default)]
pub struct MailboxMonitor {
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);
        metrics::set_hub_mailbox_depth(new_depth);

        match level_for_depth(new_depth) {
            MailboxLevel::Critical => warn!(
                target: "relay.actor.mailbox",
                depth = new_depth,
                threshold = HUB_MAILBOX_WARNING,
                "Hub mailbox depth critical"
            ),
            // Log once when crossing into the warning band
            MailboxLevel::Warning if new_depth == HUB_MAILBOX_NORMAL + 1 => debug!(
                target: "relay.actor.mailbox",
                depth = new_depth,
                "Hub mailbox depth elevated"
            ),
            _ => {}
        }
    }

    /// Record a message being taken off the mailbox.
    pub fn record_dequeue(&self) {
        // Saturating: a send that failed after record_enqueue is undone here too.
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            })
            .unwrap_or(0);
        metrics::set_hub_mailbox_depth(previous.saturating_sub(1));
    }

    /// Count one fully handled message.
    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        level_for_depth(self.current_depth())
    }
}

fn level_for_depth(depth: usize) -> MailboxLevel {
    if depth > HUB_MAILBOX_WARNING {
        MailboxLevel::Critical
    } else if depth > HUB_MAILBOX_NORMAL {
        MailboxLevel::Warning
    } else {
        MailboxLevel::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_and_peak_tracking() {
        let monitor = MailboxMonitor::new();

        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_enqueue();
        assert_eq!(monitor.current_depth(), 3);

        monitor.record_dequeue();
        monitor.record_processed();
        assert_eq!(monitor.current_depth(), 2);
        assert_eq!(monitor.peak_depth(), 3);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_dequeue_never_underflows() {
        let monitor = MailboxMonitor::new();
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_levels() {
        assert_eq!(level_for_depth(0), MailboxLevel::Normal);
        assert_eq!(level_for_depth(HUB_MAILBOX_NORMAL), MailboxLevel::Normal);
        assert_eq!(level_for_depth(HUB_MAILBOX_NORMAL + 1), MailboxLevel::Warning);
        assert_eq!(level_for_depth(HUB_MAILBOX_WARNING + 1), MailboxLevel::Critical);

        let monitor = MailboxMonitor::new();
        for _ in 0..=HUB_MAILBOX_NORMAL {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);
    }
}
