//! Notification rendering and dispatch.
//!
//! The loop decides WHEN and WHERE to notify; this module owns what the
//! message looks like and pushes it through the sink. Delivery is
//! at-least-once: receivers must tolerate an occasional duplicate.

use async_trait::async_trait;
use tracing::warn;

use crate::router::Destination;
use crate::ticket::Ticket;

/// Delivery transport for rendered notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, dest: &Destination, text: &str) -> anyhow::Result<()>;
}

/// Renders ticket batches into notification text.
pub trait QueueRenderer: Send + Sync {
    /// The main queue-changed notification.
    fn render_queue(&self, tickets: &[Ticket]) -> String;
    /// An escalation notification. `mention` may be empty.
    fn render_escalation(&self, tickets: &[Ticket], mention: &str) -> String;
}

/// Default plain-text renderer: a headline, one line per ticket, capped.
pub struct PlainRenderer {
    pub max_items: usize,
}

impl Default for PlainRenderer {
    fn default() -> Self {
        Self { max_items: 10 }
    }
}

impl PlainRenderer {
    fn push_ticket_lines(&self, lines: &mut Vec<String>, tickets: &[Ticket]) {
        for ticket in tickets.iter().take(self.max_items) {
            lines.push(format!("#{} {}", ticket.id, ticket.name));
        }
        let rest = tickets.len().saturating_sub(self.max_items);
        if rest > 0 {
            lines.push(format!("... and {} more", rest));
        }
    }
}

impl QueueRenderer for PlainRenderer {
    fn render_queue(&self, tickets: &[Ticket]) -> String {
        if tickets.is_empty() {
            return "Open queue is empty".to_string();
        }
        let mut lines = vec![format!("Open tickets: {}", tickets.len())];
        self.push_ticket_lines(&mut lines, tickets);
        lines.join("\n")
    }

    fn render_escalation(&self, tickets: &[Ticket], mention: &str) -> String {
        let headline = if mention.is_empty() {
            format!("Unattended tickets: {}", tickets.len())
        } else {
            format!("{} unattended tickets: {}", mention, tickets.len())
        };
        let mut lines = vec![headline];
        self.push_ticket_lines(&mut lines, tickets);
        lines.join("\n")
    }
}

/// Deliver `text` to every destination, isolating failures: one unreachable
/// chat must not stop the others. Returns how many deliveries succeeded.
pub async fn dispatch_to_all(
    sink: &dyn NotificationSink,
    destinations: &[Destination],
    text: &str,
) -> usize {
    let mut delivered = 0;
    for dest in destinations {
        match sink.deliver(dest, text).await {
            Ok(()) => delivered += 1,
            Err(e) => warn!(dest = %dest, error = %e, "notification delivery failed"),
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FlakySink {
        fail_chat: i64,
        delivered: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn deliver(&self, dest: &Destination, _text: &str) -> anyhow::Result<()> {
            if dest.chat_id == self.fail_chat {
                anyhow::bail!("chat unreachable");
            }
            self.delivered
                .lock()
                .expect("sink lock")
                .push(dest.chat_id);
            Ok(())
        }
    }

    #[test]
    fn test_render_queue_caps_items() {
        let renderer = PlainRenderer { max_items: 2 };
        let tickets = vec![
            Ticket::new(1, "a"),
            Ticket::new(2, "b"),
            Ticket::new(3, "c"),
            Ticket::new(4, "d"),
        ];

        let text = renderer.render_queue(&tickets);

        assert!(text.starts_with("Open tickets: 4"));
        assert!(text.contains("#1 a"));
        assert!(text.contains("#2 b"));
        assert!(!text.contains("#3 c"));
        assert!(text.ends_with("... and 2 more"));
    }

    #[test]
    fn test_render_empty_queue() {
        let renderer = PlainRenderer::default();

        assert_eq!(renderer.render_queue(&[]), "Open queue is empty");
    }

    #[test]
    fn test_render_escalation_mentions() {
        let renderer = PlainRenderer::default();
        let tickets = vec![Ticket::new(9, "stuck")];

        let text = renderer.render_escalation(&tickets, "@duty_engineer");
        assert!(text.starts_with("@duty_engineer unattended tickets: 1"));
        assert!(text.contains("#9 stuck"));

        let bare = renderer.render_escalation(&tickets, "");
        assert!(bare.starts_with("Unattended tickets: 1"));
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failures() {
        let sink = FlakySink {
            fail_chat: -2,
            delivered: Mutex::new(Vec::new()),
        };
        let destinations = vec![
            Destination::new(-1, None),
            Destination::new(-2, None),
            Destination::new(-3, None),
        ];

        let delivered = dispatch_to_all(&sink, &destinations, "hello").await;

        assert_eq!(delivered, 2);
        assert_eq!(*sink.delivered.lock().expect("sink lock"), vec![-1, -3]);
    }
}
