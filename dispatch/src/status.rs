//! Read-only runtime diagnostics.
//!
//! A [`StatusReport`] is assembled on demand from the live components. It
//! never blocks the loop and may be one cycle stale, which is fine for
//! answering "is this thing alive and what did it last do".

use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::poll::{LoopStage, PollLoop, PollingState};
use crate::store::StoreHealth;

#[derive(Debug, Clone, Serialize)]
pub struct EscalationStatus {
    pub rules: usize,
    /// Open tickets with a first-seen timer running.
    pub tracked: usize,
    /// Escalated-once marks currently held.
    pub escalated: usize,
}

/// Point-in-time snapshot of loop, config and store health.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub stage: LoopStage,
    pub config_version: i64,
    pub config_source: String,
    pub polling: PollingState,
    pub store: StoreHealth,
    /// Absent while escalation is disabled.
    pub escalation: Option<EscalationStatus>,
}

impl StatusReport {
    pub fn from_loop(poll: &PollLoop) -> Self {
        let active = poll.config().active();
        let escalation = poll.config().engine().map(|engine| EscalationStatus {
            rules: engine.rule_count(),
            tracked: engine.state().tracked_count(),
            escalated: engine.state().escalated_count(),
        });
        Self {
            stage: poll.stage(),
            config_version: active.version,
            config_source: active.source.clone(),
            polling: poll.state().clone(),
            store: poll.store().health(),
            escalation,
        }
    }

    /// One-line summary for shutdown and periodic logs.
    pub fn summary(&self) -> String {
        let last_success = self
            .polling
            .last_success_at
            .map(format_unix_ts)
            .unwrap_or_else(|| "never".to_string());
        format!(
            "stage={} config_v{} runs={} failures={} last_success={} store={}",
            self.stage,
            self.config_version,
            self.polling.runs,
            self.polling.failures,
            last_success,
            self.store.active_backend,
        )
    }
}

/// Unix seconds to RFC 3339, for human eyes. Falls back to the raw value
/// when outside the representable range.
pub fn format_unix_ts(ts: f64) -> String {
    match Utc.timestamp_opt(ts as i64, 0) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
        _ => format!("{}", ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_unix_ts() {
        assert_eq!(format_unix_ts(0.0), "1970-01-01T00:00:00+00:00");
        assert_eq!(format_unix_ts(1_700_000_000.0), "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn test_summary_line() {
        let report = StatusReport {
            stage: LoopStage::Idle,
            config_version: 3,
            config_source: "web".to_string(),
            polling: PollingState {
                runs: 12,
                failures: 2,
                last_success_at: Some(0.0),
                ..PollingState::default()
            },
            store: StoreHealth {
                active_backend: "file".to_string(),
                degraded: false,
                last_error: None,
                last_ok_at: Some(0.0),
            },
            escalation: None,
        };

        assert_eq!(
            report.summary(),
            "stage=idle config_v3 runs=12 failures=2 last_success=1970-01-01T00:00:00+00:00 store=file"
        );
    }
}
