//! Unattended-ticket escalation.
//!
//! Every poll hands the open set to the engine, which answers one question:
//! which tickets have sat unattended past a rule's threshold since they
//! first appeared? Each rule fires at most once per ticket sighting.
//!
//! # Ticket lifecycle
//!
//! ```text
//! appears in queue ──▶ tracked (first_seen recorded)
//!     │
//!     ├─ leaves queue ──▶ state purged; a reappearance restarts the clock
//!     │
//!     ▼
//! age ≥ rule threshold AND rule filter matches
//!     │
//!     ▼
//! escalated (marked once per rule) ──▶ stays quiet while it remains open
//! ```
//!
//! Escalated-once marks are namespaced per rule key, so editing a rule
//! re-arms it without disturbing the marks of other rules.

pub mod engine;
pub mod rules;

pub use engine::{EscalationBatch, EscalationEngine, EscalationState};
pub use rules::EscalationRule;
