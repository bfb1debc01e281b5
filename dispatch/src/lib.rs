//! Ticket queue watcher: polling, routing and unattended-ticket escalation.
//!
//! The core is a single sequential loop ([`poll::PollLoop`]) that watches an
//! external ticket queue and pushes notifications about it:
//!
//! - `ticket`: the polled records and the [`ticket::TicketSource`] trait
//! - `store`: key-value persistence with automatic in-memory failover
//! - `router`: pure rules mapping a ticket batch to chat destinations
//! - `escalation`: per-ticket unattended-age state machine
//! - `config`: hot-reloadable, atomically applied runtime configuration
//! - `notify`: rendering plus the [`notify::NotificationSink`] transport trait
//! - `poll`: the fetch/compare/dispatch/persist cycle tying it together
//! - `status`: read-only diagnostics snapshots
//!
//! Concrete ticket sources, chat transports and config services live behind
//! the traits; the binary wires file-backed implementations, deployments
//! substitute their own.

pub mod config;
pub mod escalation;
pub mod notify;
pub mod poll;
pub mod router;
pub mod status;
pub mod store;
pub mod ticket;

// Re-export key ticket types
pub use ticket::{FieldNames, Ticket, TicketSource};

// Re-export key store types
pub use store::{
    unix_now, FileStore, MemoryStore, PersistentStore, ResilientStore, SharedResilientStore,
    StoreError, StoreHealth, StoreResult,
};

// Re-export key routing types
pub use router::{
    batch_match_reason, explain, pick_destinations, ticket_matches, Destination, MatchCriteria,
    RoutingRule, RuleExplanation,
};

// Re-export key escalation types
pub use escalation::{EscalationBatch, EscalationEngine, EscalationRule, EscalationState};

// Re-export key config types
pub use config::{
    bootstrap, ConfigDocument, ConfigError, ConfigManager, ConfigSource, RuntimeConfig,
    DEFAULT_AFTER_S, DEFAULT_MENTION,
};

// Re-export key notification types
pub use notify::{dispatch_to_all, NotificationSink, PlainRenderer, QueueRenderer};

// Re-export key loop types
pub use poll::{
    snapshot_hash, LoopStage, PersistedPollingState, PollLoop, PollSettings, PollingState,
};

// Re-export key status types
pub use status::{format_unix_ts, EscalationStatus, StatusReport};
