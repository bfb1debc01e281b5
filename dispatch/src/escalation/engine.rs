//! Unattended-ticket state machine.
//!
//! The engine tracks when each open ticket was first seen, purges tickets
//! that leave the queue, and fires each rule at most once per ticket
//! sighting. State is persisted through the resilient store every pass, so
//! restarts neither re-escalate nor forget how long a ticket has waited.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::router::Destination;
use crate::store::SharedResilientStore;
use crate::ticket::{FieldNames, Ticket};

use super::rules::EscalationRule;

/// Namespace for escalated-once marks written before rules had keys.
/// Old blobs carried `escalated_at` as a flat `{ticket_id: ts}` map; those
/// marks suppress re-escalation under every rule until the ticket leaves
/// the queue.
const LEGACY_RULE_NS: &str = "legacy";

/// Persisted escalation state.
///
/// Ticket ids are stored as strings because they are JSON object keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationState {
    /// Ticket id to Unix seconds of first sighting in the open queue.
    #[serde(default)]
    pub seen_at: HashMap<String, f64>,
    /// Rule key to ticket id to Unix seconds when that rule fired.
    #[serde(default, deserialize_with = "deserialize_escalated")]
    pub escalated_at: HashMap<String, HashMap<String, f64>>,
}

/// Accepts both the namespaced layout and the legacy flat one, folding
/// legacy entries under [`LEGACY_RULE_NS`]. Entries that are neither a
/// timestamp nor a map are dropped.
fn deserialize_escalated<'de, D>(
    deserializer: D,
) -> Result<HashMap<String, HashMap<String, f64>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: HashMap<String, serde_json::Value> = HashMap::deserialize(deserializer)?;
    let mut out: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for (key, value) in raw {
        match value {
            serde_json::Value::Object(entries) => {
                let inner: &mut HashMap<String, f64> = out.entry(key).or_default();
                for (ticket_id, ts) in entries {
                    if let Some(ts) = ts.as_f64() {
                        inner.insert(ticket_id, ts);
                    }
                }
            }
            other => {
                if let Some(ts) = other.as_f64() {
                    out.entry(LEGACY_RULE_NS.to_string())
                        .or_default()
                        .insert(key, ts);
                }
            }
        }
    }
    Ok(out)
}

impl EscalationState {
    /// Record the first sighting of a ticket. Later sightings keep the
    /// original timestamp.
    pub fn mark_seen(&mut self, id: i64, now: f64) {
        self.seen_at.entry(id.to_string()).or_insert(now);
    }

    pub fn first_seen(&self, id: &str) -> Option<f64> {
        self.seen_at.get(id).copied()
    }

    /// Drop every ticket not in `current` from both maps. A ticket that
    /// later reappears starts a fresh sighting and may escalate again.
    /// Returns how many tracked tickets were purged.
    pub fn purge_absent(&mut self, current: &HashSet<String>) -> usize {
        let before = self.seen_at.len();
        self.seen_at.retain(|id, _| current.contains(id));
        for marks in self.escalated_at.values_mut() {
            marks.retain(|id, _| current.contains(id));
        }
        self.escalated_at.retain(|_, marks| !marks.is_empty());
        before - self.seen_at.len()
    }

    /// Whether this rule already fired for the ticket. Legacy marks count
    /// against every rule.
    pub fn already_escalated(&self, rule_key: &str, id: &str) -> bool {
        self.escalated_at
            .get(rule_key)
            .map_or(false, |marks| marks.contains_key(id))
            || self
                .escalated_at
                .get(LEGACY_RULE_NS)
                .map_or(false, |marks| marks.contains_key(id))
    }

    pub fn mark_escalated(&mut self, rule_key: &str, id: &str, now: f64) {
        self.escalated_at
            .entry(rule_key.to_string())
            .or_default()
            .insert(id.to_string(), now);
    }

    pub fn tracked_count(&self) -> usize {
        self.seen_at.len()
    }

    pub fn escalated_count(&self) -> usize {
        self.escalated_at.values().map(|marks| marks.len()).sum()
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "tracked={} escalated={}",
            self.tracked_count(),
            self.escalated_count()
        )
    }
}

/// Tickets to escalate to one destination with one mention, this pass.
#[derive(Debug, Clone)]
pub struct EscalationBatch {
    pub dest: Destination,
    pub mention: String,
    pub tickets: Vec<Ticket>,
}

/// Runs the unattended-ticket rules against each poll's open set.
///
/// Built from the active config and rebuilt on every config change; the
/// store key stays fixed across rebuilds so first-seen timers survive rule
/// edits.
pub struct EscalationEngine {
    rules: Vec<(String, EscalationRule)>,
    fields: FieldNames,
    default_mention: String,
    store: SharedResilientStore,
    store_key: String,
    state: EscalationState,
}

impl EscalationEngine {
    pub fn new(
        rules: Vec<EscalationRule>,
        fields: FieldNames,
        default_mention: String,
        store: SharedResilientStore,
        store_key: impl Into<String>,
    ) -> Self {
        let store_key = store_key.into();
        let state = store
            .get_typed::<EscalationState>(&store_key)
            .unwrap_or_default();
        debug!(rules = rules.len(), "escalation state loaded: {}", state.summary());
        let rules = rules
            .into_iter()
            .map(|rule| (rule.rule_key(), rule))
            .collect();
        Self {
            rules,
            fields,
            default_mention,
            store,
            store_key,
            state,
        }
    }

    pub fn state(&self) -> &EscalationState {
        &self.state
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// One pass over the current open set.
    ///
    /// Updates first-seen marks, purges tickets that left the queue, fires
    /// every rule whose threshold a matching ticket has crossed, marks those
    /// tickets escalated, and saves state. Batches going to the same
    /// destination with the same mention are merged.
    pub fn process(&mut self, tickets: &[Ticket], now: f64) -> Vec<EscalationBatch> {
        let mut current: HashSet<String> = HashSet::new();
        for ticket in tickets {
            if ticket.id > 0 {
                current.insert(ticket.id.to_string());
                self.state.mark_seen(ticket.id, now);
            }
        }

        let purged = self.state.purge_absent(&current);
        if purged > 0 {
            debug!(purged, "tickets left the queue, escalation state cleared");
        }

        let mut batches: Vec<EscalationBatch> = Vec::new();
        for (rule_key, rule) in &self.rules {
            for ticket in tickets {
                if ticket.id <= 0 || !rule.applies_to(ticket, &self.fields) {
                    continue;
                }
                let id = ticket.id.to_string();
                if self.state.already_escalated(rule_key, &id) {
                    continue;
                }
                let first_seen = self.state.first_seen(&id).unwrap_or(now);
                if now - first_seen < rule.after_s as f64 {
                    continue;
                }
                self.state.mark_escalated(rule_key, &id, now);
                let mention = rule
                    .mention
                    .clone()
                    .unwrap_or_else(|| self.default_mention.clone());
                push_to_batch(&mut batches, rule.dest, mention, ticket);
            }
        }

        if !batches.is_empty() {
            info!(batches = batches.len(), "escalations due: {}", self.state.summary());
        }
        self.store.set_typed(&self.store_key, &self.state);
        batches
    }
}

/// Merge into an existing (destination, mention) batch, or open a new one.
/// A ticket matched by several rules with the same target appears once.
fn push_to_batch(
    batches: &mut Vec<EscalationBatch>,
    dest: Destination,
    mention: String,
    ticket: &Ticket,
) {
    for batch in batches.iter_mut() {
        if batch.dest == dest && batch.mention == mention {
            if !batch.tickets.iter().any(|t| t.id == ticket.id) {
                batch.tickets.push(ticket.clone());
            }
            return;
        }
    }
    batches.push(EscalationBatch {
        dest,
        mention,
        tickets: vec![ticket.clone()],
    });
}
