//! Escalation rule definitions and their stable state keys.

use std::fmt::Write as _;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::router::{ticket_matches, Destination, MatchCriteria};
use crate::ticket::{FieldNames, Ticket};

/// One escalation rule: which tickets it watches, how long they may sit
/// unattended, and where the escalation goes.
///
/// `mention` stays `None` when the rule does not override it; the engine
/// falls back to the configured default when building batches. Keeping the
/// fallback out of the rule means editing the default mention does not
/// change any rule's identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationRule {
    pub dest: Destination,
    /// Age threshold in seconds. 0 escalates on first sighting.
    pub after_s: i64,
    pub mention: Option<String>,
    pub criteria: MatchCriteria,
}

impl EscalationRule {
    /// Whether this rule applies to the ticket. An empty filter watches
    /// every ticket.
    pub fn applies_to(&self, ticket: &Ticket, fields: &FieldNames) -> bool {
        self.criteria.is_empty() || ticket_matches(&self.criteria, ticket, fields)
    }

    /// Stable key namespacing this rule's escalated-once marks in the store.
    ///
    /// Derived from the rule's full content, so editing any part of a rule
    /// (threshold, destination, mention, filter) re-arms it for tickets it
    /// already escalated, without touching the marks of other rules.
    pub fn rule_key(&self) -> String {
        let fingerprint = serde_json::json!([
            self.dest.chat_id,
            self.dest.thread_id,
            self.after_s,
            self.mention,
            self.criteria.keywords,
            self.criteria.service_ids,
            self.criteria.customer_ids,
            self.criteria.creator_ids,
            self.criteria.creator_company_ids,
        ]);
        let digest = Sha256::digest(fingerprint.to_string().as_bytes());
        let mut key = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            let _ = write!(key, "{:02x}", byte);
        }
        key
    }
}
