//! Destination routing for queue notifications.
//!
//! Routing is pure: rules plus the current ticket batch in, destinations
//! out. Delivery, rate limiting and persistence live elsewhere.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ticket::{FieldNames, Ticket};

/// Where a notification is delivered: a chat plus an optional thread.
///
/// Thread id 0 and "no thread" are the same destination; [`Destination::new`]
/// normalizes that. The derived ordering (chat first, threadless before
/// threaded) is the stable order notifications fan out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Destination {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
}

impl Destination {
    pub fn new(chat_id: i64, thread_id: Option<i64>) -> Self {
        let thread_id = match thread_id {
            Some(0) => None,
            other => other,
        };
        Self { chat_id, thread_id }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread_id {
            Some(thread) => write!(f, "chat {} thread {}", self.chat_id, thread),
            None => write!(f, "chat {}", self.chat_id),
        }
    }
}

/// Match criteria shared by routing and escalation rules.
///
/// A criteria set matches when ANY criterion hits: a keyword is a
/// case-insensitive substring of a ticket name, or a ticket's mapped
/// attribute value appears in the corresponding id list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchCriteria {
    pub keywords: Vec<String>,
    pub service_ids: Vec<i64>,
    pub customer_ids: Vec<i64>,
    pub creator_ids: Vec<i64>,
    pub creator_company_ids: Vec<i64>,
}

impl MatchCriteria {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
            && self.service_ids.is_empty()
            && self.customer_ids.is_empty()
            && self.creator_ids.is_empty()
            && self.creator_company_ids.is_empty()
    }

    /// Lowercase keywords and drop blank ones. Call once at parse time so
    /// matching never has to normalize per cycle.
    pub fn normalized(mut self) -> Self {
        self.keywords = self
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        self
    }
}

/// One routing rule: criteria plus the destination that gets notified.
///
/// Rules with empty criteria never reach here; config drops them at parse
/// time so a half-filled rule cannot spam its destination with everything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingRule {
    pub dest: Destination,
    pub criteria: MatchCriteria,
}

/// Evaluation of one rule against a ticket batch, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RuleExplanation {
    /// 1-based position in the configured rule list.
    pub rule_index: usize,
    pub dest: Destination,
    pub matched: bool,
    pub reason: Option<String>,
    pub criteria: MatchCriteria,
}

fn ids_match(rule_ids: &[i64], tickets: &[Ticket], field: &str) -> Option<i64> {
    if rule_ids.is_empty() || field.is_empty() {
        return None;
    }
    rule_ids
        .iter()
        .copied()
        .find(|id| tickets.iter().any(|t| t.attr(field) == Some(*id)))
}

/// First reason `criteria` matches anything in the batch, if it does.
///
/// Empty criteria match nothing here. Keyword checks run before id checks;
/// within each, rule order decides which reason is reported.
pub fn batch_match_reason(
    criteria: &MatchCriteria,
    tickets: &[Ticket],
    fields: &FieldNames,
) -> Option<String> {
    if !criteria.keywords.is_empty() {
        for ticket in tickets {
            let name = ticket.name.to_lowercase();
            for keyword in &criteria.keywords {
                if name.contains(keyword.as_str()) {
                    return Some(format!("keyword '{keyword}' in name"));
                }
            }
        }
    }
    if let Some(id) = ids_match(&criteria.service_ids, tickets, &fields.service_id) {
        return Some(format!("service_id {id} matched"));
    }
    if let Some(id) = ids_match(&criteria.customer_ids, tickets, &fields.customer_id) {
        return Some(format!("customer_id {id} matched"));
    }
    if let Some(id) = ids_match(&criteria.creator_ids, tickets, &fields.creator_id) {
        return Some(format!("creator_id {id} matched"));
    }
    if let Some(id) = ids_match(
        &criteria.creator_company_ids,
        tickets,
        &fields.creator_company_id,
    ) {
        return Some(format!("creator_company_id {id} matched"));
    }
    None
}

/// Per-ticket criteria check, used by escalation filters.
///
/// Same OR semantics as [`batch_match_reason`] but scoped to one ticket.
/// Empty criteria match nothing; escalation treats an empty filter as
/// match-all before calling this.
pub fn ticket_matches(criteria: &MatchCriteria, ticket: &Ticket, fields: &FieldNames) -> bool {
    if !criteria.keywords.is_empty() {
        let name = ticket.name.to_lowercase();
        if criteria.keywords.iter().any(|k| name.contains(k.as_str())) {
            return true;
        }
    }
    let id_sets: [(&[i64], &str); 4] = [
        (&criteria.service_ids, &fields.service_id),
        (&criteria.customer_ids, &fields.customer_id),
        (&criteria.creator_ids, &fields.creator_id),
        (&criteria.creator_company_ids, &fields.creator_company_id),
    ];
    for (ids, field) in id_sets {
        if ids.is_empty() || field.is_empty() {
            continue;
        }
        if let Some(value) = ticket.attr(field) {
            if ids.contains(&value) {
                return true;
            }
        }
    }
    false
}

/// Destinations that must receive the main queue notification.
///
/// Every rule matching any ticket in the batch contributes its destination;
/// duplicates collapse and the result is sorted, so the same queue state
/// always produces the same fan-out. When nothing matches the default
/// destination is used, if configured. An empty result means no destination
/// exists for this queue state; callers surface that, it is not "done".
pub fn pick_destinations(
    tickets: &[Ticket],
    rules: &[RoutingRule],
    default_dest: Option<Destination>,
    fields: &FieldNames,
) -> Vec<Destination> {
    let mut matched: BTreeSet<Destination> = BTreeSet::new();
    if !tickets.is_empty() {
        for rule in rules {
            if batch_match_reason(&rule.criteria, tickets, fields).is_some() {
                matched.insert(rule.dest);
            }
        }
    }
    if !matched.is_empty() {
        return matched.into_iter().collect();
    }
    match default_dest {
        Some(dest) => vec![dest],
        None => Vec::new(),
    }
}

/// Evaluate every rule independently against the batch and report what
/// matched and why. Read-only; intended for operators chasing "why did
/// this land in that chat".
pub fn explain(
    tickets: &[Ticket],
    rules: &[RoutingRule],
    fields: &FieldNames,
) -> Vec<RuleExplanation> {
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let reason = batch_match_reason(&rule.criteria, tickets, fields);
            RuleExplanation {
                rule_index: i + 1,
                dest: rule.dest,
                matched: reason.is_some(),
                reason,
                criteria: rule.criteria.clone(),
            }
        })
        .collect()
}
