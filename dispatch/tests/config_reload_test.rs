//! Integration tests for config hot reload
//!
//! Covers version gating, whole-document atomicity across sections, and
//! how reloads interact with the escalation engine's persisted state.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use dispatch::{
    ConfigManager, ConfigSource, Destination, MemoryStore, ResilientStore, RuntimeConfig,
    SharedResilientStore, Ticket,
};

struct SettableConfig {
    doc: Mutex<Value>,
}

#[async_trait]
impl ConfigSource for SettableConfig {
    async fn fetch(&self, _force: bool) -> anyhow::Result<Value> {
        Ok(self.doc.lock().expect("config lock").clone())
    }
}

struct FailingConfig;

#[async_trait]
impl ConfigSource for FailingConfig {
    async fn fetch(&self, _force: bool) -> anyhow::Result<Value> {
        anyhow::bail!("config service unreachable")
    }
}

fn memory_store() -> SharedResilientStore {
    ResilientStore::new(Arc::new(MemoryStore::new())).shared()
}

fn manager(store: SharedResilientStore) -> ConfigManager {
    ConfigManager::new(RuntimeConfig::default(), store, "escalation_state")
}

/// Test: refresh applies a newer document once and then reports stale
#[tokio::test]
async fn test_refresh_applies_then_reports_stale() {
    let mut mgr = manager(memory_store());
    let source = SettableConfig {
        doc: Mutex::new(json!({
            "version": 1,
            "routing": {"default_dest": {"chat_id": -100}},
        })),
    };

    assert!(mgr.refresh(&source, false).await);
    assert_eq!(mgr.version(), 1);
    assert_eq!(
        mgr.active().default_dest,
        Some(Destination::new(-100, None))
    );

    assert!(!mgr.refresh(&source, false).await, "same version is stale");
    assert_eq!(mgr.version(), 1);
}

/// Test: a fetch failure keeps the last-good config
#[tokio::test]
async fn test_fetch_failure_keeps_last_good_config() {
    let mut mgr = manager(memory_store());
    mgr.apply(json!({
        "version": 3,
        "routing": {"default_dest": {"chat_id": -5}},
    }))
    .expect("baseline");

    assert!(!mgr.refresh(&FailingConfig, false).await);

    assert_eq!(mgr.version(), 3);
    assert_eq!(mgr.active().default_dest, Some(Destination::new(-5, None)));
}

/// Test: one malformed section rejects the whole document, other sections
/// included
#[tokio::test]
async fn test_malformed_section_rejects_whole_document() {
    let mut mgr = manager(memory_store());
    mgr.apply(json!({
        "version": 1,
        "routing": {"rules": [{"dest": {"chat_id": -1}, "keywords": ["old"]}]},
    }))
    .expect("baseline");

    let result = mgr.apply(json!({
        "version": 2,
        "routing": {"rules": [{"dest": {"chat_id": -2}, "keywords": ["new"]}]},
        "escalation": {"enabled": true, "after_s": "soon"},
    }));

    assert!(result.is_err(), "non-integer after_s must reject everything");
    let active = mgr.active();
    assert_eq!(active.version, 1);
    assert_eq!(active.routing_rules[0].criteria.keywords, vec!["old"]);
    assert_eq!(active.routing_rules[0].dest, Destination::new(-1, None));
}

/// Test: editing a rule re-arms it for tickets it already escalated
#[tokio::test]
async fn test_editing_rule_rearms_it() {
    let mut mgr = manager(memory_store());
    mgr.apply(json!({
        "version": 1,
        "escalation": {
            "enabled": true,
            "dest": {"chat_id": -300},
            "rules": [{"after_s": 0, "mention": "@first"}],
        },
    }))
    .expect("v1");
    let tickets = vec![Ticket::new(1, "stuck")];

    let batches = mgr.escalations(&tickets, 10.0);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].mention, "@first");

    assert!(mgr.escalations(&tickets, 20.0).is_empty(), "marked once");

    // Same rule with a different mention is a different rule identity.
    mgr.apply(json!({
        "version": 2,
        "escalation": {
            "enabled": true,
            "dest": {"chat_id": -300},
            "rules": [{"after_s": 0, "mention": "@second"}],
        },
    }))
    .expect("v2");

    let batches = mgr.escalations(&tickets, 30.0);
    assert_eq!(batches.len(), 1, "edited rule fires again");
    assert_eq!(batches[0].mention, "@second");
}

/// Test: editing one rule leaves the other rules' escalated marks alone
#[tokio::test]
async fn test_editing_one_rule_preserves_other_marks() {
    let mut mgr = manager(memory_store());
    let rules_v1 = json!({
        "version": 1,
        "escalation": {
            "enabled": true,
            "dest": {"chat_id": -300},
            "rules": [
                {"after_s": 0, "service_ids": [5]},
                {"after_s": 0, "service_ids": [6], "mention": "@old"},
            ],
        },
    });
    mgr.apply(rules_v1).expect("v1");
    let tickets = vec![
        Ticket::new(1, "a").with_attr("ServiceId", 5),
        Ticket::new(2, "b").with_attr("ServiceId", 6),
    ];

    let first = mgr.escalations(&tickets, 10.0);
    let total: usize = first.iter().map(|b| b.tickets.len()).sum();
    assert_eq!(total, 2, "both rules fire initially");

    // Only the second rule changes.
    mgr.apply(json!({
        "version": 2,
        "escalation": {
            "enabled": true,
            "dest": {"chat_id": -300},
            "rules": [
                {"after_s": 0, "service_ids": [5]},
                {"after_s": 0, "service_ids": [6], "mention": "@new"},
            ],
        },
    }))
    .expect("v2");

    let second = mgr.escalations(&tickets, 20.0);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].mention, "@new");
    assert_eq!(second[0].tickets.len(), 1, "untouched rule stays marked");
    assert_eq!(second[0].tickets[0].id, 2);
}

/// Test: a reload keeps first-seen clocks, so thresholds measure true age
#[tokio::test]
async fn test_reload_preserves_age_clock() {
    let mut mgr = manager(memory_store());
    mgr.apply(json!({
        "version": 1,
        "escalation": {"enabled": true, "dest": {"chat_id": -1}, "after_s": 600},
    }))
    .expect("v1");
    let tickets = vec![Ticket::new(9, "aging")];

    assert!(mgr.escalations(&tickets, 0.0).is_empty(), "too young");

    // Threshold lowered at t=400; the ticket is already 400s old.
    mgr.apply(json!({
        "version": 2,
        "escalation": {"enabled": true, "dest": {"chat_id": -1}, "after_s": 300},
    }))
    .expect("v2");

    let batches = mgr.escalations(&tickets, 400.0);
    assert_eq!(batches.len(), 1, "age counts from the original sighting");
}

/// Test: disabling escalation stops processing but keeps persisted marks
#[tokio::test]
async fn test_disable_enable_keeps_marks() {
    let store = memory_store();
    let mut mgr = manager(Arc::clone(&store));
    let enabled = json!({
        "version": 1,
        "escalation": {"enabled": true, "dest": {"chat_id": -1}, "after_s": 0},
    });
    mgr.apply(enabled).expect("v1");
    let tickets = vec![Ticket::new(4, "flappy")];

    assert_eq!(mgr.escalations(&tickets, 10.0).len(), 1);

    mgr.apply(json!({"version": 2, "escalation": {"enabled": false}}))
        .expect("v2");
    assert!(mgr.engine().is_none());
    assert!(mgr.escalations(&tickets, 20.0).is_empty());

    // Re-enabled with the identical rule: the old mark still holds.
    mgr.apply(json!({
        "version": 3,
        "escalation": {"enabled": true, "dest": {"chat_id": -1}, "after_s": 0},
    }))
    .expect("v3");
    assert!(mgr.escalations(&tickets, 30.0).is_empty(), "mark survived the round trip");
}

/// Test: version 0 documents never replace the bootstrap config
#[tokio::test]
async fn test_version_zero_never_applies() {
    let mut mgr = manager(memory_store());

    let applied = mgr
        .apply(json!({"version": 0, "routing": {"default_dest": {"chat_id": -9}}}))
        .expect("parse ok");

    assert!(!applied);
    assert!(mgr.active().default_dest.is_none());
}
