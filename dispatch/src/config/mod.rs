//! Runtime configuration: parsing, validation, atomic hot reload.
//!
//! A config document arrives as raw JSON from a [`ConfigSource`], is parsed
//! into typed structs as a whole, and either replaces the active
//! [`RuntimeConfig`] completely or changes nothing. There is no state in
//! which half of a document has been applied.

pub mod bootstrap;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::escalation::{EscalationBatch, EscalationEngine, EscalationRule};
use crate::router::{Destination, MatchCriteria, RoutingRule};
use crate::store::SharedResilientStore;
use crate::ticket::{FieldNames, Ticket};

/// Mention appended to escalation messages when nothing overrides it.
pub const DEFAULT_MENTION: &str = "@duty_engineer";
/// Default unattended-age threshold in seconds.
pub const DEFAULT_AFTER_S: i64 = 600;

/// Reasons a config document is rejected as a whole.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Structure or field types do not match the schema. Covers missing or
    /// non-integer versions, non-integer chat ids, and malformed sections.
    #[error("config document rejected: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where config documents come from. The source owns transport, caching and
/// TTLs; `force` asks it to bypass any internal cache.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self, force: bool) -> anyhow::Result<serde_json::Value>;
}

/// Wire shape of a config document.
///
/// Field types are strict on purpose: a document with a version of `"7"` or
/// a chat id of `"abc"` fails to parse and the previous config stays active.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigDocument {
    pub version: i64,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub escalation: EscalationSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub rules: Vec<RoutingRuleDoc>,
    pub default_dest: Option<DestinationDoc>,
    pub service_id_field: Option<String>,
    pub customer_id_field: Option<String>,
    pub creator_id_field: Option<String>,
    pub creator_company_id_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationDoc {
    pub chat_id: i64,
    #[serde(default)]
    pub thread_id: Option<i64>,
}

impl DestinationDoc {
    fn into_destination(self) -> Destination {
        Destination::new(self.chat_id, self.thread_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRuleDoc {
    pub dest: DestinationDoc,
    #[serde(flatten)]
    pub criteria: MatchCriteria,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscalationSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_after_s")]
    pub after_s: i64,
    #[serde(default)]
    pub dest: Option<DestinationDoc>,
    #[serde(default = "default_mention")]
    pub mention: String,
    /// Per-rule list. When absent entirely, `filter` plus the section-level
    /// destination form one implicit rule.
    #[serde(default)]
    pub rules: Option<Vec<EscalationRuleDoc>>,
    #[serde(default)]
    pub filter: Option<MatchCriteria>,
    pub service_id_field: Option<String>,
    pub customer_id_field: Option<String>,
    pub creator_id_field: Option<String>,
    pub creator_company_id_field: Option<String>,
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            after_s: default_after_s(),
            dest: None,
            mention: default_mention(),
            rules: None,
            filter: None,
            service_id_field: None,
            customer_id_field: None,
            creator_id_field: None,
            creator_company_id_field: None,
        }
    }
}

fn default_after_s() -> i64 {
    DEFAULT_AFTER_S
}

fn default_mention() -> String {
    DEFAULT_MENTION.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscalationRuleDoc {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub dest: Option<DestinationDoc>,
    #[serde(default)]
    pub mention: Option<String>,
    #[serde(default)]
    pub after_s: Option<i64>,
    /// Explicit filter object. Takes precedence over criteria written
    /// inline at the rule level.
    #[serde(default)]
    pub filter: Option<MatchCriteria>,
    #[serde(flatten)]
    pub inline: MatchCriteria,
}

fn default_enabled() -> bool {
    true
}

/// The active configuration snapshot. Replaced wholesale on reload, never
/// mutated in place; cycle code clones the `Arc` once and reads a frozen
/// view for the whole cycle.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub version: i64,
    pub source: String,
    pub routing_rules: Vec<RoutingRule>,
    pub default_dest: Option<Destination>,
    pub routing_fields: FieldNames,
    pub escalation_enabled: bool,
    pub escalation_rules: Vec<EscalationRule>,
    pub escalation_fields: FieldNames,
    pub default_mention: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: 0,
            source: "default".to_string(),
            routing_rules: Vec::new(),
            default_dest: None,
            routing_fields: FieldNames::default(),
            escalation_enabled: false,
            escalation_rules: Vec::new(),
            escalation_fields: FieldNames::default(),
            default_mention: DEFAULT_MENTION.to_string(),
        }
    }
}

fn field_or(value: Option<String>, fallback: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn clean_mention(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl RuntimeConfig {
    /// Build the runtime view from a parsed document.
    ///
    /// Structure was already validated by serde; the per-rule guards left
    /// here drop rules that parse but cannot do anything useful, with a log
    /// line each so a typo does not vanish silently.
    pub fn from_document(doc: ConfigDocument) -> Self {
        let routing_fields = FieldNames {
            service_id: field_or(doc.routing.service_id_field, "ServiceId"),
            customer_id: field_or(doc.routing.customer_id_field, "CustomerId"),
            creator_id: field_or(doc.routing.creator_id_field, "CreatorId"),
            creator_company_id: field_or(doc.routing.creator_company_id_field, "CreatorCompanyId"),
        };

        let mut routing_rules = Vec::new();
        for (idx, rule) in doc.routing.rules.into_iter().enumerate() {
            let criteria = rule.criteria.normalized();
            if criteria.is_empty() {
                warn!(rule = idx + 1, "routing rule has no criteria, dropped");
                continue;
            }
            routing_rules.push(RoutingRule {
                dest: rule.dest.into_destination(),
                criteria,
            });
        }

        let esc = doc.escalation;
        let escalation_fields = FieldNames {
            service_id: field_or(esc.service_id_field, &routing_fields.service_id),
            customer_id: field_or(esc.customer_id_field, &routing_fields.customer_id),
            creator_id: field_or(esc.creator_id_field, &routing_fields.creator_id),
            creator_company_id: field_or(
                esc.creator_company_id_field,
                &routing_fields.creator_company_id,
            ),
        };
        let default_mention = clean_mention(&esc.mention).unwrap_or_else(default_mention);
        let base_dest = esc.dest.map(DestinationDoc::into_destination);
        let base_after_s = esc.after_s.max(0);

        let escalation_rules = match esc.rules {
            Some(raw_rules) => parse_escalation_rules(raw_rules, base_dest, base_after_s),
            // No rule list at all: the section-level filter and destination
            // form one implicit rule.
            None => match base_dest {
                Some(dest) => vec![EscalationRule {
                    dest,
                    after_s: base_after_s,
                    mention: None,
                    criteria: esc.filter.unwrap_or_default().normalized(),
                }],
                None => {
                    if esc.enabled {
                        warn!("escalation enabled but no destination configured");
                    }
                    Vec::new()
                }
            },
        };

        Self {
            version: doc.version,
            source: doc.source.unwrap_or_else(|| "web".to_string()),
            routing_rules,
            default_dest: doc.routing.default_dest.map(DestinationDoc::into_destination),
            routing_fields,
            escalation_enabled: esc.enabled,
            escalation_rules,
            escalation_fields,
            default_mention,
        }
    }
}

fn parse_escalation_rules(
    raw_rules: Vec<EscalationRuleDoc>,
    base_dest: Option<Destination>,
    base_after_s: i64,
) -> Vec<EscalationRule> {
    let mut rules = Vec::new();
    for (idx, item) in raw_rules.into_iter().enumerate() {
        if !item.enabled {
            continue;
        }
        let dest = match item.dest.map(DestinationDoc::into_destination).or(base_dest) {
            Some(dest) => dest,
            None => {
                warn!(rule = idx + 1, "escalation rule has no destination, skipped");
                continue;
            }
        };
        let criteria = item.filter.unwrap_or(item.inline).normalized();
        rules.push(EscalationRule {
            dest,
            after_s: item.after_s.unwrap_or(base_after_s).max(0),
            mention: item.mention.as_deref().and_then(clean_mention),
            criteria,
        });
    }
    rules
}

/// Owns the active config and the escalation engine it parameterizes.
///
/// Single-writer: the poll loop is the only caller of `apply` and
/// `refresh`, so no locking is needed around the swap.
pub struct ConfigManager {
    store: SharedResilientStore,
    escalation_store_key: String,
    active: Arc<RuntimeConfig>,
    engine: Option<EscalationEngine>,
}

impl ConfigManager {
    /// Start from a bootstrap config, usually environment values at
    /// version 0 so any fetched document supersedes them.
    pub fn new(
        initial: RuntimeConfig,
        store: SharedResilientStore,
        escalation_store_key: impl Into<String>,
    ) -> Self {
        let mut manager = Self {
            store,
            escalation_store_key: escalation_store_key.into(),
            active: Arc::new(initial),
            engine: None,
        };
        manager.rebuild_engine();
        manager
    }

    /// Snapshot of the active config. Cheap to clone, frozen forever.
    pub fn active(&self) -> Arc<RuntimeConfig> {
        Arc::clone(&self.active)
    }

    pub fn version(&self) -> i64 {
        self.active.version
    }

    pub fn engine(&self) -> Option<&EscalationEngine> {
        self.engine.as_ref()
    }

    /// Apply a raw config document.
    ///
    /// `Ok(true)`: applied and the escalation engine rebuilt. `Ok(false)`:
    /// version not newer than the active one, nothing changed. `Err`: the
    /// document is invalid, nothing changed.
    pub fn apply(&mut self, document: serde_json::Value) -> Result<bool, ConfigError> {
        let doc: ConfigDocument = serde_json::from_value(document)?;
        if doc.version <= self.active.version {
            debug!(
                version = doc.version,
                active = self.active.version,
                "config version not newer, ignored"
            );
            return Ok(false);
        }
        let previous = self.active.version;
        let next = RuntimeConfig::from_document(doc);
        info!(
            from = previous,
            to = next.version,
            source = %next.source,
            routing_rules = next.routing_rules.len(),
            escalation_rules = next.escalation_rules.len(),
            escalation_enabled = next.escalation_enabled,
            "config updated"
        );
        self.active = Arc::new(next);
        self.rebuild_engine();
        Ok(true)
    }

    /// Pull the latest document from the source and apply it.
    ///
    /// Fetch and validation failures keep the last-good config; polling
    /// must not stop because the config service is down. Returns whether a
    /// new config was applied.
    pub async fn refresh(&mut self, source: &dyn ConfigSource, force: bool) -> bool {
        let document = match source.fetch(force).await {
            Ok(document) => document,
            Err(e) => {
                warn!(error = %e, "config fetch failed, keeping current config");
                return false;
            }
        };
        match self.apply(document) {
            Ok(applied) => applied,
            Err(e) => {
                warn!(error = %e, "config rejected, keeping current config");
                false
            }
        }
    }

    /// Run the escalation pass for this cycle's tickets. No-op while
    /// escalation is disabled.
    pub fn escalations(&mut self, tickets: &[Ticket], now: f64) -> Vec<EscalationBatch> {
        match self.engine.as_mut() {
            Some(engine) => engine.process(tickets, now),
            None => Vec::new(),
        }
    }

    /// The engine exists whenever escalation is enabled, even with zero
    /// rules: first-seen tracking keeps running so adding a rule later
    /// escalates on true ticket age, not on rule age. The store key never
    /// changes across rebuilds.
    fn rebuild_engine(&mut self) {
        if !self.active.escalation_enabled {
            self.engine = None;
            return;
        }
        self.engine = Some(EscalationEngine::new(
            self.active.escalation_rules.clone(),
            self.active.escalation_fields.clone(),
            self.active.default_mention.clone(),
            Arc::clone(&self.store),
            self.escalation_store_key.clone(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ResilientStore};
    use serde_json::json;

    fn manager() -> ConfigManager {
        let store = ResilientStore::new(Arc::new(MemoryStore::new())).shared();
        ConfigManager::new(RuntimeConfig::default(), store, "escalation_state")
    }

    #[test]
    fn test_apply_full_document() {
        let mut mgr = manager();

        let applied = mgr
            .apply(json!({
                "version": 1,
                "routing": {
                    "rules": [
                        {"dest": {"chat_id": -100}, "service_ids": [5]},
                        {"dest": {"chat_id": -200, "thread_id": 7}, "keywords": ["VPN"]},
                    ],
                    "default_dest": {"chat_id": -1},
                },
                "escalation": {
                    "enabled": true,
                    "after_s": 300,
                    "dest": {"chat_id": -300},
                },
            }))
            .expect("valid document");

        assert!(applied);
        let active = mgr.active();
        assert_eq!(active.version, 1);
        assert_eq!(active.routing_rules.len(), 2);
        assert_eq!(active.routing_rules[1].criteria.keywords, vec!["vpn"]);
        assert_eq!(active.default_dest, Some(Destination::new(-1, None)));
        assert!(active.escalation_enabled);
        assert_eq!(active.escalation_rules.len(), 1);
        assert_eq!(active.escalation_rules[0].after_s, 300);
        assert!(mgr.engine().is_some());
    }

    #[test]
    fn test_stale_version_ignored() {
        let mut mgr = manager();
        mgr.apply(json!({"version": 2})).expect("apply v2");

        assert_eq!(mgr.apply(json!({"version": 2})).expect("stale ok"), false);
        assert_eq!(mgr.apply(json!({"version": 1})).expect("older ok"), false);
        assert_eq!(mgr.version(), 2);
    }

    #[test]
    fn test_non_integer_version_rejected() {
        let mut mgr = manager();

        assert!(mgr.apply(json!({"version": "7"})).is_err());
        assert!(mgr.apply(json!({"routing": {}})).is_err());
        assert_eq!(mgr.version(), 0);
    }

    #[test]
    fn test_invalid_chat_id_rejects_whole_document() {
        let mut mgr = manager();
        mgr.apply(json!({
            "version": 1,
            "routing": {"rules": [{"dest": {"chat_id": -5}, "keywords": ["a"]}]},
        }))
        .expect("baseline");

        let result = mgr.apply(json!({
            "version": 2,
            "routing": {"rules": [{"dest": {"chat_id": "abc"}, "keywords": ["b"]}]},
        }));

        assert!(result.is_err());
        let active = mgr.active();
        assert_eq!(active.version, 1);
        assert_eq!(active.routing_rules[0].criteria.keywords, vec!["a"]);
    }

    #[test]
    fn test_empty_criteria_rule_dropped() {
        let mut mgr = manager();
        mgr.apply(json!({
            "version": 1,
            "routing": {"rules": [
                {"dest": {"chat_id": -5}},
                {"dest": {"chat_id": -6}, "keywords": ["ok"]},
            ]},
        }))
        .expect("apply");

        let active = mgr.active();
        assert_eq!(active.routing_rules.len(), 1);
        assert_eq!(active.routing_rules[0].dest, Destination::new(-6, None));
    }

    #[test]
    fn test_escalation_rule_list() {
        let mut mgr = manager();
        mgr.apply(json!({
            "version": 1,
            "escalation": {
                "enabled": true,
                "dest": {"chat_id": -300},
                "after_s": 900,
                "rules": [
                    {"service_ids": [5], "after_s": 60, "mention": "@oncall"},
                    {"dest": {"chat_id": -400}, "keywords": ["outage"]},
                    {"enabled": false, "keywords": ["ignored"]},
                    {"dest": null, "keywords": ["no dest"], "after_s": 1},
                ],
            },
        }))
        .expect("apply");

        let rules = &mgr.active().escalation_rules;
        // Disabled rule skipped; the "no dest" one inherits the section dest.
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].dest, Destination::new(-300, None));
        assert_eq!(rules[0].after_s, 60);
        assert_eq!(rules[0].mention.as_deref(), Some("@oncall"));
        assert_eq!(rules[1].dest, Destination::new(-400, None));
        assert_eq!(rules[1].after_s, 900);
        assert!(rules[1].mention.is_none());
    }

    #[test]
    fn test_escalation_rule_without_any_destination_skipped() {
        let mut mgr = manager();
        mgr.apply(json!({
            "version": 1,
            "escalation": {
                "enabled": true,
                "rules": [{"keywords": ["orphan"]}],
            },
        }))
        .expect("apply");

        assert!(mgr.active().escalation_rules.is_empty());
        // Enabled with zero rules still builds the engine for age tracking.
        assert!(mgr.engine().is_some());
    }

    #[test]
    fn test_filter_object_beats_inline_criteria() {
        let mut mgr = manager();
        mgr.apply(json!({
            "version": 1,
            "escalation": {
                "enabled": true,
                "dest": {"chat_id": -1},
                "rules": [{
                    "filter": {"service_ids": [9]},
                    "service_ids": [1, 2, 3],
                }],
            },
        }))
        .expect("apply");

        assert_eq!(mgr.active().escalation_rules[0].criteria.service_ids, vec![9]);
    }

    #[test]
    fn test_single_filter_fallback_without_rules_key() {
        let mut mgr = manager();
        mgr.apply(json!({
            "version": 1,
            "escalation": {
                "enabled": true,
                "dest": {"chat_id": -300, "thread_id": 4},
                "filter": {"keywords": ["Backup"]},
            },
        }))
        .expect("apply");

        let rules = &mgr.active().escalation_rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].dest, Destination::new(-300, Some(4)));
        assert_eq!(rules[0].criteria.keywords, vec!["backup"]);

        // An explicitly empty rule list is not the same thing: no implicit
        // rule is synthesized.
        let mut mgr2 = manager();
        mgr2.apply(json!({
            "version": 1,
            "escalation": {"enabled": true, "dest": {"chat_id": -300}, "rules": []},
        }))
        .expect("apply");
        assert!(mgr2.active().escalation_rules.is_empty());
    }

    #[test]
    fn test_field_name_overrides_and_fallback() {
        let mut mgr = manager();
        mgr.apply(json!({
            "version": 1,
            "routing": {"service_id_field": "svc"},
            "escalation": {"enabled": true, "dest": {"chat_id": -1}, "customer_id_field": "cust"},
        }))
        .expect("apply");

        let active = mgr.active();
        assert_eq!(active.routing_fields.service_id, "svc");
        assert_eq!(active.escalation_fields.service_id, "svc");
        assert_eq!(active.escalation_fields.customer_id, "cust");
        assert_eq!(active.routing_fields.customer_id, "CustomerId");
    }

    #[test]
    fn test_disabling_escalation_drops_engine() {
        let mut mgr = manager();
        mgr.apply(json!({
            "version": 1,
            "escalation": {"enabled": true, "dest": {"chat_id": -1}},
        }))
        .expect("apply");
        assert!(mgr.engine().is_some());

        mgr.apply(json!({"version": 2, "escalation": {"enabled": false}}))
            .expect("apply");
        assert!(mgr.engine().is_none());
        assert!(mgr.escalations(&[Ticket::new(1, "x")], 10.0).is_empty());
    }

    #[test]
    fn test_blank_mention_falls_back_to_default() {
        let mut mgr = manager();
        mgr.apply(json!({
            "version": 1,
            "escalation": {"enabled": true, "dest": {"chat_id": -1}, "mention": "   "},
        }))
        .expect("apply");

        assert_eq!(mgr.active().default_mention, DEFAULT_MENTION);
    }
}
