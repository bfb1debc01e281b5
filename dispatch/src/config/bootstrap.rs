//! Bootstrap configuration from environment variables.
//!
//! The loop needs a usable config before the first successful fetch from
//! the config source. These values load at version 0, so any fetched
//! document with a version of 1 or higher supersedes them.
//!
//! Malformed values never abort startup; they are logged and skipped so a
//! typo in one variable cannot take the watcher down.

use serde::de::DeserializeOwned;
use tracing::warn;

use super::{
    ConfigDocument, DestinationDoc, EscalationSection, RoutingSection, RuntimeConfig,
    DEFAULT_AFTER_S, DEFAULT_MENTION,
};

/// Build the bootstrap config from the process environment.
pub fn from_env() -> RuntimeConfig {
    RuntimeConfig::from_document(document_from(|name| std::env::var(name).ok()))
}

/// Assemble a version-0 document from a variable lookup. Split from
/// [`from_env`] so tests can feed variables without touching process state.
fn document_from(lookup: impl Fn(&str) -> Option<String>) -> ConfigDocument {
    let vars = EnvReader { lookup };

    let routing = RoutingSection {
        rules: vars.json("ROUTES_RULES").unwrap_or_default(),
        default_dest: vars
            .dest("ROUTES_DEFAULT_CHAT_ID", "ROUTES_DEFAULT_THREAD_ID")
            .or_else(|| vars.dest("ALERT_CHAT_ID", "ALERT_THREAD_ID")),
        service_id_field: vars.str("ROUTES_SERVICE_ID_FIELD"),
        customer_id_field: vars.str("ROUTES_CUSTOMER_ID_FIELD"),
        creator_id_field: vars.str("ROUTES_CREATOR_ID_FIELD"),
        creator_company_id_field: vars.str("ROUTES_CREATOR_COMPANY_ID_FIELD"),
    };

    let escalation = EscalationSection {
        enabled: vars.flag("ESCALATION_ENABLED"),
        after_s: vars.i64("ESCALATION_AFTER_S").unwrap_or(DEFAULT_AFTER_S),
        dest: vars.dest("ESCALATION_DEST_CHAT_ID", "ESCALATION_DEST_THREAD_ID"),
        mention: vars
            .str("ESCALATION_MENTION")
            .unwrap_or_else(|| DEFAULT_MENTION.to_string()),
        rules: vars.json("ESCALATION_RULES"),
        filter: vars.json("ESCALATION_FILTER"),
        service_id_field: vars.str("ESCALATION_SERVICE_ID_FIELD"),
        customer_id_field: vars.str("ESCALATION_CUSTOMER_ID_FIELD"),
        creator_id_field: vars.str("ESCALATION_CREATOR_ID_FIELD"),
        creator_company_id_field: vars.str("ESCALATION_CREATOR_COMPANY_ID_FIELD"),
    };

    ConfigDocument {
        version: 0,
        source: Some("env".to_string()),
        routing,
        escalation,
    }
}

struct EnvReader<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn str(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn i64(&self, name: &str) -> Option<i64> {
        let raw = self.str(name)?;
        match raw.parse::<i64>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(var = name, value = %raw, "ignoring non-integer environment value");
                None
            }
        }
    }

    fn flag(&self, name: &str) -> bool {
        matches!(
            self.str(name).map(|v| v.to_lowercase()).as_deref(),
            Some("1" | "true" | "yes")
        )
    }

    fn json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let raw = self.str(name)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(var = name, error = %e, "ignoring malformed JSON environment value");
                None
            }
        }
    }

    fn dest(&self, chat_var: &str, thread_var: &str) -> Option<DestinationDoc> {
        let chat_id = self.i64(chat_var)?;
        Some(DestinationDoc {
            chat_id,
            thread_id: self.i64(thread_var),
        })
    }
}
