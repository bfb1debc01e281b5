//! Tickets polled from the external queue, and the source they come from.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One open item from the external ticket queue.
///
/// Tickets are transient: they live for the duration of a poll cycle and are
/// never persisted. Besides the id and display name, a ticket carries a map
/// of numeric attributes whose names are deployment-specific; the active
/// [`FieldNames`] says which of them the matching engines read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub attrs: HashMap<String, i64>,
}

impl Ticket {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            attrs: HashMap::new(),
        }
    }

    /// Builder-style attribute setter, mostly for wiring and tests.
    pub fn with_attr(mut self, field: impl Into<String>, value: i64) -> Self {
        self.attrs.insert(field.into(), value);
        self
    }

    /// Look up a named attribute. Absent fields are `None`, never an error.
    pub fn attr(&self, field: &str) -> Option<i64> {
        self.attrs.get(field).copied()
    }
}

/// Names of the ticket attributes the matching engines read.
///
/// The external queue decides what these fields are called; config can
/// override each one per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNames {
    pub service_id: String,
    pub customer_id: String,
    pub creator_id: String,
    pub creator_company_id: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            service_id: "ServiceId".to_string(),
            customer_id: "CustomerId".to_string(),
            creator_id: "CreatorId".to_string(),
            creator_company_id: "CreatorCompanyId".to_string(),
        }
    }
}

/// Source of currently-open tickets.
///
/// Implementations own their protocol, pagination and timeouts. `fetch` is a
/// snapshot read of the open set, capped at `limit` items; it must not block
/// longer than one poll interval.
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn fetch(&self, limit: usize) -> anyhow::Result<Vec<Ticket>>;
}
