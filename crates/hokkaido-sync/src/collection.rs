//! Catalogue of the collections the dashboard reads and writes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A known remote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    ProductionEntries,
    ProductionOrders,
    Planning,
    ActiveDowntimes,
    DowntimeEntries,
    ExtendedDowntimeLogs,
    QuantityAdjustments,
    ReworkEntries,
    TriageEntries,
    SystemLogs,
}

/// Error returned when parsing an unknown collection name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown collection: {0}")]
pub struct UnknownCollection(pub String);

impl Collection {
    pub const ALL: [Collection; 10] = [
        Collection::ProductionEntries,
        Collection::ProductionOrders,
        Collection::Planning,
        Collection::ActiveDowntimes,
        Collection::DowntimeEntries,
        Collection::ExtendedDowntimeLogs,
        Collection::QuantityAdjustments,
        Collection::ReworkEntries,
        Collection::TriageEntries,
        Collection::SystemLogs,
    ];

    /// Wire name in the remote store.
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::ProductionEntries => "production_entries",
            Collection::ProductionOrders => "production_orders",
            Collection::Planning => "planning",
            Collection::ActiveDowntimes => "active_downtimes",
            Collection::DowntimeEntries => "downtime_entries",
            Collection::ExtendedDowntimeLogs => "extended_downtime_logs",
            Collection::QuantityAdjustments => "quantity_adjustments",
            Collection::ReworkEntries => "rework_entries",
            Collection::TriageEntries => "triage_entries",
            Collection::SystemLogs => "system_logs",
        }
    }

    /// Repository TTL for this collection.
    ///
    /// Machine status changes fastest; planning and orders move slowly;
    /// logs are append-only and rarely read.
    pub fn default_ttl(self) -> Duration {
        match self {
            Collection::ActiveDowntimes => Duration::from_secs(30),
            Collection::ProductionEntries
            | Collection::DowntimeEntries
            | Collection::TriageEntries
            | Collection::ExtendedDowntimeLogs
            | Collection::QuantityAdjustments
            | Collection::ReworkEntries => Duration::from_secs(60),
            Collection::Planning | Collection::ProductionOrders => Duration::from_secs(120),
            Collection::SystemLogs => Duration::from_secs(300),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = UnknownCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCollection(s.to_string()))
    }
}
