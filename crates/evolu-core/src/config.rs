//! Engine configuration.

use crate::timestamp::DEFAULT_MAX_DRIFT_MS;

/// A secondary index to create on the local database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    /// Application table.
    pub table: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
}

/// Engine options. Every field has a default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifies the database file.
    pub name: String,
    /// Relay endpoint.
    pub sync_url: String,
    /// Clock-drift rejection threshold in milliseconds.
    pub max_drift_ms: u64,
    /// Below this many timestamps a range is sent as an explicit list
    /// instead of being subdivided further.
    pub list_threshold: usize,
    /// Upper bound on timestamps or changes carried by one range payload.
    pub max_items_per_range: usize,
    /// Secondary indexes created at open time.
    pub indexes: Vec<Index>,
    /// Imported mnemonic phrase; autogenerated when absent.
    pub mnemonic: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "Evolu".to_string(),
            sync_url: "wss://free.evoluhq.com".to_string(),
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            list_threshold: 50,
            max_items_per_range: 500,
            indexes: Vec::new(),
            mnemonic: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.name, "Evolu");
        assert_eq!(config.max_drift_ms, 300_000);
        assert_eq!(config.list_threshold, 50);
        assert_eq!(config.max_items_per_range, 500);
        assert!(config.mnemonic.is_none());
    }
}
