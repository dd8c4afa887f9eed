//! Graph Configuration

use serde::{Deserialize, Serialize};

/// Tunables for a [`Graph`](crate::Graph).
///
/// Deserializes with defaults for any missing field, so hosts can embed it in
/// their own configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum number of chained refire passes per external trigger.
    ///
    /// One pass is enough for a single pulse; each pulse stacked on another
    /// pulse needs one more. Values below one are treated as one, see
    /// [`GraphConfig::refire_limit`].
    pub max_refire_passes: usize,

    /// Run the legality inspector when a node type is first registered.
    pub inspect_nodes: bool,
}

impl GraphConfig {
    /// Set the refire pass bound. Clamped to at least one.
    pub fn with_max_refire_passes(mut self, passes: usize) -> Self {
        self.max_refire_passes = passes.max(1);
        self
    }

    /// The refire pass bound in effect.
    ///
    /// A single refire pass is always allowed, so a zero read from a
    /// configuration file still lets pulses reset.
    pub fn refire_limit(&self) -> usize {
        self.max_refire_passes.max(1)
    }

    /// Enable or disable node inspection.
    pub fn with_inspection(mut self, enabled: bool) -> Self {
        self.inspect_nodes = enabled;
        self
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_refire_passes: 8,
            inspect_nodes: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GraphConfig::default();
        assert_eq!(config.max_refire_passes, 8);
        assert!(config.inspect_nodes);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: GraphConfig = serde_json::from_str(r#"{ "max_refire_passes": 2 }"#).unwrap();
        assert_eq!(config.max_refire_passes, 2);
        assert!(config.inspect_nodes);
    }

    #[test]
    fn refire_limit_is_at_least_one() {
        let config: GraphConfig = serde_json::from_str(r#"{ "max_refire_passes": 0 }"#).unwrap();
        assert_eq!(config.refire_limit(), 1);

        let config = GraphConfig::default().with_max_refire_passes(0);
        assert_eq!(config.max_refire_passes, 1);
        assert_eq!(config.refire_limit(), 1);
    }

    #[test]
    fn builders_override_fields() {
        let config = GraphConfig::default()
            .with_max_refire_passes(1)
            .with_inspection(false);
        assert_eq!(config.max_refire_passes, 1);
        assert!(!config.inspect_nodes);
    }
}
