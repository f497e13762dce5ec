//! Runtime configuration for the sync core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collection::Collection;
use crate::error::SyncError;
use crate::mirror::ReplayPolicy;
use crate::remote::DEFAULT_MAX_BATCH_SIZE;

/// Default StateStore TTL in seconds (5 minutes).
const DEFAULT_STATE_TTL_SECS: u64 = 300;

/// Default QueryCache TTL in seconds (5 minutes).
const DEFAULT_QUERY_CACHE_TTL_SECS: u64 = 300;

/// Default repository TTL in seconds for collections without their own.
const DEFAULT_REPOSITORY_TTL_SECS: u64 = 60;

/// Delay before a failed mirror subscription is restarted, in seconds.
const DEFAULT_MIRROR_RESTART_DELAY_SECS: u64 = 30;

/// Configuration shared by every component.
///
/// Durations are whole seconds so the struct reads naturally from env vars
/// and JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Default freshness budget for StateStore reads.
    pub state_ttl_secs: u64,
    /// TTL of the shared query cache.
    pub query_cache_ttl_secs: u64,
    /// TTL for repositories built without a collection-specific TTL.
    pub default_repository_ttl_secs: u64,
    /// Upper bound on ids per committed batch delete. Clamped to the
    /// store's own limit.
    pub max_batch_size: usize,
    /// Collection kept in the live mirror.
    pub mirror_collection: Collection,
    /// Delay before the mirror retries a failed subscription.
    pub mirror_restart_delay_secs: u64,
    /// What the mirror does with replayed snapshots after the first.
    pub replay_policy: ReplayPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: DEFAULT_STATE_TTL_SECS,
            query_cache_ttl_secs: DEFAULT_QUERY_CACHE_TTL_SECS,
            default_repository_ttl_secs: DEFAULT_REPOSITORY_TTL_SECS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            mirror_collection: Collection::ActiveDowntimes,
            mirror_restart_delay_secs: DEFAULT_MIRROR_RESTART_DELAY_SECS,
            replay_policy: ReplayPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.query_cache_ttl_secs)
    }

    pub fn default_repository_ttl(&self) -> Duration {
        Duration::from_secs(self.default_repository_ttl_secs)
    }

    pub fn mirror_restart_delay(&self) -> Duration {
        Duration::from_secs(self.mirror_restart_delay_secs)
    }

    /// Reject values that would disable caching or batching outright.
    pub fn validate(&self) -> Result<(), SyncError> {
        let ttls = [
            ("state_ttl_secs", self.state_ttl_secs),
            ("query_cache_ttl_secs", self.query_cache_ttl_secs),
            (
                "default_repository_ttl_secs",
                self.default_repository_ttl_secs,
            ),
        ];
        if let Some((name, _)) = ttls.iter().find(|(_, secs)| *secs == 0) {
            return Err(SyncError::Config(format!("{} must be > 0", name)));
        }

        if self.max_batch_size == 0 || self.max_batch_size > DEFAULT_MAX_BATCH_SIZE {
            return Err(SyncError::Config(format!(
                "max_batch_size must be in 1..={}, got {}",
                DEFAULT_MAX_BATCH_SIZE, self.max_batch_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.state_ttl(), Duration::from_secs(300));
        assert_eq!(config.mirror_restart_delay(), Duration::from_secs(30));
        assert_eq!(config.mirror_collection, Collection::ActiveDowntimes);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"state_ttl_secs": 120, "replay_policy": "diff_and_apply"}"#)
                .unwrap();

        assert_eq!(
            config,
            SyncConfig {
                state_ttl_secs: 120,
                replay_policy: ReplayPolicy::DiffAndApply,
                ..SyncConfig::default()
            }
        );
    }

    #[test]
    fn test_validate_rejects_zero_ttl_and_bad_batch() {
        let config = SyncConfig {
            query_cache_ttl_secs: 0,
            ..SyncConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("query_cache_ttl_secs"));

        for max_batch_size in [0, 501] {
            let config = SyncConfig {
                max_batch_size,
                ..SyncConfig::default()
            };
            assert!(matches!(config.validate(), Err(SyncError::Config(_))));
        }
    }
}
