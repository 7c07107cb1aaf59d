//! Backend configuration — replica count, admission and batching parameters

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, ServeError};

/// Capability flags derived from the replica config when the backend is created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMetadata {
    /// Replicas take a list of requests per invocation
    #[serde(default)]
    pub accepts_batches: bool,
    /// Replicas run on the blocking pool
    #[serde(default)]
    pub is_blocking: bool,
}

/// Fully resolved backend configuration
///
/// Every field has a value; build one with [`BackendConfig::resolve`] and
/// change it with [`BackendConfig::merged`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Desired number of replicas
    pub num_replicas: u32,

    /// Maximum requests per batch (only meaningful when batches are accepted)
    pub max_batch_size: Option<u32>,

    /// Time a partial batch waits for more requests before it is flushed
    #[serde(with = "duration_secs")]
    pub batch_wait_timeout: Duration,

    /// Bound on requests outstanding to the backend's replica pool
    pub max_concurrent_queries: u32,

    /// Capability flags, fixed at creation time
    #[serde(default)]
    pub internal_metadata: BackendMetadata,
}

/// A partial backend configuration; only the supplied fields are applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfigUpdate {
    #[serde(default)]
    pub num_replicas: Option<u32>,
    #[serde(default)]
    pub max_batch_size: Option<u32>,
    /// Seconds; must be finite, >= 0 and at most one hour
    #[serde(default)]
    pub batch_wait_timeout: Option<f64>,
    #[serde(default)]
    pub max_concurrent_queries: Option<u32>,
}

impl BackendConfigUpdate {
    pub fn with_num_replicas(mut self, n: u32) -> Self {
        self.num_replicas = Some(n);
        self
    }

    pub fn with_max_batch_size(mut self, n: u32) -> Self {
        self.max_batch_size = Some(n);
        self
    }

    pub fn with_batch_wait_timeout(mut self, timeout: Duration) -> Self {
        self.batch_wait_timeout = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_max_concurrent_queries(mut self, n: u32) -> Self {
        self.max_concurrent_queries = Some(n);
        self
    }

    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

const DEFAULT_NUM_REPLICAS: u32 = 1;
const DEFAULT_MAX_CONCURRENT_QUERIES: u32 = 8;

/// Upper bound on how long a partial batch may wait
pub const MAX_BATCH_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default concurrency bound: room for two full batches, or 8 without batching
fn default_max_concurrent_queries(max_batch_size: Option<u32>) -> u32 {
    match max_batch_size {
        Some(n) => n.saturating_mul(2).max(1),
        None => DEFAULT_MAX_CONCURRENT_QUERIES,
    }
}

impl BackendConfig {
    /// Apply defaults to a partial config and validate the result
    pub fn resolve(options: BackendConfigUpdate, metadata: BackendMetadata) -> Result<Self> {
        let mut config = Self {
            num_replicas: DEFAULT_NUM_REPLICAS,
            max_batch_size: None,
            batch_wait_timeout: Duration::ZERO,
            max_concurrent_queries: DEFAULT_MAX_CONCURRENT_QUERIES,
            internal_metadata: metadata,
        };
        config.apply(&options)?;
        if options.max_concurrent_queries.is_none() {
            config.max_concurrent_queries = default_max_concurrent_queries(config.max_batch_size);
        }
        config.validate_complete()?;
        Ok(config)
    }

    /// Return a copy with the supplied fields replaced, re-validated
    pub fn merged(&self, update: &BackendConfigUpdate) -> Result<Self> {
        let mut config = self.clone();
        config.apply(update)?;
        config.validate_complete()?;
        Ok(config)
    }

    fn apply(&mut self, update: &BackendConfigUpdate) -> Result<()> {
        if let Some(n) = update.num_replicas {
            self.num_replicas = n;
        }
        if let Some(n) = update.max_batch_size {
            self.max_batch_size = Some(n);
        }
        if let Some(secs) = update.batch_wait_timeout {
            self.batch_wait_timeout = Duration::try_from_secs_f64(secs).map_err(|e| {
                ServeError::Validation(format!(
                    "batch_wait_timeout ({}) must be a non-negative number of seconds: {}",
                    secs, e
                ))
            })?;
        }
        if let Some(n) = update.max_concurrent_queries {
            self.max_concurrent_queries = n;
        }
        Ok(())
    }

    /// Check that every field holds an acceptable value
    pub fn validate_complete(&self) -> Result<()> {
        if self.max_batch_size == Some(0) {
            return Err(ServeError::Validation(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch_wait_timeout > MAX_BATCH_WAIT_TIMEOUT {
            return Err(ServeError::Validation(format!(
                "batch_wait_timeout ({:?}) must not exceed {:?}",
                self.batch_wait_timeout, MAX_BATCH_WAIT_TIMEOUT
            )));
        }
        if self.max_concurrent_queries == 0 {
            return Err(ServeError::Validation(
                "max_concurrent_queries must be at least 1".to_string(),
            ));
        }
        if self.max_batch_size.is_some() && !self.internal_metadata.accepts_batches {
            return Err(ServeError::Validation(
                "max_batch_size is set in config but the replica does not accept batches"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Whether requests to this backend are grouped into batches
    pub fn batching_enabled(&self) -> bool {
        self.internal_metadata.accepts_batches
    }

    /// Batch size used by the router (1 when unset)
    pub fn effective_batch_size(&self) -> usize {
        self.max_batch_size.unwrap_or(1).max(1) as usize
    }
}

mod duration_secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            D::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {}: {}",
                secs, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batching() -> BackendMetadata {
        BackendMetadata {
            accepts_batches: true,
            is_blocking: false,
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let config = BackendConfig::resolve(Default::default(), BackendMetadata::default()).unwrap();
        assert_eq!(config.num_replicas, 1);
        assert_eq!(config.max_batch_size, None);
        assert_eq!(config.batch_wait_timeout, Duration::ZERO);
        assert_eq!(config.max_concurrent_queries, 8);
        assert!(!config.batching_enabled());
        assert_eq!(config.effective_batch_size(), 1);
    }

    #[test]
    fn test_resolve_concurrency_follows_batch_size() {
        let opts = BackendConfigUpdate::default().with_max_batch_size(16);
        let config = BackendConfig::resolve(opts, batching()).unwrap();
        assert_eq!(config.max_concurrent_queries, 32);
        assert_eq!(config.effective_batch_size(), 16);
    }

    #[test]
    fn test_resolve_explicit_concurrency_wins() {
        let opts = BackendConfigUpdate::default()
            .with_max_batch_size(16)
            .with_max_concurrent_queries(5);
        let config = BackendConfig::resolve(opts, batching()).unwrap();
        assert_eq!(config.max_concurrent_queries, 5);
    }

    #[test]
    fn test_batch_size_requires_batching_replica() {
        let opts = BackendConfigUpdate::default().with_max_batch_size(4);
        let err = BackendConfig::resolve(opts, BackendMetadata::default()).unwrap_err();
        assert!(err.to_string().contains("does not accept batches"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let err = BackendConfig::resolve(
            BackendConfigUpdate::default().with_max_batch_size(0),
            batching(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_batch_size"));

        let err = BackendConfig::resolve(
            BackendConfigUpdate::default().with_max_concurrent_queries(0),
            BackendMetadata::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_queries"));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let opts = BackendConfigUpdate {
            batch_wait_timeout: Some(-0.5),
            ..Default::default()
        };
        assert!(BackendConfig::resolve(opts, batching()).is_err());
    }

    #[test]
    fn test_out_of_range_timeout_rejected() {
        for secs in [1e20, 1e19, f64::INFINITY, f64::NAN, 3600.5] {
            let opts = BackendConfigUpdate {
                batch_wait_timeout: Some(secs),
                ..Default::default()
            };
            let err = BackendConfig::resolve(opts, batching()).unwrap_err();
            assert!(matches!(err, ServeError::Validation(_)), "{secs}: {err}");
        }

        let base = BackendConfig::resolve(Default::default(), batching()).unwrap();
        let update = BackendConfigUpdate {
            batch_wait_timeout: Some(1e20),
            ..Default::default()
        };
        assert!(matches!(base.merged(&update), Err(ServeError::Validation(_))));

        let at_cap = BackendConfigUpdate::default().with_batch_wait_timeout(MAX_BATCH_WAIT_TIMEOUT);
        assert!(BackendConfig::resolve(at_cap, batching()).is_ok());
    }

    #[test]
    fn test_huge_duration_in_json_rejected() {
        let mut json = serde_json::to_value(
            BackendConfig::resolve(Default::default(), batching()).unwrap(),
        )
        .unwrap();
        json["batch_wait_timeout"] = serde_json::json!(1e20);
        assert!(serde_json::from_value::<BackendConfig>(json).is_err());
    }

    #[test]
    fn test_merge_leaves_other_fields() {
        let base = BackendConfig::resolve(
            BackendConfigUpdate::default()
                .with_num_replicas(3)
                .with_batch_wait_timeout(Duration::from_millis(250)),
            batching(),
        )
        .unwrap();
        let merged = base
            .merged(&BackendConfigUpdate::default().with_max_batch_size(10))
            .unwrap();
        assert_eq!(merged.max_batch_size, Some(10));
        assert_eq!(merged.num_replicas, 3);
        assert_eq!(merged.batch_wait_timeout, Duration::from_millis(250));
        assert_eq!(merged.max_concurrent_queries, base.max_concurrent_queries);
        assert_eq!(merged.internal_metadata, base.internal_metadata);
    }

    #[test]
    fn test_merge_revalidates() {
        let base = BackendConfig::resolve(Default::default(), BackendMetadata::default()).unwrap();
        let err = base
            .merged(&BackendConfigUpdate::default().with_max_batch_size(2))
            .unwrap_err();
        assert!(matches!(err, ServeError::Validation(_)));
    }

    #[test]
    fn test_duration_serialized_as_seconds() {
        let config = BackendConfig::resolve(
            BackendConfigUpdate::default().with_batch_wait_timeout(Duration::from_millis(100)),
            batching(),
        )
        .unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["batch_wait_timeout"], serde_json::json!(0.1));
        let parsed: BackendConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_update_from_toml() {
        let update: BackendConfigUpdate = toml::from_str(
            r#"
            num_replicas       = 2
            batch_wait_timeout = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(update.num_replicas, Some(2));
        assert_eq!(update.batch_wait_timeout, Some(0.5));
        assert!(update.max_batch_size.is_none());
        assert!(!update.is_empty());
        assert!(BackendConfigUpdate::default().is_empty());
    }
}
