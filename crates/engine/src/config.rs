use std::fs;
use std::path::Path;
use std::time::Duration;

use pantry_core::DecimalStyle;
use pantry_core::merge::MAX_TAGS_PER_RECIPE;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Firestore's limit on writes per committed batch.
pub const DEFAULT_BATCH_LIMIT: usize = 500;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

/// Ordering of remote writes that target the same entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Writes are sent immediately, except that writes to an entity whose
    /// creation is still in flight wait for it. The last write the server
    /// accepts wins.
    #[default]
    Parallel,
    /// Writes to one `(collection, entity)` reach the remote in apply order.
    PerEntityFifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per remote write, the first one included.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Upper bound of the random delay added to each backoff.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 250,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (1-based): exponential backoff plus jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let base = self.backoff_ms.saturating_mul(1u64 << exp);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_limit: usize,
    pub max_tags_per_recipe: usize,
    pub decimal_style: DecimalStyle,
    pub write_policy: WritePolicy,
    pub retry: RetryPolicy,
    pub frame_interval_ms: u64,
    pub cache_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            max_tags_per_recipe: MAX_TAGS_PER_RECIPE,
            decimal_style: DecimalStyle::default(),
            write_policy: WritePolicy::default(),
            retry: RetryPolicy::default(),
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            cache_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Missing file means defaults; a malformed one is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_limit == 0 {
            return Err(ConfigError::Invalid("batch_limit must be positive".into()));
        }
        if self.max_tags_per_recipe == 0 {
            return Err(ConfigError::Invalid(
                "max_tags_per_recipe must be positive".into(),
            ));
        }
        if self.frame_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "frame_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
