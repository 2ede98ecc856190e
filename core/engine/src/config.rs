//! Options for collection and restore operations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use keepsake_common::{Error, Result};
use keepsake_remote::CollisionPolicy;

use crate::retry::RetryConfig;
use crate::url_cache::MIN_REFRESH_INTERVAL;

/// Concurrency limits, passed explicitly into each collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parallelism {
    /// Concurrent item fetches per collection.
    pub item_fetch: usize,
    /// Capacity of a collection's output channel.
    pub collection_buffer: usize,
}

impl Default for Parallelism {
    fn default() -> Self {
        Self {
            item_fetch: 4,
            collection_buffer: 1000,
        }
    }
}

/// Restore behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub on_collision: CollisionPolicy,
    /// Restore sharing permissions along with content.
    pub include_permissions: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            on_collision: CollisionPolicy::Skip,
            include_permissions: true,
        }
    }
}

/// Retry behaviour for transient remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_jitter(self.jitter)
    }
}

/// Options for one backup or restore operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Promote the first recoverable error to a failure.
    pub fail_fast: bool,
    pub parallelism: Parallelism,
    /// How long a URL cache snapshot stays fresh.
    pub url_cache_refresh_interval: Duration,
    pub restore: RestoreConfig,
    pub retry: RetrySettings,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            fail_fast: false,
            parallelism: Parallelism::default(),
            url_cache_refresh_interval: Duration::from_secs(3600),
            restore: RestoreConfig::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Options {
    /// Check the options are usable.
    ///
    /// # Errors
    /// - Zero item-fetch parallelism or collection buffer
    /// - URL cache refresh interval below one second
    pub fn validate(&self) -> Result<()> {
        if self.parallelism.item_fetch == 0 {
            return Err(Error::InvalidInput(
                "item fetch parallelism must be at least 1".to_string(),
            ));
        }
        if self.parallelism.collection_buffer == 0 {
            return Err(Error::InvalidInput(
                "collection buffer must be at least 1".to_string(),
            ));
        }
        if self.url_cache_refresh_interval < MIN_REFRESH_INTERVAL {
            return Err(Error::InvalidInput(format!(
                "url cache refresh interval {:?} is below the minimum of {:?}",
                self.url_cache_refresh_interval, MIN_REFRESH_INTERVAL
            )));
        }
        Ok(())
    }

    /// Parse and validate options from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
