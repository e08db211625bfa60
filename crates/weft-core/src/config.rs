// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Weft Core configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// SQLite connection URL for the durable row stores.
    pub database_url: String,
    /// How many task ids the shard allocator reserves per lease write.
    pub task_id_block_size: i64,
    /// Maximum cached workflow contexts per shard.
    pub workflow_cache_size: usize,
    /// Maximum cached history events per shard.
    pub events_cache_size: usize,
    /// Maximum retries for retryable store errors.
    pub max_operation_retries: u32,
    /// Base backoff between retries; doubles per attempt with jitter.
    pub retry_base_backoff: Duration,
    /// How long a low-priority lock acquisition defers to high-priority
    /// waiters before proceeding anyway.
    pub low_priority_lock_defer: Duration,
    /// How long closed-workflow history is retained before deletion.
    pub history_retention: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            task_id_block_size: 100,
            workflow_cache_size: 512,
            events_cache_size: 1024,
            max_operation_retries: 5,
            retry_base_backoff: Duration::from_millis(50),
            low_priority_lock_defer: Duration::from_millis(500),
            history_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `WEFT_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `WEFT_TASK_ID_BLOCK_SIZE`: task ids reserved per lease write (default: 100)
    /// - `WEFT_WORKFLOW_CACHE_SIZE`: cached workflow contexts per shard (default: 512)
    /// - `WEFT_EVENTS_CACHE_SIZE`: cached history events per shard (default: 1024)
    /// - `WEFT_MAX_OPERATION_RETRIES`: bounded retry count (default: 5)
    /// - `WEFT_HISTORY_RETENTION_SECS`: closed-history retention (default: 86400)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("WEFT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("WEFT_DATABASE_URL"))?;

        let mut config = Self {
            database_url,
            ..Self::default()
        };

        if let Ok(raw) = std::env::var("WEFT_TASK_ID_BLOCK_SIZE") {
            config.task_id_block_size = raw.parse().map_err(|_| {
                ConfigError::Invalid("WEFT_TASK_ID_BLOCK_SIZE", "must be a positive integer")
            })?;
            if config.task_id_block_size <= 0 {
                return Err(ConfigError::Invalid(
                    "WEFT_TASK_ID_BLOCK_SIZE",
                    "must be a positive integer",
                ));
            }
        }

        if let Ok(raw) = std::env::var("WEFT_WORKFLOW_CACHE_SIZE") {
            config.workflow_cache_size = raw.parse().map_err(|_| {
                ConfigError::Invalid("WEFT_WORKFLOW_CACHE_SIZE", "must be a positive integer")
            })?;
        }

        if let Ok(raw) = std::env::var("WEFT_EVENTS_CACHE_SIZE") {
            config.events_cache_size = raw.parse().map_err(|_| {
                ConfigError::Invalid("WEFT_EVENTS_CACHE_SIZE", "must be a positive integer")
            })?;
        }

        if let Ok(raw) = std::env::var("WEFT_MAX_OPERATION_RETRIES") {
            config.max_operation_retries = raw.parse().map_err(|_| {
                ConfigError::Invalid("WEFT_MAX_OPERATION_RETRIES", "must be a non-negative integer")
            })?;
        }

        if let Ok(raw) = std::env::var("WEFT_HISTORY_RETENTION_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                ConfigError::Invalid("WEFT_HISTORY_RETENTION_SECS", "must be seconds")
            })?;
            config.history_retention = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
