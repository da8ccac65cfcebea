// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Configuration and feature flags.
//!
//! Config structs carry `Default` + `from_env()`. Environment names and
//! typed accessors live in [`env_vars`] so every binary reads the same
//! spelling. Feature flags resolve with precedence:
//! runtime override > process config > environment > built-in default,
//! where the environment form is `CLAUDE_FLOW_<FLAG_SCREAMING_SNAKE>` with
//! `"true"` or `"1"` enabling.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use dashmem_hnsw::HnswConfig;

/// Centralized environment variable names and typed accessors.
pub mod env_vars {
    /// Prefix for feature-flag environment overrides.
    pub const FLAG_PREFIX: &str = "CLAUDE_FLOW_";

    /// Vector dimension for the memory index.
    pub const DASHMEM_DIMENSION: &str = "DASHMEM_DIMENSION";
    /// Maximum elements the vector index will hold.
    pub const DASHMEM_MAX_ELEMENTS: &str = "DASHMEM_MAX_ELEMENTS";
    /// Cache entry cap.
    pub const DASHMEM_CACHE_MAX_SIZE: &str = "DASHMEM_CACHE_MAX_SIZE";
    /// Cache TTL in milliseconds.
    pub const DASHMEM_CACHE_TTL_MS: &str = "DASHMEM_CACHE_TTL_MS";
    /// Snapshot file path for shutdown persistence.
    pub const DASHMEM_SNAPSHOT_PATH: &str = "DASHMEM_SNAPSHOT_PATH";

    /// Reads an environment variable as a string, `None` if unset.
    #[must_use]
    pub fn env_string(name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    /// Reads an environment variable as a `usize`, `default` if unset or
    /// invalid.
    #[must_use]
    pub fn env_usize_or_default(name: &str, default: usize) -> usize {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Reads an environment variable as a `u64`, `default` if unset or
    /// invalid.
    #[must_use]
    pub fn env_u64_or_default(name: &str, default: u64) -> u64 {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Reads a boolean flag: `"true"` or `"1"` enables.
    #[must_use]
    pub fn env_flag(name: &str) -> Option<bool> {
        std::env::var(name)
            .ok()
            .map(|v| matches!(v.trim(), "true" | "1"))
    }

    /// The environment spelling for a feature flag, e.g.
    /// `hybrid-cache` -> `CLAUDE_FLOW_HYBRID_CACHE`.
    #[must_use]
    pub fn flag_env_name(flag: &str) -> String {
        let screaming: String = flag
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{FLAG_PREFIX}{screaming}")
    }
}

/// Feature-flag resolution with layered precedence.
#[derive(Debug, Clone, Default)]
pub struct FeatureFlags {
    /// Highest precedence: set at runtime via [`FeatureFlags::set_override`].
    overrides: HashMap<String, bool>,
    /// Second precedence: values from process configuration.
    config: HashMap<String, bool>,
    /// Lowest precedence: built-in defaults.
    defaults: HashMap<String, bool>,
}

impl FeatureFlags {
    /// Empty flag set (everything resolves to `false` unless the
    /// environment says otherwise).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in default.
    #[must_use]
    pub fn with_default(mut self, flag: impl Into<String>, value: bool) -> Self {
        self.defaults.insert(flag.into(), value);
        self
    }

    /// Register a process-config value.
    #[must_use]
    pub fn with_config(mut self, flag: impl Into<String>, value: bool) -> Self {
        self.config.insert(flag.into(), value);
        self
    }

    /// Set (or replace) a runtime override.
    pub fn set_override(&mut self, flag: impl Into<String>, value: bool) {
        self.overrides.insert(flag.into(), value);
    }

    /// Remove a runtime override, letting lower layers win again.
    pub fn clear_override(&mut self, flag: &str) {
        self.overrides.remove(flag);
    }

    /// Resolve a flag: runtime override > process config > environment >
    /// default > `false`.
    #[must_use]
    pub fn is_enabled(&self, flag: &str) -> bool {
        if let Some(v) = self.overrides.get(flag) {
            return *v;
        }
        if let Some(v) = self.config.get(flag) {
            return *v;
        }
        if let Some(v) = env_vars::env_flag(&env_vars::flag_env_name(flag)) {
            return v;
        }
        self.defaults.get(flag).copied().unwrap_or(false)
    }
}

/// Top-level memory core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Vector index configuration (dimension, M, ef, metric, quantization).
    pub hnsw: HnswConfig,
    /// Entry cache configuration.
    pub cache: CacheConfig,
    /// Dual-write mutations to both backends (default). Disabling makes the
    /// vector backend authoritative - a degraded mode.
    pub dual_write: bool,
    /// Snapshot path for shutdown persistence; `None` disables it.
    pub snapshot_path: Option<std::path::PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            hnsw: HnswConfig::default(),
            cache: CacheConfig::default(),
            dual_write: true,
            snapshot_path: None,
        }
    }
}

impl MemoryConfig {
    /// Create from environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        use env_vars::{
            env_string, env_u64_or_default, env_usize_or_default, DASHMEM_CACHE_MAX_SIZE,
            DASHMEM_CACHE_TTL_MS, DASHMEM_DIMENSION, DASHMEM_MAX_ELEMENTS, DASHMEM_SNAPSHOT_PATH,
        };
        let defaults = Self::default();
        Self {
            hnsw: HnswConfig {
                dimension: env_usize_or_default(DASHMEM_DIMENSION, defaults.hnsw.dimension),
                max_elements: env_usize_or_default(
                    DASHMEM_MAX_ELEMENTS,
                    defaults.hnsw.max_elements,
                ),
                ..defaults.hnsw
            },
            cache: CacheConfig {
                max_size: env_usize_or_default(DASHMEM_CACHE_MAX_SIZE, defaults.cache.max_size),
                ttl_ms: Some(env_u64_or_default(
                    DASHMEM_CACHE_TTL_MS,
                    defaults.cache.ttl_ms.unwrap_or(300_000),
                )),
                ..defaults.cache
            },
            dual_write: defaults.dual_write,
            snapshot_path: env_string(DASHMEM_SNAPSHOT_PATH).map(std::path::PathBuf::from),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_env_name() {
        assert_eq!(
            env_vars::flag_env_name("hybrid-cache"),
            "CLAUDE_FLOW_HYBRID_CACHE"
        );
        assert_eq!(env_vars::flag_env_name("sona"), "CLAUDE_FLOW_SONA");
    }

    #[test]
    fn test_flag_precedence() {
        // Unique name so parallel tests cannot collide on the env var.
        let flag = "dashmem-test-precedence";
        let env_name = env_vars::flag_env_name(flag);

        let mut flags = FeatureFlags::new().with_default(flag, false);
        assert!(!flags.is_enabled(flag));

        std::env::set_var(&env_name, "1");
        assert!(flags.is_enabled(flag), "environment beats default");

        let mut flags = FeatureFlags::new()
            .with_default(flag, false)
            .with_config(flag, false);
        assert!(!flags.is_enabled(flag), "process config beats environment");

        flags.set_override(flag, true);
        assert!(flags.is_enabled(flag), "runtime override beats config");

        flags.clear_override(flag);
        assert!(!flags.is_enabled(flag));
        std::env::remove_var(&env_name);
    }

    #[test]
    fn test_env_flag_values() {
        std::env::set_var("DASHMEM_TEST_FLAG_VALUES", "true");
        assert_eq!(env_vars::env_flag("DASHMEM_TEST_FLAG_VALUES"), Some(true));
        std::env::set_var("DASHMEM_TEST_FLAG_VALUES", "0");
        assert_eq!(env_vars::env_flag("DASHMEM_TEST_FLAG_VALUES"), Some(false));
        std::env::remove_var("DASHMEM_TEST_FLAG_VALUES");
        assert_eq!(env_vars::env_flag("DASHMEM_TEST_FLAG_VALUES"), None);
    }

    #[test]
    fn test_default_config() {
        let config = MemoryConfig::default();
        assert_eq!(config.hnsw.dimension, 1536);
        assert_eq!(config.hnsw.m, 16);
        assert_eq!(config.hnsw.ef_construction, 200);
        assert!(config.dual_write);
        assert_eq!(config.cache.max_size, 10_000);
        assert_eq!(config.cache.ttl_ms, Some(300_000));
    }
}
