//! Migration configuration
//!
//! Tunables for the batch driver and the locality-driven path. Defaults match
//! the classic values: ten passes, forced locking from the fourth pass, a
//! 100ms rate-limit window and a 128MB per-window budget.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::page::PAGE_SHIFT;

/// Default number of batch passes
pub const DEFAULT_MAX_PASSES: usize = 10;

/// Passes after this index force blocking lock and writeback waits
pub const DEFAULT_FORCE_AFTER_PASS: usize = 2;

/// Configuration for the locality-driven path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalityConfig {
    /// Length of the per-partition rate-limit window
    pub window_ms: u64,
    /// Grace period after a window during which a full window still throttles
    pub pte_update_interval_ms: u64,
    /// Pages admitted into one partition per window
    pub ratelimit_pages: u64,
}

impl Default for LocalityConfig {
    fn default() -> Self {
        Self {
            window_ms: 100,
            pte_update_interval_ms: 1000,
            ratelimit_pages: 128 << (20 - PAGE_SHIFT),
        }
    }
}

impl LocalityConfig {
    /// Rate-limit window
    #[inline]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Table-update grace interval
    #[inline]
    pub fn pte_update_interval(&self) -> Duration {
        Duration::from_millis(self.pte_update_interval_ms)
    }

    /// Set the window length
    pub fn window_ms(mut self, ms: u64) -> Self {
        self.window_ms = ms;
        self
    }

    /// Set the per-window page budget
    pub fn ratelimit_pages(mut self, pages: u64) -> Self {
        self.ratelimit_pages = pages;
        self
    }
}

/// Configuration for the migrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Maximum passes over a batch
    pub max_passes: usize,
    /// Passes with index above this use blocking acquisition
    pub force_after_pass: usize,
    /// Locality-driven migration tunables
    pub locality: LocalityConfig,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            max_passes: DEFAULT_MAX_PASSES,
            force_after_pass: DEFAULT_FORCE_AFTER_PASS,
            locality: LocalityConfig::default(),
        }
    }
}

impl MigrateConfig {
    /// Set the maximum number of passes
    pub fn max_passes(mut self, passes: usize) -> Self {
        self.max_passes = passes;
        self
    }

    /// Set the pass index after which acquisition is forced
    pub fn force_after_pass(mut self, pass: usize) -> Self {
        self.force_after_pass = pass;
        self
    }

    /// Set the locality configuration
    pub fn locality(mut self, locality: LocalityConfig) -> Self {
        self.locality = locality;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_passes == 0 {
            return Err(MigrateError::InvalidConfig(
                "max_passes must be greater than 0".to_string(),
            ));
        }

        if self.force_after_pass >= self.max_passes {
            return Err(MigrateError::InvalidConfig(format!(
                "force_after_pass ({}) must be below max_passes ({})",
                self.force_after_pass, self.max_passes
            )));
        }

        if self.locality.window_ms == 0 {
            return Err(MigrateError::InvalidConfig(
                "rate-limit window must be greater than 0".to_string(),
            ));
        }

        if self.locality.ratelimit_pages == 0 {
            return Err(MigrateError::InvalidConfig(
                "ratelimit_pages must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
