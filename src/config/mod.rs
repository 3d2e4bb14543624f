//! Guard Configuration Module
//!
//! Provides deployment configuration loaded from TOML files: preprocessing
//! geometry per RPM, threshold policy, drift limits, retraining cadence and
//! storage locations.
//!
//! ## Loading Order
//!
//! 1. `VIBE_GUARD_CONFIG` environment variable (path to TOML file)
//! 2. `vibe_guard.toml` in the current working directory
//! 3. Built-in defaults (matching the constants the models were built with)
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! config::init(GuardConfig::load());
//! let limit = config::get().drift.variance_limit;
//! ```

mod guard_config;
pub mod defaults;

pub use guard_config::*;

use std::sync::OnceLock;

/// Global guard configuration, initialized once at startup.
static GUARD_CONFIG: OnceLock<GuardConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// A second call is ignored with a warning.
pub fn init(config: GuardConfig) {
    if GUARD_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Falls back to built-in defaults when `init()` has not been called, so
/// library users and tests never hit an uninitialized config.
pub fn get() -> &'static GuardConfig {
    GUARD_CONFIG.get_or_init(GuardConfig::default)
}
