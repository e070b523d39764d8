//! Agent configuration.
//!
//! Two attribution modes exist and may be enabled independently: the
//! rewrite mode, which relies on hook calls injected into class
//! initializers as they load, and the watchpoint mode, which relies on
//! per-field modification watches. Diagnostics are off by default.

use std::env;

/// Tunables for one agent instance.
///
/// # Example
///
/// ```ignore
/// use heaptrace_agent::AgentConfig;
///
/// // Watchpoint-only run with write logging
/// let config = AgentConfig {
///     rewrite_enabled: false,
///     watchpoints_enabled: true,
///     print_clinit_heap_writes: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Rewrite class initializers to call the entry hooks.
    ///
    /// Default: true
    pub rewrite_enabled: bool,

    /// Install per-field modification watches at class prepare and gate
    /// their delivery per thread.
    ///
    /// Default: false
    pub watchpoints_enabled: bool,

    /// Print one stderr line for every attributed heap write and every
    /// initializer entry.
    ///
    /// Default: false
    pub print_clinit_heap_writes: bool,

    /// Verbose diagnostics, including teardown counters.
    ///
    /// Default: false
    pub log: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rewrite_enabled: true,
            watchpoints_enabled: false,
            print_clinit_heap_writes: false,
            log: false,
        }
    }
}

impl AgentConfig {
    /// Load the configuration from the environment, starting from the
    /// defaults. Unset and unparsable variables keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rewrite_enabled: env_flag("HEAPTRACE_REWRITE").unwrap_or(defaults.rewrite_enabled),
            watchpoints_enabled: env_flag("HEAPTRACE_WATCHPOINTS")
                .unwrap_or(defaults.watchpoints_enabled),
            print_clinit_heap_writes: env_flag("HEAPTRACE_PRINT_WRITES")
                .unwrap_or(defaults.print_clinit_heap_writes),
            log: env_flag("HEAPTRACE_LOG").unwrap_or(defaults.log),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rewrite_enabled && !self.watchpoints_enabled {
            return Err(ConfigError::NoAttributionMode);
        }
        Ok(())
    }

    /// Whether per-write logging is active.
    #[inline]
    pub fn traces_writes(&self) -> bool {
        self.print_clinit_heap_writes || self.log
    }
}

/// Parse a boolean environment variable.
fn env_flag(name: &str) -> Option<bool> {
    match env::var(name).ok()?.trim() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Both attribution modes are disabled; the agent would observe
    /// nothing.
    NoAttributionMode,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoAttributionMode => {
                write!(f, "at least one attribution mode must be enabled")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
