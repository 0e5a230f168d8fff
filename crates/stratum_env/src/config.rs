//! Environment configuration.
//!
//! Settings can be overridden per location through a properties file named
//! `exodus.properties` placed alongside the log. The file uses simple
//! `key=value` lines; `#` starts a comment.

use crate::error::{EnvError, EnvResult};
use std::path::Path;
use std::time::Duration;
use stratum_bindings::InternStrategy;
use tracing::warn;

/// File name of the per-location settings overlay.
pub const PROPERTIES_FILE: &str = "exodus.properties";

/// Configuration for opening an environment.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Age after which a live transaction is reported as stuck.
    /// `Duration::ZERO` disables the monitor.
    pub transaction_timeout: Duration,

    /// Whether `close` may proceed while transactions are live.
    pub close_forcedly: bool,

    /// Upper bound, in bytes, for a single tree page written to the log.
    pub tree_max_page_size: usize,

    /// Interning strategy for decoded string entries.
    pub interner: InternStrategy,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::ZERO, // monitor disabled
            close_forcedly: false,
            tree_max_page_size: 4096,
            interner: InternStrategy::None,
        }
    }
}

impl EnvironmentConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stuck-transaction timeout.
    #[must_use]
    pub const fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets whether close may proceed with live transactions.
    #[must_use]
    pub const fn close_forcedly(mut self, value: bool) -> Self {
        self.close_forcedly = value;
        self
    }

    /// Sets the maximum tree page size in bytes.
    #[must_use]
    pub const fn tree_max_page_size(mut self, size: usize) -> Self {
        self.tree_max_page_size = size;
        self
    }

    /// Sets the string interning strategy.
    #[must_use]
    pub const fn interner(mut self, strategy: InternStrategy) -> Self {
        self.interner = strategy;
        self
    }

    /// Applies overrides from the properties file at `path`, if it exists.
    ///
    /// Recognized keys: `envMonitorTxnsTimeout` (milliseconds),
    /// `envCloseForcedly`, `treeMaxPageSize`, `bindings.interner`
    /// (`java` or `xodus` select the pooled interner, anything else
    /// disables interning). Unknown keys are skipped with a warning.
    pub fn apply_properties_file(&mut self, path: &Path) -> EnvResult<()> {
        if !path.is_file() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|err| EnvError::Log(stratum_log::LogError::Io(err)))?;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(EnvError::invalid_config(format!(
                    "malformed properties line: '{line}'"
                )));
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "envMonitorTxnsTimeout" => {
                    let millis: u64 = value.parse().map_err(|_| {
                        EnvError::invalid_config(format!("envMonitorTxnsTimeout: '{value}'"))
                    })?;
                    self.transaction_timeout = Duration::from_millis(millis);
                }
                "envCloseForcedly" => {
                    self.close_forcedly = parse_bool(key, value)?;
                }
                "treeMaxPageSize" => {
                    self.tree_max_page_size = value.parse().map_err(|_| {
                        EnvError::invalid_config(format!("treeMaxPageSize: '{value}'"))
                    })?;
                }
                "bindings.interner" => {
                    self.interner = if value.eq_ignore_ascii_case("java")
                        || value.eq_ignore_ascii_case("xodus")
                    {
                        InternStrategy::Pooled
                    } else {
                        InternStrategy::None
                    };
                }
                unknown => {
                    warn!(key = unknown, "skipping unknown environment setting");
                }
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> EnvResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(EnvError::invalid_config(format!("{key}: '{other}'"))),
    }
}
