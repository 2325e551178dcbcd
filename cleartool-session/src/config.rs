//! Configuration for the interactive tool session.
//!
//! All settings have defaults, can be deserialized from JSON and can be
//! overridden from the environment.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`ToolConfig::executable`].
pub const ENV_EXECUTABLE: &str = "CLEARTOOL_EXECUTABLE";
/// Environment variable overriding [`ToolConfig::suppression_file`].
pub const ENV_SUPPRESSION_FILE: &str = "CLEARTOOL_SUPPRESSION_FILE";
/// Environment variable overriding [`ToolConfig::mockup_root`].
pub const ENV_MOCKUP_ROOT: &str = "CLEARTOOL_MOCKUP_ROOT";
/// Environment variable overriding [`ToolConfig::idle_timeout_ms`].
pub const ENV_IDLE_TIMEOUT_MS: &str = "CLEARTOOL_IDLE_TIMEOUT_MS";
/// Environment variable overriding [`ToolConfig::single_use`].
pub const ENV_SINGLE_USE: &str = "CLEARTOOL_SINGLE_USE";

/// Token written after every command. The tool does not know it, so it
/// answers with an "unrecognized command" diagnostic on stderr that echoes
/// the token back, which marks the end of the previous command's response.
pub const DEFAULT_SENTINEL: &str = "ct_sentinel_7f3a9c2e5b1d48a6b0e4d1c93a57f208";

/// Settings for spawning and talking to the interactive tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Executable to spawn.
    pub executable: String,
    /// Arguments that put the tool into interactive mode.
    pub args: Vec<String>,
    /// End-of-response token; must never appear in genuine tool output.
    pub sentinel: String,
    /// Instruction that makes the tool exit.
    pub quit_instruction: String,
    /// Instruction prefix that changes the tool's working directory.
    pub cd_instruction: String,
    /// Idle timeout for a command, reset on every byte of progress.
    pub idle_timeout_ms: u64,
    /// Timeout of the liveness probe.
    pub probe_timeout_ms: u64,
    /// Timeout of the readiness probe right after spawning.
    pub startup_timeout_ms: u64,
    /// How long `quit` waits for the process to exit.
    pub quit_timeout_ms: u64,
    /// Discard the session after every command.
    pub single_use: bool,
    /// File with one regular expression per line; matching messages are not reported.
    pub suppression_file: Option<PathBuf>,
    /// When set, an in-process mockup of the tool rooted here replaces the real process.
    pub mockup_root: Option<PathBuf>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            executable: "cleartool".to_string(),
            args: Vec::new(),
            sentinel: DEFAULT_SENTINEL.to_string(),
            quit_instruction: "quit".to_string(),
            cd_instruction: "cd".to_string(),
            idle_timeout_ms: 60_000,
            probe_timeout_ms: 2_000,
            startup_timeout_ms: 30_000,
            quit_timeout_ms: 5_000,
            single_use: false,
            suppression_file: None,
            mockup_root: None,
        }
    }
}

impl ToolConfig {
    /// Load a JSON configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup, e.g. `std::env::var`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(executable) = lookup(ENV_EXECUTABLE).filter(|v| !v.is_empty()) {
            self.executable = executable;
        }
        if let Some(path) = lookup(ENV_SUPPRESSION_FILE).filter(|v| !v.is_empty()) {
            self.suppression_file = Some(PathBuf::from(path));
        }
        if let Some(root) = lookup(ENV_MOCKUP_ROOT).filter(|v| !v.is_empty()) {
            self.mockup_root = Some(PathBuf::from(root));
        }
        if let Some(ms) = lookup(ENV_IDLE_TIMEOUT_MS) {
            self.idle_timeout_ms = ms.trim().parse().map_err(|_| {
                Error::Config(format!("{ENV_IDLE_TIMEOUT_MS} is not a number: {ms:?}"))
            })?;
        }
        if let Some(flag) = lookup(ENV_SINGLE_USE) {
            self.single_use = matches!(flag.trim(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sentinel.trim().is_empty() {
            return Err(Error::Config("sentinel must not be empty".into()));
        }
        if self.sentinel.contains(['\n', '\r']) {
            return Err(Error::Config("sentinel must be a single line".into()));
        }
        if self.executable.is_empty() && self.mockup_root.is_none() {
            return Err(Error::Config("executable must not be empty".into()));
        }
        if self.idle_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn quit_timeout(&self) -> Duration {
        Duration::from_millis(self.quit_timeout_ms)
    }

    /// Name used in diagnostics.
    pub fn tool_name(&self) -> String {
        Path::new(&self.executable)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.clone())
    }
}
