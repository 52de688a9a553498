//! Configuration management for toykit
//!
//! Tunables of the event loop core are loaded from a TOML file. Every
//! section falls back to its defaults, so an empty file is a valid
//! configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration struct containing all toolkit settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolkitConfig {
    /// Timer-driven UI pacing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Keyboard repeat defaults (used until the server sends repeat info)
    #[serde(default)]
    pub keyboard: KeyboardConfig,

    /// Clipboard and drag-and-drop transfers
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Window allocation limits
    #[serde(default)]
    pub window: WindowConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Cursor frames longer than this are paced by a timer instead of
    /// presentation callbacks (milliseconds)
    pub cursor_frame_threshold_ms: u32,

    /// Pointer rest time before a tooltip is shown (milliseconds)
    pub tooltip_delay_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeyboardConfig {
    /// Repeats per second, 0 disables repeat
    pub repeat_rate: u32,

    /// Delay before the first repeat (milliseconds)
    pub repeat_delay_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum bytes delivered per readiness notification
    pub read_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    /// Minimum width of a framed window (pixels)
    pub min_width: i32,

    /// Minimum height of a framed window (pixels)
    pub min_height: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter ("error", "warn", "info", "debug", "trace"),
    /// overridden by RUST_LOG
    pub level: String,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cursor_frame_threshold_ms: 100,
            tooltip_delay_ms: 500,
        }
    }
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            repeat_rate: 40,
            repeat_delay_ms: 400,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 4096,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            min_width: 200,
            min_height: 200,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TimingConfig {
    pub fn cursor_frame_threshold(&self) -> Duration {
        Duration::from_millis(u64::from(self.cursor_frame_threshold_ms))
    }

    pub fn tooltip_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.tooltip_delay_ms))
    }
}

/// Largest chunk a single read may deliver
pub const MAX_READ_CHUNK: usize = 1024 * 1024;

const VALID_LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

impl ToolkitConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: ToolkitConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.transfer.read_chunk_size == 0 || self.transfer.read_chunk_size > MAX_READ_CHUNK {
            anyhow::bail!(
                "Invalid read_chunk_size {}: must be between 1 and {}",
                self.transfer.read_chunk_size,
                MAX_READ_CHUNK
            );
        }

        if self.window.min_width <= 0 || self.window.min_height <= 0 {
            anyhow::bail!(
                "Invalid minimum window size {}x{}: both dimensions must be positive",
                self.window.min_width,
                self.window.min_height
            );
        }

        if self.timing.cursor_frame_threshold_ms > 10_000 {
            anyhow::bail!("Invalid cursor_frame_threshold_ms: must be at most 10000");
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Merge a partial configuration into this one
    /// Sections of the partial config that differ from the defaults win
    pub fn merge_partial(mut self, partial: ToolkitConfig) -> Self {
        let default_config = ToolkitConfig::default();

        if partial.timing != default_config.timing {
            self.timing = partial.timing;
        }
        if partial.keyboard != default_config.keyboard {
            self.keyboard = partial.keyboard;
        }
        if partial.transfer != default_config.transfer {
            self.transfer = partial.transfer;
        }
        if partial.window != default_config.window {
            self.window = partial.window;
        }
        if partial.logging != default_config.logging {
            self.logging = partial.logging;
        }

        self
    }
}
