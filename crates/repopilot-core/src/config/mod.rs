//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for `executor.max_parallel`
pub const MAX_PARALLEL_LIMIT: usize = 32;

/// Hard ceiling on successive replans of one plan
pub const MAX_REPLANS: u32 = 2;

/// Repopilot engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub replanner: ReplanConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Width of the worker pool for a ready layer
    pub max_parallel: usize,
    /// Also enforce step timeouts when a layer has a single step
    pub inline_timeouts: bool,
    /// Timeout applied to generic fallback steps
    pub default_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanConfig {
    /// Replans allowed per original plan, at most [`MAX_REPLANS`]
    pub max_replans: u32,
    /// Ceiling when the timeout strategy doubles a step timeout
    pub max_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Append lifecycle events to this JSONL file
    pub jsonl_path: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            inline_timeouts: false,
            default_timeout_secs: 30,
        }
    }
}

impl Default for ReplanConfig {
    fn default() -> Self {
        Self {
            max_replans: 2,
            max_timeout_secs: 120,
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl ReplanConfig {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    /// Effective replan budget; never above [`MAX_REPLANS`]
    pub fn replan_limit(&self) -> u32 {
        self.max_replans.min(MAX_REPLANS)
    }
}

impl EngineConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("REPOPILOT_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("repopilot")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file, or defaults if absent
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_PARALLEL_LIMIT).contains(&self.executor.max_parallel) {
            return Err(anyhow!(
                "executor.max_parallel must be between 1 and {}",
                MAX_PARALLEL_LIMIT
            ));
        }
        if self.executor.default_timeout_secs == 0 {
            return Err(anyhow!("executor.default_timeout_secs must be positive"));
        }
        if self.replanner.max_replans > MAX_REPLANS {
            return Err(anyhow!("replanner.max_replans must be at most {}", MAX_REPLANS));
        }
        if self.replanner.max_timeout_secs == 0 {
            return Err(anyhow!("replanner.max_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "executor.max_parallel" => Ok(self.executor.max_parallel.to_string()),
            "executor.inline_timeouts" => Ok(self.executor.inline_timeouts.to_string()),
            "executor.default_timeout_secs" => Ok(self.executor.default_timeout_secs.to_string()),

            "replanner.max_replans" => Ok(self.replanner.max_replans.to_string()),
            "replanner.max_timeout_secs" => Ok(self.replanner.max_timeout_secs.to_string()),

            "events.jsonl_path" => Ok(self
                .events
                .jsonl_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(not set)".to_string())),

            _ => Err(anyhow!("Unknown configuration key: {}", key)),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "executor.max_parallel" => {
                let width: usize = value
                    .parse()
                    .with_context(|| format!("Invalid max_parallel value: {}", value))?;
                if !(1..=MAX_PARALLEL_LIMIT).contains(&width) {
                    return Err(anyhow!(
                        "max_parallel must be between 1 and {}",
                        MAX_PARALLEL_LIMIT
                    ));
                }
                self.executor.max_parallel = width;
            }
            "executor.inline_timeouts" => {
                self.executor.inline_timeouts = value
                    .parse()
                    .with_context(|| format!("Invalid inline_timeouts value: {}", value))?;
            }
            "executor.default_timeout_secs" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid default_timeout_secs value: {}", value))?;
                if secs == 0 {
                    return Err(anyhow!("default_timeout_secs must be positive"));
                }
                self.executor.default_timeout_secs = secs;
            }

            "replanner.max_replans" => {
                let replans: u32 = value
                    .parse()
                    .with_context(|| format!("Invalid max_replans value: {}", value))?;
                if replans > MAX_REPLANS {
                    return Err(anyhow!("max_replans must be at most {}", MAX_REPLANS));
                }
                self.replanner.max_replans = replans;
            }
            "replanner.max_timeout_secs" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid max_timeout_secs value: {}", value))?;
                if secs == 0 {
                    return Err(anyhow!("max_timeout_secs must be positive"));
                }
                self.replanner.max_timeout_secs = secs;
            }

            "events.jsonl_path" => {
                self.events.jsonl_path = if value.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }

            _ => {
                return Err(anyhow!("Unknown configuration key: {}", key));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "executor.max_parallel",
            "executor.inline_timeouts",
            "executor.default_timeout_secs",
            "replanner.max_replans",
            "replanner.max_timeout_secs",
            "events.jsonl_path",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Remove the config file at the default location
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
