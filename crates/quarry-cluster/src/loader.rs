//! Configuration loader with multi-source merging

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::RunnerConfig;

/// Project configuration file name.
pub const PROJECT_CONFIG_FILE: &str = "quarry.toml";

/// Local (uncommitted) override file name.
pub const LOCAL_CONFIG_FILE: &str = "quarry.local.toml";

/// Configuration loader with builder pattern
///
/// Sources, lowest precedence first:
/// 1. [`RunnerConfig::default`]
/// 2. `quarry.toml` in the project directory
/// 3. `quarry.local.toml` in the project directory
/// 4. `QUARRY_*` environment variables, `__` separating nested keys
///    (`QUARRY_NODE_COUNT=5`, `QUARRY_INDEX_DEFAULTS__REPLICAS=0`)
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "QUARRY".to_string(),
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "QUARRY")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<RunnerConfig> {
        let mut builder = config::Config::builder();

        let defaults = RunnerConfig::default();
        builder = builder.add_source(
            config::Config::try_from(&defaults).context("Failed to encode default configuration")?,
        );

        for file in [PROJECT_CONFIG_FILE, LOCAL_CONFIG_FILE] {
            let path = self.project_dir.join(file);
            if path.exists() {
                builder = builder.add_source(
                    config::File::from(path)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut runner_config: RunnerConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Relative base paths are relative to the project, not the cwd.
        if let Some(base) = runner_config.base_path.take() {
            runner_config.base_path = Some(if base.is_relative() {
                self.project_dir.join(base)
            } else {
                base
            });
        }

        Ok(runner_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> RunnerConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
