use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::orchestration::RetryPolicy;
use crate::{Error, Result};

/// Orchestrator configuration, read from `~/.glassdome/glassdome.toml`.
///
/// Every section is optional; a missing file yields the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Per-target overrides keyed by platform target.
    #[serde(default)]
    pub platforms: HashMap<String, PlatformLimits>,
    /// Where deployment records are kept. Defaults to `~/.glassdome/deployments`.
    pub state_dir: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Cap on simultaneous platform operations within one deployment.
    pub max_concurrent_operations: usize,
    /// Deadline for a single platform call.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 8,
            operation_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PlatformLimits {
    /// Global cap shared by every deployment targeting this platform.
    pub max_concurrent_operations: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub debug: bool,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Config {
    pub fn glassdome_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".glassdome"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::glassdome_dir()?.join("glassdome.toml"))
    }

    /// Directory holding one JSON record per deployment.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::glassdome_dir()?.join("deployments")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_concurrent = config.orchestrator.max_concurrent_operations,
            timeout = ?config.orchestrator.operation_timeout,
            max_attempts = config.orchestrator.retry.max_attempts,
            platforms = config.platforms.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                debug!(dir = %parent.display(), "creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_concurrent_operations == 0 {
            return Err(Error::Validation(
                "orchestrator.max_concurrent_operations must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.operation_timeout.is_zero() {
            return Err(Error::Validation(
                "orchestrator.operation_timeout must be non-zero".to_string(),
            ));
        }
        if self.orchestrator.retry.max_attempts == 0 {
            return Err(Error::Validation(
                "orchestrator.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.retry.multiplier < 1.0 {
            return Err(Error::Validation(
                "orchestrator.retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        for (target, limits) in &self.platforms {
            match limits.max_concurrent_operations {
                Some(0) => {
                    return Err(Error::Validation(format!(
                        "platforms.{}.max_concurrent_operations must be at least 1",
                        target
                    )));
                }
                Some(max) if max > Semaphore::MAX_PERMITS => {
                    return Err(Error::Validation(format!(
                        "platforms.{}.max_concurrent_operations must be at most {}",
                        target,
                        Semaphore::MAX_PERMITS
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
