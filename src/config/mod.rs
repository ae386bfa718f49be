use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::api::openai::DEFAULT_BASE_URL;
use crate::cache::DEFAULT_RETRY_BUDGET;
use crate::error::{Error, Result};
use crate::pilot::{FunctionKind, PilotDefinition};
use crate::runs::RunPolicy;

/// Environment variable consulted when `api_key` is absent.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// API key: plain text or an env-var reference like `$OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL of the remote API.  Defaults to the public OpenAI endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pilots: Vec<PilotDefinition>,
}

/// Run polling and ceilings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-wait ceiling before an unchanged status is handed back.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Hard ceiling on the total duration of one run.
    #[serde(default = "default_max_run_secs")]
    pub max_run_secs: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: usize,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_wait_timeout_secs() -> u64 {
    120
}

fn default_max_run_secs() -> u64 {
    600
}

fn default_max_polls() -> usize {
    2000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_secs: default_wait_timeout_secs(),
            max_run_secs: default_max_run_secs(),
            max_polls: default_max_polls(),
        }
    }
}

impl RunConfig {
    pub fn policy(&self) -> RunPolicy {
        RunPolicy {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            wait_timeout: Duration::from_secs(self.wait_timeout_secs),
            max_run_duration: Duration::from_secs(self.max_run_secs),
            max_polls: self.max_polls,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Attempts per cache operation before giving up.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: usize,
}

fn default_retry_budget() -> usize {
    DEFAULT_RETRY_BUDGET
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
        }
    }
}

/// `<pilotwire_home>/config.yaml`.
pub fn default_path() -> PathBuf {
    crate::pilotwire_home().join("config.yaml")
}

impl Config {
    /// Read, parse and validate a YAML config file.
    ///
    /// A relative `config.yaml` that does not exist falls back to the one in
    /// the pilotwire home directory.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let filename = path.file_name().and_then(|f| f.to_str());
                let eligible = filename == Some("config.yaml") && path.is_relative();
                let home_path = default_path();
                match tokio::fs::read_to_string(&home_path).await {
                    Ok(c) if eligible => {
                        tracing::warn!(
                            attempted = %path.display(),
                            found = %home_path.display(),
                            "config file not found, falling back to pilotwire home"
                        );
                        c
                    }
                    _ => {
                        return Err(e).with_context(|| {
                            format!("failed to read config file: {}", path.display())
                        })
                    }
                }
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file: {}", path.display()))
            }
        };

        let config = Self::from_yaml_str(&contents)?;
        tracing::debug!(
            path = %path.display(),
            pilots = config.pilots.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Config> {
        let config: Config =
            serde_yaml_ng::from_str(contents).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut names: Vec<String> = Vec::with_capacity(self.pilots.len());
        for pilot in &self.pilots {
            if pilot.name.trim().is_empty() {
                anyhow::bail!("config: pilot with an empty name");
            }
            let lowered = pilot.name.to_lowercase();
            if names.contains(&lowered) {
                anyhow::bail!("config: duplicate pilot name '{}'", pilot.name);
            }
            names.push(lowered);

            for function in &pilot.functions {
                if function.kind == FunctionKind::Function && function.method_full_name.is_empty()
                {
                    anyhow::bail!(
                        "config: pilot '{}' has a function entry without a method",
                        pilot.name
                    );
                }
            }
        }

        if self.run.poll_interval_ms == 0 {
            anyhow::bail!("config: run.poll_interval_ms must be greater than zero");
        }
        if self.run.wait_timeout_secs == 0 || self.run.max_run_secs == 0 || self.run.max_polls == 0
        {
            anyhow::bail!("config: run timeouts and max_polls must be greater than zero");
        }
        if self.cache.retry_budget == 0 {
            anyhow::bail!("config: cache.retry_budget must be greater than zero");
        }
        Ok(())
    }

    /// Resolve the API key: config value (or `$VAR` reference), then the
    /// `OPENAI_API_KEY` environment variable.
    pub fn resolve_api_key(&self) -> Result<String> {
        let key = match self.api_key.as_deref() {
            Some(k) => match k.strip_prefix('$') {
                Some(var) => std::env::var(var).unwrap_or_default(),
                None => k.to_string(),
            },
            None => std::env::var(API_KEY_ENV).unwrap_or_default(),
        };
        if key.trim().is_empty() {
            return Err(Error::Config(
                "no API key configured (set api_key or OPENAI_API_KEY)".into(),
            ));
        }
        Ok(key)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }
}
