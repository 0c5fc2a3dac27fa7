//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Galaxy connection configuration.
#[derive(Debug, Clone)]
pub struct GalaxyConfig {
    /// Base URL of the Galaxy server, without the `/api` suffix.
    pub url: String,
    /// API key sent with every request.
    pub api_key: SecretString,
    /// Timeout of a single HTTP request.
    pub request_timeout: Duration,
    /// Pause between status polls while waiting for a run or upload.
    pub wait_interval: Duration,
    /// Give up waiting after this long.
    pub max_wait: Duration,
}

impl GalaxyConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.into()),
            request_timeout: Duration::from_secs(60),
            wait_interval: Duration::from_secs(3),
            max_wait: Duration::from_secs(12 * 3600), // 12 hours
        }
    }

    /// Read `GALAXY_URL` and `GALAXY_API_KEY`, plus the optional
    /// `NOVA_GALAXY_WAIT_INTERVAL_SECS` and `NOVA_GALAXY_MAX_WAIT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        let mut config = Self::new(required("GALAXY_URL")?, required("GALAXY_API_KEY")?);

        if let Some(secs) = seconds(&lookup, "NOVA_GALAXY_WAIT_INTERVAL_SECS")? {
            config.wait_interval = secs;
        }
        if let Some(secs) = seconds(&lookup, "NOVA_GALAXY_MAX_WAIT_SECS")? {
            config.max_wait = secs;
        }
        Ok(config)
    }
}

fn seconds<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|s| Some(Duration::from_secs(s)))
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?} is not a number of seconds: {e}"),
        })
}

/// Tool runner polling configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Pause between state polls of a started tool.
    pub poll_interval: Duration,
    /// Stop following a run after this many polls.
    pub max_polls: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_polls: 3600,
        }
    }
}
