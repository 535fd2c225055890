use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

pub const ENV_PROJECT: &str = "PROJECT_NAME";
pub const ENV_STEP_IMAGE: &str = "DHCORE_WORKFLOW_IMAGE";
pub const ENV_FETCH_CONCURRENCY: &str = "KFP_ARTIFACT_CONCURRENCY";
pub const ENV_FETCH_TIMEOUT: &str = "KFP_ARTIFACT_TIMEOUT";
pub const ENV_ENDPOINT: &str = "KFP_ENDPOINT";

pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime settings handed explicitly to the encoder, the composer and the
/// engine client.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub project: Option<String>,
    pub step_image: Option<String>,
    pub fetch_concurrency: usize,
    pub fetch_timeout: Duration,
    pub endpoint: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            project: None,
            step_image: None,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            endpoint: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any key/value source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let fetch_concurrency = match read(ENV_FETCH_CONCURRENCY) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    return Err(Error::Configuration {
                        variable: ENV_FETCH_CONCURRENCY.to_string(),
                        message: format!("expected a positive integer, got `{raw}`"),
                    })
                }
            },
            None => DEFAULT_FETCH_CONCURRENCY,
        };

        let fetch_timeout = match read(ENV_FETCH_TIMEOUT) {
            Some(raw) => {
                humantime::parse_duration(raw.trim()).map_err(|err| Error::Configuration {
                    variable: ENV_FETCH_TIMEOUT.to_string(),
                    message: format!("invalid duration `{raw}`: {err}"),
                })?
            }
            None => DEFAULT_FETCH_TIMEOUT,
        };

        Ok(Self {
            project: read(ENV_PROJECT),
            step_image: read(ENV_STEP_IMAGE),
            fetch_concurrency,
            fetch_timeout,
            endpoint: read(ENV_ENDPOINT),
        })
    }

    pub fn require_project(&self) -> Result<&str> {
        self.project
            .as_deref()
            .ok_or_else(|| Error::missing(ENV_PROJECT))
    }

    pub fn require_step_image(&self) -> Result<&str> {
        self.step_image
            .as_deref()
            .ok_or_else(|| Error::missing(ENV_STEP_IMAGE))
    }

    pub fn require_endpoint(&self) -> Result<&str> {
        self.endpoint
            .as_deref()
            .ok_or_else(|| Error::missing(ENV_ENDPOINT))
    }
}
