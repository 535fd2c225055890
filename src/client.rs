use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::graph::{ArtifactFetcher, BuildOptions};
use crate::logging::Logger;
use crate::manifest::ExecutionResult;
use crate::status::{compose_status, RunStatusDocument};

const API_PREFIX: &str = "apis/v1beta1";

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Deserialize)]
struct ReadArtifactResponse {
    #[serde(default)]
    data: Option<String>,
}

/// Blocking client for the KFP v1beta1 run and artifact endpoints.
#[derive(Clone)]
pub struct KfpClient {
    base_url: String,
    agent: ureq::Agent,
    logger: Logger,
}

impl KfpClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            logger: Logger::default().with_tag("component", "client"),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Ok(Self::new(config.require_endpoint()?, config.fetch_timeout))
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger.with_tag("component", "client");
        self
    }

    fn url(&self, segments: &[&str]) -> String {
        let mut url = format!("{}/{}", self.base_url, API_PREFIX);
        for segment in segments {
            url.push('/');
            url.push_str(&utf8_percent_encode(segment, PATH_SEGMENT).to_string());
        }
        url
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.logger.debug("engine request", Some(json!({ "url": url })));
        let response = self.agent.get(url).call().map_err(|err| match err {
            ureq::Error::Status(code, response) => Error::Http {
                url: url.to_string(),
                message: format!(
                    "status {code}: {}",
                    response.into_string().unwrap_or_default().trim()
                ),
            },
            ureq::Error::Transport(transport) => Error::Http {
                url: url.to_string(),
                message: transport.to_string(),
            },
        })?;
        response.into_json::<T>().map_err(|err| Error::Http {
            url: url.to_string(),
            message: format!("invalid response body: {err}"),
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<ExecutionResult> {
        self.get_json(&self.url(&["runs", run_id]))
    }

    /// Base64 payload of a node artifact.
    pub fn read_artifact(&self, run_id: &str, node_id: &str, artifact_name: &str) -> Result<String> {
        let mut url = self.url(&["runs", run_id, "nodes", node_id, "artifacts", artifact_name]);
        url.push_str(":read");
        let body: ReadArtifactResponse = self.get_json(&url)?;
        body.data.ok_or_else(|| Error::ArtifactFetch {
            node_id: node_id.to_string(),
            artifact: artifact_name.to_string(),
            source: "engine returned no artifact data".into(),
        })
    }

    /// Fetch a run and compose its status document, reading run-id
    /// artifacts through this client.
    pub fn run_status(&self, run_id: &str, options: &BuildOptions) -> Result<RunStatusDocument> {
        let execution = self.get_run(run_id).map_err(|err| Error::StatusBuild {
            run_id: run_id.to_string(),
            source: Box::new(err),
        })?;
        let fetcher: Arc<dyn ArtifactFetcher> = Arc::new(self.clone());
        compose_status(None, Some(&execution), Some(fetcher), options)
    }
}

impl ArtifactFetcher for KfpClient {
    fn fetch(&self, run_id: &str, node_id: &str, artifact_name: &str) -> anyhow::Result<String> {
        Ok(self.read_artifact(run_id, node_id, artifact_name)?)
    }
}
