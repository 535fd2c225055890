use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required configuration value is missing or malformed.
    #[error("configuration error: {variable}: {message}")]
    Configuration { variable: String, message: String },

    #[error("unable to resolve {kind} `{name}` for step `{step}`")]
    Resolution {
        step: String,
        kind: String,
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid arguments: {0}")]
    ArgumentContract(String),

    /// The top-level manifest (or the run detail embedding it) cannot be used.
    #[error("malformed manifest for run `{run_id}`: {message}")]
    ManifestParse { run_id: String, message: String },

    #[error("unable to decode artifact: {0}")]
    ArtifactDecode(String),

    #[error("unable to fetch artifact `{artifact}` of node `{node_id}`")]
    ArtifactFetch {
        node_id: String,
        artifact: String,
        #[source]
        source: BoxError,
    },

    #[error("run status building failed for run `{run_id}`")]
    StatusBuild {
        run_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("unable to serialize kwargs for step `{step}`")]
    Encode {
        step: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("engine request to {url} failed: {message}")]
    Http { url: String, message: String },
}

impl Error {
    pub(crate) fn missing(variable: &str) -> Self {
        Error::Configuration {
            variable: variable.to_string(),
            message: "environment variable is not set".to_string(),
        }
    }
}
