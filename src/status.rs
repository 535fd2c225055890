use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::graph::{build_graph, ArtifactFetcher, BuildOptions, GraphNode, NodeWarning};
use crate::logging::current_timestamp;
use crate::manifest::{ExecutionResult, ManifestMetadata};
use crate::state::{map_state, State};

/// Run status reported back to the platform.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum RunStatusDocument {
    Execution { state: State, results: RunResults },
    /// Precomputed build payload, passed through untouched.
    Build { results: Value },
}

#[derive(Clone, Debug, Serialize)]
pub struct RunResults {
    pub metadata: ManifestMetadata,
    pub status: RunGraphStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunGraphStatus {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub last_update: String,
    pub progress: Option<String>,
    pub graph: Vec<GraphNode>,
    #[serde(skip)]
    pub warnings: Vec<NodeWarning>,
}

impl RunStatusDocument {
    pub fn state(&self) -> Option<State> {
        match self {
            RunStatusDocument::Execution { state, .. } => Some(*state),
            RunStatusDocument::Build { .. } => None,
        }
    }

    pub fn graph(&self) -> &[GraphNode] {
        match self {
            RunStatusDocument::Execution { results, .. } => results.status.graph.as_slice(),
            RunStatusDocument::Build { .. } => &[],
        }
    }

    /// Per-node problems recorded while decoding; never part of the document.
    pub fn warnings(&self) -> &[NodeWarning] {
        match self {
            RunStatusDocument::Execution { results, .. } => results.status.warnings.as_slice(),
            RunStatusDocument::Build { .. } => &[],
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Produce the run status document.
///
/// A supplied `build` always wins and is returned as-is. Otherwise the
/// execution result's manifest is decoded; any failure on that path is fatal
/// and reported as [`Error::StatusBuild`].
pub fn compose_status(
    build: Option<Value>,
    execution: Option<&ExecutionResult>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    options: &BuildOptions,
) -> Result<RunStatusDocument> {
    if let Some(results) = build {
        return Ok(RunStatusDocument::Build { results });
    }

    let logger = options.logger.with_tag("component", "status");
    let Some(execution) = execution else {
        let err = Error::StatusBuild {
            run_id: String::new(),
            source: Box::new(Error::ArgumentContract(
                "either a build result or an execution result must be provided".to_string(),
            )),
        };
        logger.error(&err.to_string(), None);
        return Err(err);
    };

    let run_id = execution.run.id.clone();
    convert_run(execution, fetcher, options).map_err(|err| {
        logger.error(
            "something went wrong during run status building",
            Some(json!({ "run": run_id, "error": err.to_string() })),
        );
        Error::StatusBuild {
            run_id: run_id.clone(),
            source: Box::new(err),
        }
    })
}

fn convert_run(
    execution: &ExecutionResult,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    options: &BuildOptions,
) -> Result<RunStatusDocument> {
    let manifest = execution.manifest()?;
    let state = map_state(execution.run.status.as_deref().unwrap_or_default());
    let graph = build_graph(&manifest, &execution.run.id, fetcher, options);

    let status = RunGraphStatus {
        start_time: manifest.status.started_at.clone(),
        end_time: manifest.status.finished_at.clone(),
        last_update: current_timestamp(),
        progress: manifest.status.progress.clone(),
        graph: graph.nodes,
        warnings: graph.warnings,
    };

    Ok(RunStatusDocument::Execution {
        state,
        results: RunResults {
            metadata: manifest.metadata,
            status,
        },
    })
}
