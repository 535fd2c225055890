pub mod artifact;
pub mod client;
pub mod config;
pub mod encoder;
pub mod error;
pub mod graph;
pub mod logging;
pub mod manifest;
pub mod params;
pub mod state;
pub mod status;

pub use artifact::{decode_artifact, ArtifactValue};
pub use client::KfpClient;
pub use config::RuntimeConfig;
pub use encoder::{
    encode_step, ExecutableKind, ExecutableLookup, ExecutableRef, InvocationParams, Kwarg,
    PipelineParam, StepDescriptor, StepRequest, LABEL_PREFIX,
};
pub use error::{Error, Result};
pub use graph::{build_graph, ArtifactFetcher, BuildOptions, GraphBuild, GraphNode, NodeWarning};
pub use logging::{CaptureSink, LogSink, Logger};
pub use manifest::{ExecutionResult, RunManifest};
pub use params::{normalize_params, Param};
pub use state::{map_state, State};
pub use status::{compose_status, RunStatusDocument};
