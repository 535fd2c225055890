//! Builds the container step handed to the engine for one function or
//! workflow execution.
//!
//! The four pod labels written here are the only link between a submitted
//! step and the graph later rebuilt from the run manifest, see
//! [`crate::graph`].

use std::fmt;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};

/// Prefix of every label the encoder writes and the graph builder reads.
pub const LABEL_PREFIX: &str = "kfp-digitalhub-runtime-";

const STEP_INTERPRETER: &str = "python";
const STEP_ENTRYPOINT: &str = "step.py";
const RUN_ID_OUTPUT: &str = "run_id";
const RUN_ID_PATH: &str = "/tmp/run_id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutableKind {
    Function,
    Workflow,
}

impl ExecutableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutableKind::Function => "function",
            ExecutableKind::Workflow => "workflow",
        }
    }
}

impl fmt::Display for ExecutableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved platform executable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutableRef {
    pub kind: ExecutableKind,
    pub name: String,
    pub id: String,
    /// Project-qualified key, e.g. `store://demo/function/python/myfunc:abc`.
    pub key: String,
    /// Entity type tag used in label keys, normally `function` or `workflow`.
    pub entity_type: String,
}

pub trait ExecutableLookup {
    fn resolve(
        &self,
        kind: ExecutableKind,
        name: &str,
        project: &str,
        id: Option<&str>,
    ) -> anyhow::Result<ExecutableRef>;
}

impl<F> ExecutableLookup for F
where
    F: Fn(ExecutableKind, &str, &str, Option<&str>) -> anyhow::Result<ExecutableRef>,
{
    fn resolve(
        &self,
        kind: ExecutableKind,
        name: &str,
        project: &str,
        id: Option<&str>,
    ) -> anyhow::Result<ExecutableRef> {
        (self)(kind, name, project, id)
    }
}

/// Deferred pipeline parameter, resolved by the engine at run time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineParam {
    pub name: String,
    /// Producing step, `None` for pipeline-level inputs.
    pub op_name: Option<String>,
}

impl PipelineParam {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_name: None,
        }
    }

    pub fn output(op_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_name: Some(op_name.into()),
        }
    }
}

impl fmt::Display for PipelineParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{{pipelineparam:op={};name={}}}}}",
            self.op_name.as_deref().unwrap_or(""),
            self.name
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Kwarg {
    Value(Value),
    Param(PipelineParam),
}

impl Kwarg {
    fn is_null(&self) -> bool {
        matches!(self, Kwarg::Value(Value::Null))
    }
}

impl Serialize for Kwarg {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Kwarg::Value(value) => value.serialize(serializer),
            Kwarg::Param(param) => serializer.collect_str(param),
        }
    }
}

impl From<Value> for Kwarg {
    fn from(value: Value) -> Self {
        Kwarg::Value(value)
    }
}

impl From<PipelineParam> for Kwarg {
    fn from(param: PipelineParam) -> Self {
        Kwarg::Param(param)
    }
}

impl From<&str> for Kwarg {
    fn from(value: &str) -> Self {
        Kwarg::Value(Value::String(value.to_string()))
    }
}

/// Execution keyword arguments, kept in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvocationParams {
    entries: Vec<(String, Kwarg)>,
}

impl InvocationParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Kwarg>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Kwarg>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Kwarg> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for InvocationParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// What the caller wants to run as a step.
#[derive(Clone, Debug, Default)]
pub struct StepRequest {
    pub name: String,
    pub action: String,
    pub function: Option<String>,
    pub function_id: Option<String>,
    pub workflow: Option<String>,
    pub workflow_id: Option<String>,
    pub kwargs: InvocationParams,
    pub step_outputs: Vec<String>,
}

impl StepRequest {
    pub fn function(
        name: impl Into<String>,
        action: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            function: Some(function.into()),
            ..Self::default()
        }
    }

    pub fn workflow(
        name: impl Into<String>,
        action: impl Into<String>,
        workflow: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            workflow: Some(workflow.into()),
            ..Self::default()
        }
    }

    /// Pin the entity id of whichever executable was selected.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = Some(id.into());
        if self.workflow.is_some() && self.function.is_none() {
            self.workflow_id = id;
        } else {
            self.function_id = id;
        }
        self
    }

    pub fn with_kwargs(mut self, kwargs: InvocationParams) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.step_outputs.push(output.into());
        self
    }

    fn target(&self) -> Result<(ExecutableKind, &str, Option<&str>)> {
        match (&self.function, &self.workflow) {
            (Some(function), None) => Ok((
                ExecutableKind::Function,
                function.as_str(),
                self.function_id.as_deref(),
            )),
            (None, Some(workflow)) => Ok((
                ExecutableKind::Workflow,
                workflow.as_str(),
                self.workflow_id.as_deref(),
            )),
            (None, None) => Err(Error::ArgumentContract(format!(
                "step `{}`: either function or workflow must be provided",
                self.name
            ))),
            (Some(_), Some(_)) => Err(Error::ArgumentContract(format!(
                "step `{}`: function and workflow are mutually exclusive",
                self.name
            ))),
        }
    }
}

/// A fully built step: command, image, file outputs and pod labels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepDescriptor {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(serialize_with = "ordered_pairs")]
    pub file_outputs: Vec<(String, String)>,
    #[serde(serialize_with = "ordered_pairs")]
    pub labels: Vec<(String, String)>,
}

fn ordered_pairs<S: Serializer>(
    pairs: &[(String, String)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(pairs.len()))?;
    for (key, value) in pairs {
        map.serialize_entry(key, value)?;
    }
    map.end()
}

impl StepDescriptor {
    pub fn label(&self, key: &str) -> Option<&str> {
        lookup_pair(&self.labels, key)
    }

    pub fn file_output(&self, name: &str) -> Option<&str> {
        lookup_pair(&self.file_outputs, name)
    }

    /// Render as an Argo container template. Output parameters follow the
    /// engine's `<step>-<output>` naming, which is also the artifact name the
    /// graph builder asks for.
    pub fn to_container_op(&self) -> Value {
        let labels: Map<String, Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let parameters: Vec<Value> = self
            .file_outputs
            .iter()
            .map(|(output, path)| {
                json!({
                    "name": format!("{}-{}", self.name, output),
                    "valueFrom": { "path": path }
                })
            })
            .collect();
        json!({
            "name": self.name,
            "container": {
                "image": self.image,
                "command": self.command
            },
            "outputs": { "parameters": parameters },
            "metadata": { "labels": labels }
        })
    }
}

fn lookup_pair<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub(crate) fn sanitize_output_name(name: &str) -> String {
    name.replace('.', "_")
}

pub fn encode_step(
    request: &StepRequest,
    lookup: &dyn ExecutableLookup,
    config: &RuntimeConfig,
) -> Result<StepDescriptor> {
    let (kind, target, target_id) = request.target()?;
    let project = config.require_project()?;
    let image = config.require_step_image()?;

    let entity = lookup
        .resolve(kind, target, project, target_id)
        .map_err(|err| Error::Resolution {
            step: request.name.clone(),
            kind: kind.to_string(),
            name: target.to_string(),
            source: err.into(),
        })?;

    let mut exec_kwargs = InvocationParams::new();
    for (key, value) in &request.kwargs.entries {
        if !value.is_null() {
            exec_kwargs.insert(key.clone(), value.clone());
        }
    }
    exec_kwargs.insert("action", request.action.as_str());
    exec_kwargs.insert("wait", Value::Bool(true));
    let kwargs_json = serde_json::to_string(&exec_kwargs).map_err(|source| Error::Encode {
        step: request.name.clone(),
        source,
    })?;

    let command = vec![
        STEP_INTERPRETER.to_string(),
        STEP_ENTRYPOINT.to_string(),
        "--entity".to_string(),
        entity.key.clone(),
        "--kwargs".to_string(),
        kwargs_json,
    ];

    let mut file_outputs = vec![(RUN_ID_OUTPUT.to_string(), RUN_ID_PATH.to_string())];
    for output in &request.step_outputs {
        let name = sanitize_output_name(output);
        if name == RUN_ID_OUTPUT {
            return Err(Error::ArgumentContract(format!(
                "step `{}`: output `{output}` collides with the reserved `{RUN_ID_OUTPUT}` output",
                request.name
            )));
        }
        let path = format!("/tmp/entity_{name}");
        match file_outputs.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = path,
            None => file_outputs.push((name, path)),
        }
    }

    let labels = vec![
        (format!("{LABEL_PREFIX}project"), project.to_string()),
        (
            format!("{LABEL_PREFIX}{}", entity.entity_type),
            entity.name.clone(),
        ),
        (
            format!("{LABEL_PREFIX}{}_id", entity.entity_type),
            entity.id.clone(),
        ),
        (format!("{LABEL_PREFIX}action"), request.action.clone()),
    ];

    Ok(StepDescriptor {
        name: request.name.clone(),
        image: image.to_string(),
        command,
        file_outputs,
        labels,
    })
}
