//! Rebuilds the engine-agnostic execution graph from a run manifest.
//!
//! Node fields come straight from `status.nodes`; step provenance comes from
//! the labels of the container template sharing the node's display name; the
//! child run id comes from a per-node artifact fetched through an
//! [`ArtifactFetcher`]. Artifact failures only ever leave `run_id` unset.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};

use crate::artifact::{decode_artifact, ArtifactValue};
use crate::config::RuntimeConfig;
use crate::encoder::LABEL_PREFIX;
use crate::logging::Logger;
use crate::manifest::{NodeRecord, NodeType, RunManifest};
use crate::params::{normalize_params, Param};
use crate::state::{map_state, State};

const CANCEL_POLL: Duration = Duration::from_millis(25);
const RUN_ID_FIELD: &str = "run_id";

pub trait ArtifactFetcher: Send + Sync {
    /// Return the base64 payload of `artifact_name` produced by `node_id`.
    fn fetch(&self, run_id: &str, node_id: &str, artifact_name: &str) -> anyhow::Result<String>;
}

impl<F> ArtifactFetcher for F
where
    F: Fn(&str, &str, &str) -> anyhow::Result<String> + Send + Sync,
{
    fn fetch(&self, run_id: &str, node_id: &str, artifact_name: &str) -> anyhow::Result<String> {
        (self)(run_id, node_id, artifact_name)
    }
}

#[derive(Clone)]
pub struct BuildOptions {
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub cancellation: Arc<AtomicBool>,
    pub logger: Logger,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

impl BuildOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            concurrency: config.fetch_concurrency.max(1),
            fetch_timeout: config.fetch_timeout,
            cancellation: Arc::new(AtomicBool::new(false)),
            logger: Logger::default(),
        }
    }

    pub fn with_cancellation(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub children: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<Param>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Param>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<ArtifactValue>,
}

/// A field that could not be populated for one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeWarning {
    pub node_id: String,
    pub field: String,
    pub message: String,
}

impl NodeWarning {
    fn run_id(node_id: &str, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            field: RUN_ID_FIELD.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GraphBuild {
    pub nodes: Vec<GraphNode>,
    pub warnings: Vec<NodeWarning>,
}

struct FetchJob {
    slot: usize,
    node_id: String,
    artifact: String,
}

type FetchOutcome = Result<ArtifactValue, NodeWarning>;

pub fn build_graph(
    manifest: &RunManifest,
    run_id: &str,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    options: &BuildOptions,
) -> GraphBuild {
    let logger = options
        .logger
        .with_tag("component", "graph")
        .with_tag("run", run_id);

    let mut nodes: Vec<GraphNode> = manifest
        .nodes()
        .iter()
        .map(|(key, record)| graph_node(record.node_id(key), record, manifest))
        .collect();

    let jobs: Vec<FetchJob> = manifest
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, (_, record))| record.node_type == NodeType::Pod && record.outputs.is_some())
        .map(|(slot, (key, record))| FetchJob {
            slot,
            node_id: record.node_id(key).to_string(),
            artifact: format!("{}-run_id", record.display_name),
        })
        .collect();

    let mut warnings = Vec::new();
    match fetcher {
        Some(fetcher) if !jobs.is_empty() => {
            for (job, outcome) in jobs.iter().zip(resolve_run_ids(&jobs, run_id, fetcher, options)) {
                match outcome {
                    Ok(value) => nodes[job.slot].run_id = Some(value),
                    Err(warning) => warnings.push(warning),
                }
            }
        }
        Some(_) => {}
        None => logger.debug(
            "no artifact fetcher configured, run ids left unresolved",
            Some(json!({ "nodes": jobs.len() })),
        ),
    }

    for warning in &warnings {
        logger.warn(
            "could not get run_id artifact",
            Some(json!({
                "node": warning.node_id,
                "field": warning.field,
                "error": warning.message
            })),
        );
    }

    GraphBuild { nodes, warnings }
}

fn graph_node(id: &str, record: &NodeRecord, manifest: &RunManifest) -> GraphNode {
    let mut node = GraphNode {
        id: id.to_string(),
        name: record.name.clone(),
        display_name: record.display_name.clone(),
        node_type: record.node_type.clone(),
        children: record.children.clone().unwrap_or_default(),
        state: record.phase.as_deref().map(map_state),
        start_time: record.started_at.clone(),
        end_time: record.finished_at.clone(),
        exit_code: record.exit_code.clone().or_else(|| {
            record
                .outputs
                .as_ref()
                .and_then(|outputs| outputs.get("exitCode"))
                .cloned()
        }),
        inputs: record.inputs.as_ref().map(|block| normalize_params(Some(block))),
        outputs: record.outputs.as_ref().map(|block| normalize_params(Some(block))),
        function: None,
        function_id: None,
        workflow: None,
        workflow_id: None,
        action: None,
        run_id: None,
    };

    if let Some(template) = manifest.container_template(&record.display_name) {
        let label = |key: &str| {
            template
                .metadata
                .labels
                .get(&format!("{LABEL_PREFIX}{key}"))
                .cloned()
        };
        node.function = label("function");
        node.function_id = label("function_id");
        node.workflow = label("workflow");
        node.workflow_id = label("workflow_id");
        node.action = label("action");
    }
    node
}

/// Fetch and decode every job's artifact on a bounded pool of workers.
///
/// The returned outcomes line up with `jobs`. Jobs never started because of
/// cancellation come back as warnings.
fn resolve_run_ids(
    jobs: &[FetchJob],
    run_id: &str,
    fetcher: Arc<dyn ArtifactFetcher>,
    options: &BuildOptions,
) -> Vec<FetchOutcome> {
    let workers = options.concurrency.max(1).min(jobs.len());
    let slots = FetchSlots::new(options.concurrency);
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, FetchOutcome)>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let fetcher = Arc::clone(&fetcher);
            let next = &next;
            let slots = &slots;
            scope.spawn(move || loop {
                if options.is_cancelled() {
                    break;
                }
                let position = next.fetch_add(1, Ordering::SeqCst);
                let Some(job) = jobs.get(position) else {
                    break;
                };
                let outcome = fetch_run_id(job, run_id, &fetcher, slots, options);
                if tx.send((position, outcome)).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    let mut outcomes: Vec<Option<FetchOutcome>> = jobs.iter().map(|_| None).collect();
    for (position, outcome) in rx {
        outcomes[position] = Some(outcome);
    }
    outcomes
        .into_iter()
        .zip(jobs)
        .map(|(outcome, job)| {
            outcome.unwrap_or_else(|| {
                Err(NodeWarning::run_id(
                    &job.node_id,
                    "cancelled before the artifact was fetched",
                ))
            })
        })
        .collect()
}

/// Fetches in flight across all workers, abandoned ones included. A slot is
/// held until the fetcher returns, not until the worker stops waiting.
struct FetchSlots {
    limit: usize,
    busy: Mutex<usize>,
    freed: Condvar,
}

impl FetchSlots {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            busy: Mutex::new(0),
            freed: Condvar::new(),
        })
    }

    fn in_flight(&self) -> MutexGuard<'_, usize> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a free slot until `deadline`; `None` on timeout or cancellation.
    fn acquire(self: &Arc<Self>, deadline: Instant, cancellation: &AtomicBool) -> Option<SlotGuard> {
        let mut busy = self.in_flight();
        while *busy >= self.limit {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || cancellation.load(Ordering::SeqCst) {
                return None;
            }
            busy = self
                .freed
                .wait_timeout(busy, remaining.min(CANCEL_POLL))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        *busy += 1;
        Some(SlotGuard(Arc::clone(self)))
    }
}

struct SlotGuard(Arc<FetchSlots>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut busy = self.0.in_flight();
        *busy = busy.saturating_sub(1);
        self.0.freed.notify_one();
    }
}

fn timed_out(job: &FetchJob, options: &BuildOptions) -> NodeWarning {
    NodeWarning::run_id(
        &job.node_id,
        format!(
            "fetch of `{}` timed out after {}",
            job.artifact,
            humantime::format_duration(options.fetch_timeout)
        ),
    )
}

fn cancelled(job: &FetchJob) -> NodeWarning {
    NodeWarning::run_id(&job.node_id, "cancelled while fetching the artifact")
}

fn fetch_run_id(
    job: &FetchJob,
    run_id: &str,
    fetcher: &Arc<dyn ArtifactFetcher>,
    slots: &Arc<FetchSlots>,
    options: &BuildOptions,
) -> FetchOutcome {
    let deadline = Instant::now() + options.fetch_timeout;
    let Some(slot) = slots.acquire(deadline, &options.cancellation) else {
        return Err(if options.is_cancelled() {
            cancelled(job)
        } else {
            timed_out(job, options)
        });
    };

    // The fetch runs on its own thread so a hung request can be abandoned
    // once the timeout elapses or the build is cancelled. It keeps its slot
    // until the fetcher returns.
    let (tx, rx) = mpsc::sync_channel(1);
    {
        let fetcher = Arc::clone(fetcher);
        let run_id = run_id.to_string();
        let node_id = job.node_id.clone();
        let artifact = job.artifact.clone();
        thread::spawn(move || {
            let result = fetcher.fetch(&run_id, &node_id, &artifact);
            drop(slot);
            let _ = tx.send(result);
        });
    }

    let payload = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(job, options));
        }
        match rx.recv_timeout(remaining.min(CANCEL_POLL)) {
            Ok(result) => break result,
            Err(RecvTimeoutError::Timeout) => {
                if options.is_cancelled() {
                    if let Ok(result) = rx.try_recv() {
                        break result;
                    }
                    return Err(cancelled(job));
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(NodeWarning::run_id(
                    &job.node_id,
                    format!("fetch of `{}` aborted", job.artifact),
                ));
            }
        }
    };

    let payload = payload.map_err(|err| NodeWarning::run_id(&job.node_id, format!("{err:#}")))?;
    decode_artifact(&payload).map_err(|err| NodeWarning::run_id(&job.node_id, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use base64::Engine as _;

    fn fetcher<F>(f: F) -> Arc<dyn ArtifactFetcher>
    where
        F: Fn(&str, &str, &str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn manifest(raw: &str) -> RunManifest {
        RunManifest::parse(raw, "run-1").unwrap()
    }

    fn tar_payload(body: &str) -> String {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "data", body.as_bytes())
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(builder.into_inner().unwrap())
    }

    const MANIFEST: &str = r#"{
        "metadata": { "name": "wf", "uid": "u", "resourceVersion": "1",
                      "creationTimestamp": "t", "labels": {}, "annotations": {} },
        "spec": { "templates": [
            { "name": "wf", "dag": { "tasks": [] } },
            { "name": "step-a", "container": { "image": "x" },
              "metadata": { "labels": {
                  "kfp-digitalhub-runtime-function": "first",
                  "kfp-digitalhub-runtime-action": "job" } } },
            { "name": "step-a", "container": { "image": "x" },
              "metadata": { "labels": { "kfp-digitalhub-runtime-function": "second" } } }
        ] },
        "status": { "nodes": {
            "wf-2": { "id": "wf-2", "name": "wf.step-a", "displayName": "step-a", "type": "Pod",
                      "phase": "Succeeded", "startedAt": "s", "finishedAt": "f",
                      "inputs": { "parameters": [ { "name": "p" } ] },
                      "outputs": { "parameters": [ { "name": "step-a-run_id", "value": "r" } ],
                                   "exitCode": "0" } },
            "wf": { "id": "wf", "name": "wf", "displayName": "wf", "type": "DAG",
                    "phase": "Running", "children": [ "wf-2" ] }
        } }
    }"#;

    #[test]
    fn nodes_copy_fields_and_template_labels() {
        let fetch = fetcher(|_, _, _| Ok(tar_payload("child-1")));
        let build = build_graph(&manifest(MANIFEST), "run-1", Some(fetch), &BuildOptions::default());

        assert!(build.warnings.is_empty());
        assert_eq!(build.nodes.len(), 2);
        let pod = &build.nodes[0];
        assert_eq!(pod.id, "wf-2");
        assert_eq!(pod.state, Some(State::Completed));
        assert_eq!(pod.function.as_deref(), Some("first"));
        assert_eq!(pod.action.as_deref(), Some("job"));
        assert!(pod.function_id.is_none());
        assert_eq!(pod.exit_code, Some(json!("0")));
        assert_eq!(pod.inputs.as_ref().unwrap()[0].value, json!(""));
        assert_eq!(pod.run_id, Some(ArtifactValue::Single("child-1".to_string())));

        let dag = &build.nodes[1];
        assert_eq!(dag.children, vec!["wf-2".to_string()]);
        assert_eq!(dag.state, Some(State::Running));
        assert!(dag.function.is_none());
        assert!(dag.run_id.is_none());
    }

    #[test]
    fn fetch_failure_only_drops_run_id() {
        let fetch = fetcher(|_, _, _| Err(anyhow!("artifact not found")));
        let build = build_graph(&manifest(MANIFEST), "run-1", Some(fetch), &BuildOptions::default());

        assert_eq!(build.nodes.len(), 2);
        assert!(build.nodes[0].run_id.is_none());
        assert_eq!(build.nodes[0].function.as_deref(), Some("first"));
        assert_eq!(build.warnings.len(), 1);
        assert_eq!(build.warnings[0].node_id, "wf-2");
        assert!(build.warnings[0].message.contains("artifact not found"));
    }

    #[test]
    fn fetcher_is_called_with_display_name_artifact() {
        let fetch = fetcher(|run, node, artifact| {
            assert_eq!((run, node, artifact), ("run-1", "wf-2", "step-a-run_id"));
            Ok(tar_payload("ok"))
        });
        let build = build_graph(&manifest(MANIFEST), "run-1", Some(fetch), &BuildOptions::default());
        assert!(build.warnings.is_empty());
    }

    #[test]
    fn node_without_id_is_fetched_under_its_key() {
        let raw = r#"{
            "metadata": { "name": "wf", "uid": "u", "resourceVersion": "1",
                          "creationTimestamp": "t", "labels": {}, "annotations": {} },
            "status": { "nodes": {
                "wf-7": { "name": "wf.b", "displayName": "step-b", "type": "Pod",
                          "outputs": { "parameters": [] } }
            } }
        }"#;
        let fetch = fetcher(|_, node, _| {
            assert_eq!(node, "wf-7");
            Ok(tar_payload("ok"))
        });
        let build = build_graph(&manifest(raw), "run-1", Some(fetch), &BuildOptions::default());
        assert_eq!(build.nodes[0].id, "wf-7");
        assert!(build.warnings.is_empty());
    }

    #[test]
    fn empty_manifest_yields_empty_graph() {
        let raw = r#"{ "metadata": { "name": "wf", "uid": "u", "resourceVersion": "1",
                       "creationTimestamp": "t", "labels": {}, "annotations": {} } }"#;
        let build = build_graph(&manifest(raw), "run-1", None, &BuildOptions::default());
        assert!(build.nodes.is_empty());
        assert!(build.warnings.is_empty());
    }

    #[test]
    fn optional_fields_are_omitted_from_json() {
        let build = build_graph(&manifest(MANIFEST), "run-1", None, &BuildOptions::default());
        let dag = serde_json::to_value(&build.nodes[1]).unwrap();
        assert_eq!(dag["type"], json!("DAG"));
        assert_eq!(dag["state"], json!("RUNNING"));
        assert!(dag.get("start_time").is_none());
        assert!(dag.get("run_id").is_none());
    }
}
