use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Argo workflow manifest as embedded in a KFP run detail.
#[derive(Clone, Debug, Deserialize)]
pub struct RunManifest {
    pub metadata: ManifestMetadata,
    #[serde(default)]
    pub spec: ManifestSpec,
    #[serde(default)]
    pub status: ManifestStatus,
}

/// Every field is required: a manifest without them cannot be reported.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
    pub uid: String,
    #[serde(rename = "resourceVersion")]
    pub resource_version: String,
    #[serde(rename = "creationTimestamp")]
    pub creation_timestamp: String,
    pub labels: Value,
    pub annotations: Value,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ManifestSpec {
    #[serde(default)]
    pub templates: Vec<Template>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub container: Option<Value>,
    #[serde(default)]
    pub metadata: TemplateMetadata,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TemplateMetadata {
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Template {
    pub fn is_container(&self) -> bool {
        self.container.is_some()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ManifestStatus {
    #[serde(rename = "startedAt", default)]
    pub started_at: Option<String>,
    #[serde(rename = "finishedAt", default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default, deserialize_with = "ordered_nodes")]
    pub nodes: Vec<(String, NodeRecord)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeType {
    Pod,
    Dag,
    Other(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Pod => "Pod",
            NodeType::Dag => "DAG",
            NodeType::Other(other) => other,
        }
    }
}

impl From<String> for NodeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Pod" => NodeType::Pod,
            "DAG" => NodeType::Dag,
            _ => NodeType::Other(value),
        }
    }
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(NodeType::from)
    }
}

impl Serialize for NodeType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub children: Option<Vec<String>>,
    #[serde(rename = "startedAt", default)]
    pub started_at: Option<String>,
    #[serde(rename = "finishedAt", default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub exit_code: Option<Value>,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub outputs: Option<Value>,
}

impl NodeRecord {
    /// The node's own id, or the `status.nodes` key it was listed under.
    pub fn node_id<'a>(&'a self, key: &'a str) -> &'a str {
        self.id.as_deref().unwrap_or(key)
    }
}

// `status.nodes` is a JSON object whose key order is the display order.
fn ordered_nodes<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, NodeRecord)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct NodesVisitor;

    impl<'de> Visitor<'de> for NodesVisitor {
        type Value = Vec<(String, NodeRecord)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of node id to node record")
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut nodes = Vec::with_capacity(map.size_hint().unwrap_or(0));
            let mut seen = HashSet::new();
            while let Some((key, node)) = map.next_entry::<String, NodeRecord>()? {
                if let Some(id) = node.id.as_deref().filter(|id| *id != key) {
                    return Err(de::Error::custom(format!(
                        "node `{key}` carries a different id `{id}`"
                    )));
                }
                if !seen.insert(key.clone()) {
                    return Err(de::Error::custom(format!("duplicate node id `{key}`")));
                }
                nodes.push((key, node));
            }
            Ok(nodes)
        }
    }

    deserializer.deserialize_any(NodesVisitor)
}

impl RunManifest {
    pub fn parse(raw: &str, run_id: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| Error::ManifestParse {
            run_id: run_id.to_string(),
            message: err.to_string(),
        })
    }

    pub fn nodes(&self) -> &[(String, NodeRecord)] {
        &self.status.nodes
    }

    /// First container template named `display_name`; template order breaks ties.
    pub fn container_template(&self, display_name: &str) -> Option<&Template> {
        self.spec
            .templates
            .iter()
            .find(|t| t.is_container() && t.name == display_name)
    }
}

/// KFP v1beta1 run detail, as returned by `GET /runs/{id}`.
#[derive(Clone, Debug, Deserialize)]
pub struct ExecutionResult {
    pub run: ApiRun,
    pub pipeline_runtime: PipelineRuntime,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApiRun {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PipelineRuntime {
    #[serde(default)]
    pub workflow_manifest: Option<String>,
}

impl ExecutionResult {
    pub fn manifest(&self) -> Result<RunManifest> {
        let raw = self
            .pipeline_runtime
            .workflow_manifest
            .as_deref()
            .ok_or_else(|| Error::ManifestParse {
                run_id: self.run.id.clone(),
                message: "run detail carries no workflow manifest".to_string(),
            })?;
        RunManifest::parse(raw, &self.run.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> Value {
        json!({
            "name": "wf", "uid": "u1", "resourceVersion": "7",
            "creationTimestamp": "2024-01-01T00:00:00Z",
            "labels": {}, "annotations": {}
        })
    }

    #[test]
    fn node_order_follows_the_document() {
        let raw = format!(
            r#"{{
                "metadata": {},
                "status": {{ "nodes": {{
                    "wf-3": {{ "name": "wf.c", "displayName": "c", "type": "Pod" }},
                    "wf-1": {{ "name": "wf.a", "displayName": "a", "type": "Pod" }},
                    "wf":   {{ "name": "wf", "displayName": "wf", "type": "DAG" }}
                }} }}
            }}"#,
            metadata()
        );
        let manifest = RunManifest::parse(&raw, "r1").unwrap();
        let ids: Vec<_> = manifest.nodes().iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["wf-3", "wf-1", "wf"]);
        assert_eq!(manifest.nodes()[2].1.node_type, NodeType::Dag);
    }

    #[test]
    fn explicit_node_ids_must_match_their_keys() {
        let raw = json!({
            "metadata": metadata(),
            "status": { "nodes": {
                "wf-1": { "id": "wf-1", "name": "wf.a", "displayName": "a", "type": "Pod" },
                "wf-2": { "name": "wf.b", "displayName": "b", "type": "Pod" }
            } }
        })
        .to_string();
        let manifest = RunManifest::parse(&raw, "r1").unwrap();
        let ids: Vec<_> = manifest
            .nodes()
            .iter()
            .map(|(key, node)| node.node_id(key))
            .collect();
        assert_eq!(ids, vec!["wf-1", "wf-2"]);

        let raw = json!({
            "metadata": metadata(),
            "status": { "nodes": {
                "wf-1": { "id": "wf-9", "name": "wf.a", "displayName": "a", "type": "Pod" }
            } }
        })
        .to_string();
        let err = RunManifest::parse(&raw, "r1").unwrap_err();
        let Error::ManifestParse { message, .. } = err else {
            panic!("expected a manifest parse error");
        };
        assert!(message.contains("wf-9"));
    }

    #[test]
    fn duplicate_node_keys_are_rejected() {
        let raw = format!(
            r#"{{ "metadata": {}, "status": {{ "nodes": {{
                "wf-1": {{ "name": "wf.a", "displayName": "a", "type": "Pod" }},
                "wf-1": {{ "name": "wf.b", "displayName": "b", "type": "Pod" }}
            }} }} }}"#,
            metadata()
        );
        let err = RunManifest::parse(&raw, "r1").unwrap_err();
        assert!(err.to_string().contains("duplicate node id `wf-1`"));
    }

    #[test]
    fn missing_nodes_and_templates_default_to_empty() {
        let raw = json!({ "metadata": metadata(), "status": {} }).to_string();
        let manifest = RunManifest::parse(&raw, "r1").unwrap();
        assert!(manifest.nodes().is_empty());
        assert!(manifest.spec.templates.is_empty());
    }

    #[test]
    fn missing_metadata_key_is_a_parse_error() {
        let raw = json!({ "metadata": { "name": "wf" } }).to_string();
        let err = RunManifest::parse(&raw, "r1").unwrap_err();
        assert!(matches!(err, Error::ManifestParse { .. }));
    }

    #[test]
    fn unknown_node_types_are_kept_verbatim() {
        let node: NodeRecord = serde_json::from_value(json!({
            "name": "n", "displayName": "n", "type": "Retry"
        }))
        .unwrap();
        assert_eq!(node.node_type, NodeType::Other("Retry".to_string()));
        assert_eq!(serde_json::to_value(&node.node_type).unwrap(), json!("Retry"));
    }
}
