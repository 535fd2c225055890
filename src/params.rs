use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: Value,
}

/// Flatten an Argo `inputs`/`outputs` block into `{name, value}` pairs.
///
/// Missing values become the empty string. Entries without a string `name`
/// are skipped; the function never fails.
pub fn normalize_params(block: Option<&Value>) -> Vec<Param> {
    let Some(list) = block
        .and_then(|b| b.get("parameters"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|entry| {
            let name = entry.get("name").and_then(Value::as_str)?;
            let value = entry
                .get("value")
                .cloned()
                .unwrap_or_else(|| Value::String(String::new()));
            Some(Param {
                name: name.to_string(),
                value,
            })
        })
        .collect()
}
