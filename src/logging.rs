use std::io::{stderr, stdout, Write};
use std::sync::{Arc, Mutex};

use humantime::format_rfc3339;
use serde_json::{json, Map, Value};

const CAPTURE_LIMIT: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

pub(crate) fn current_timestamp() -> String {
    format_rfc3339(std::time::SystemTime::now()).to_string()
}

/// Destination for structured log entries.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &Map<String, Value>);
}

/// Writes one JSON object per line; errors go to stderr, the rest to stdout.
#[derive(Default)]
pub struct StdSink;

impl LogSink for StdSink {
    fn write(&self, entry: &Map<String, Value>) {
        if let Ok(serialized) = serde_json::to_string(entry) {
            let level = entry.get("level").and_then(Value::as_str).unwrap_or("info");
            if level == Level::Error.as_str() {
                let _ = writeln!(stderr(), "{}", serialized);
            } else {
                let _ = writeln!(stdout(), "{}", serialized);
            }
        }
    }
}

/// Keeps entries in memory. Once full, a single truncation notice is recorded.
#[derive(Default)]
pub struct CaptureSink {
    inner: Mutex<CaptureState>,
}

#[derive(Default)]
struct CaptureState {
    entries: Vec<Value>,
    truncated: bool,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Value> {
        self.inner
            .lock()
            .map(|state| state.entries.clone())
            .unwrap_or_default()
    }
}

impl LogSink for CaptureSink {
    fn write(&self, entry: &Map<String, Value>) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        if state.entries.len() >= CAPTURE_LIMIT {
            if !state.truncated {
                state.entries.push(json!({
                    "level": "warn",
                    "message": "Captured log buffer truncated",
                    "tags": { "component": "logging", "reason": "log-overflow" },
                    "timestamp": current_timestamp()
                }));
                state.truncated = true;
            }
            return;
        }
        state.entries.push(Value::Object(entry.clone()));
    }
}

/// Cheap to clone; every clone shares the sink and carries its own tags.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    tags: Map<String, Value>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Arc::new(StdSink))
    }
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            tags: Map::new(),
        }
    }

    pub fn with_tag(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut tags = self.tags.clone();
        match value.into() {
            v @ (Value::String(_) | Value::Number(_) | Value::Bool(_)) => {
                tags.insert(key.to_string(), v);
            }
            _ => {}
        }
        Self {
            sink: self.sink.clone(),
            tags,
        }
    }

    pub fn log(&self, level: Level, message: &str, data: Option<Value>) {
        let mut entry = Map::new();
        entry.insert("level".to_string(), Value::String(level.as_str().to_string()));
        entry.insert("message".to_string(), Value::String(message.to_string()));
        if let Some(data @ Value::Object(_)) = data {
            entry.insert("data".to_string(), data);
        }
        if !self.tags.is_empty() {
            entry.insert("tags".to_string(), Value::Object(self.tags.clone()));
        }
        entry.insert("timestamp".to_string(), Value::String(current_timestamp()));
        self.sink.write(&entry);
    }

    pub fn debug(&self, message: &str, data: Option<Value>) {
        self.log(Level::Debug, message, data);
    }

    pub fn info(&self, message: &str, data: Option<Value>) {
        self.log(Level::Info, message, data);
    }

    pub fn warn(&self, message: &str, data: Option<Value>) {
        self.log(Level::Warn, message, data);
    }

    pub fn error(&self, message: &str, data: Option<Value>) {
        self.log(Level::Error, message, data);
    }
}
