use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical run/node state shared by every engine integration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Pending,
    Running,
    Completed,
    Error,
    Stopped,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pending => "PENDING",
            State::Running => "RUNNING",
            State::Completed => "COMPLETED",
            State::Error => "ERROR",
            State::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an Argo/KFP phase onto the canonical state. Unknown phases are errors.
pub fn map_state(phase: &str) -> State {
    match phase {
        "Succeeded" => State::Completed,
        "Failed" | "Error" => State::Error,
        "Running" => State::Running,
        "Pending" => State::Pending,
        "Skipped" => State::Stopped,
        _ => State::Error,
    }
}
