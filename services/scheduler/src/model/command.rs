use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use drover_id::CommandId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    Exec { command: String },
    Signal { signal: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub state: CommandState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl CommandResult {
    pub fn pending() -> Self {
        Self {
            state: CommandState::Pending,
            exit_code: None,
            output: None,
        }
    }
}

/// A command fanned out to every task of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub namespace: String,
    pub app: String,
    pub kind: CommandKind,
    /// Per task id.
    pub results: BTreeMap<String, CommandResult>,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn is_complete(&self) -> bool {
        self.results
            .values()
            .all(|r| r.state != CommandState::Pending)
    }
}
