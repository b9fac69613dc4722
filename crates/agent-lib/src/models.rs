//! Wire-level data model shared by the process manager, the controller
//! pollers and the container bridge: commands, job results and interim
//! messages, all serialized as plain JSON objects.

use serde::{Deserialize, Serialize};

/// Message level codes understood by downstream log consumers.
pub mod levels {
    /// Plain stdout line from an executing command.
    pub const STDOUT: i64 = 1;
    /// Plain stderr line from an executing command.
    pub const STDERR: i64 = 2;
    /// Structured JSON result payload.
    pub const RESULT_JSON: i64 = 20;
    /// Structured JSON message payload.
    pub const JSON: i64 = 21;
    /// Metric line produced by the aggregator.
    pub const METRIC: i64 = 30;
}

/// Control envelope carried by every command.
///
/// These keys steer scheduling and routing; the command-specific payload
/// travels separately in [`Command::arguments`]. The whole envelope is
/// copied onto the final [`JobResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandArgs {
    /// Free-form classification, copied into emitted messages.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    /// Free-form classification, copied into emitted messages.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Non-empty selects the named FIFO queue of the same name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub queue: String,
    /// Stats snapshot cadence in seconds; defaulted by the poller when zero.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stats_interval: u64,
    /// Execution deadline in seconds; zero disables the timeout.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_time: u64,
    /// Per-command level filter for the console logger.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loglevels: Vec<i64>,
    /// Per-command level filter for the controller batch logger.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loglevels_ac: Vec<i64>,
    /// Routing tag: the key of the controller that issued the command.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tags: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl CommandArgs {
    /// Stamps the routing tag. Idempotent: re-tagging with the same key is
    /// a no-op, and the tag survives serialization round-trips.
    pub fn set_tag(&mut self, tag: &str) {
        if self.tags != tag {
            self.tags = tag.to_string();
        }
    }
}

/// An identified request naming a builtin or registered action.
///
/// The `id` is minted by the issuing controller and is never generated on
/// the inbound path; `arguments` is passed through to the process factory
/// unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub nid: u32,
    pub name: String,
    #[serde(default)]
    pub args: CommandArgs,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub arguments: serde_json::Value,
    /// Controller key recorded at decoration time; container dispatch
    /// copies it onto the inner command's tags.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub route: String,
}

impl Command {
    /// Parses a command from raw JSON bytes.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Terminal state of a command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "KILLED")]
    Killed,
    #[serde(rename = "UNKNOWN_CMD")]
    UnknownCmd,
    #[serde(rename = "DUPLICATE_ID")]
    DuplicateId,
}

/// Terminal outcome envelope for one command.
///
/// Carries a copy of the command's control envelope plus the routing tag,
/// so a result can always be delivered back to the controller that issued
/// the originating command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub nid: u32,
    #[serde(default)]
    pub args: CommandArgs,
    /// Execution start, epoch seconds.
    #[serde(rename = "starttime", default)]
    pub start_time: i64,
    /// Execution duration, milliseconds.
    #[serde(default)]
    pub time: i64,
    pub state: State,
    #[serde(default)]
    pub level: i64,
    /// Serialized result payload.
    #[serde(default)]
    pub data: String,
    /// Copy of the command's routing tag.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tags: String,
}

impl JobResult {
    /// Builds a result envelope for `cmd` with every payload field empty.
    pub fn for_command(cmd: &Command, state: State) -> Self {
        Self {
            id: cmd.id.clone(),
            gid: cmd.gid,
            nid: cmd.nid,
            args: cmd.args.clone(),
            start_time: chrono::Utc::now().timestamp(),
            time: 0,
            state,
            level: levels::RESULT_JSON,
            data: String::new(),
            tags: cmd.args.tags.clone(),
        }
    }
}

/// Interim log/metric line emitted by a running command.
///
/// `id` names the owning command; the non-serialized `args` copy lets log
/// consumers apply per-command level overrides without keeping a reference
/// back to the command itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Id of the owning command (empty for agent-level metric lines).
    pub id: String,
    /// Emission time, epoch milliseconds.
    pub epoch: i64,
    pub level: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip)]
    pub args: CommandArgs,
}

impl Message {
    /// Builds a message owned by `cmd` at the current time.
    pub fn for_command(cmd: &Command, level: i64, text: impl Into<String>) -> Self {
        Self {
            id: cmd.id.clone(),
            epoch: chrono::Utc::now().timestamp_millis(),
            level,
            message: text.into(),
            domain: cmd.args.domain.clone(),
            name: cmd.args.name.clone(),
            args: cmd.args.clone(),
        }
    }
}
