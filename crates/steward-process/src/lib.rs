use std::{fmt, str::FromStr};

/// Identifier of the remote channel that receives console output.
///
/// Chat backends hand out numeric ids, other sinks may use names; both are kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one `start` of a server; a fresh id is minted per run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ServerState {
    Idle,
    Downloading,
    Running,
    Stopping,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub name: Option<String>,
    pub state: ServerState,
    pub run_id: Option<RunId>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub console_channel: Option<ChannelId>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Playing,
    Watching,
    Streaming,
    Listening,
}

impl FromStr for PresenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "playing" => Ok(Self::Playing),
            "watching" => Ok(Self::Watching),
            "streaming" => Ok(Self::Streaming),
            "listening" => Ok(Self::Listening),
            other => Err(format!("unknown presence type: {other}")),
        }
    }
}

/// Status line shown by the remote sink while a server is up.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Presence {
    pub status: String,
    pub kind: PresenceKind,
}
