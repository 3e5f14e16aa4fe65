use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors surfaced by the orchestration engine.
///
/// Formatting for operators is left to whoever calls the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No definition document exists under this name.
    #[error("no server definition named {0:?}")]
    NotFound(String),

    #[error("invalid server name {0:?}")]
    InvalidName(String),

    #[error("malformed definition {name:?}: {reason}")]
    MalformedDefinition { name: String, reason: String },

    #[error("malformed step {index} of command {command:?}: {reason}")]
    MalformedStep {
        command: String,
        index: usize,
        reason: String,
    },

    #[error("no command {0:?} in the active definition")]
    UnknownCommand(String),

    #[error("{0:?} is a reserved command and cannot be run directly")]
    ReservedCommand(String),

    #[error("command cycle detected: {}", .0.join(" -> "))]
    CommandCycle(Vec<String>),

    #[error("failed to spawn {program:?}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process did not exit within {}ms of being killed", .0.as_millis())]
    Kill(Duration),

    #[error("a server is already active")]
    AlreadyRunning,

    #[error("no server is running")]
    NoActiveServer,

    #[error("directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },

    #[error("failed to unpack {}: {message}", .archive.display())]
    Unpack { archive: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub(crate) fn malformed(name: &str, reason: impl Into<String>) -> Self {
        Self::MalformedDefinition {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn download(url: &str, message: impl ToString) -> Self {
        Self::Download {
            url: url.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn unpack(archive: &std::path::Path, message: impl ToString) -> Self {
        Self::Unpack {
            archive: archive.to_path_buf(),
            message: message.to_string(),
        }
    }
}

/// Flattens an error and its sources into one line, skipping repeated messages.
pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
