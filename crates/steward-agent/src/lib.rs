//! Orchestration engine for a single managed game server process.
//!
//! Server definitions are JSON documents describing named command sequences; the
//! [`Supervisor`] starts, stops and drives one of them at a time and forwards the process'
//! console output to a [`Sink`].

pub mod args;
pub mod config;
pub mod console;
pub mod definition;
pub mod download;
pub mod error;
mod executor;
mod paths;
pub mod process;
pub mod sink;
pub mod supervisor;

pub use config::Settings;
pub use definition::{DefinitionStore, ServerDefinition, Step};
pub use error::{EngineError, Result, format_error_chain};
pub use sink::{Sink, TracingSink};
pub use supervisor::{StartOutcome, Supervisor};
