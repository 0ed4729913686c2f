use std::{io, path::PathBuf};

use thiserror::Error;

/// Transport level failures reported by driver handles and the registry.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("could not spawn driver `{name}` ({path}): {source}")]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("driver `{0}` is already loaded")]
    Duplicate(String),
    #[error("pipe to driver `{0}` is closed")]
    PipeClosed(String),
    #[error("payload for driver `{0}` contains a line break")]
    InvalidPayload(String),
    #[error("i/o error talking to driver `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListenerError {
    #[error("listener `{0}` is already running")]
    AlreadyStarted(String),
    #[error("listener `{0}` is running, actions must be registered before start")]
    Running(String),
    #[error("listener `{0}` is shutting down")]
    Finalized(String),
    #[error("could not start the thread for listener `{0}`")]
    Thread(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("{manager}: driver `{name}` is defined twice")]
    DuplicateDriver { manager: String, name: String },
    #[error("{manager}: driver `{name}` has no executable")]
    MissingExecutable { manager: String, name: String },
}
