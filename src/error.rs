use std::collections::BTreeMap;
use std::io;
use thiserror::Error;

use crate::block::Stream;
use crate::plugins::PluginRole;
use crate::state::StateError;

/// Structural problems found while turning a token list into a plan.
/// Nothing has been spawned when one of these is returned.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("block '{name}' not found")]
    BlockNotFound { name: String },

    #[error("ambiguous name '{name}': {reason}")]
    Ambiguous { name: String, reason: String },

    #[error("plugin '{plugin}' has no command '{command}'")]
    CommandNotFound { plugin: String, command: String },

    #[error("invalid block sequence at index {index}: {reason}")]
    Adjacency { index: usize, reason: String },

    #[error("nothing to run")]
    Empty,
}

/// Errors raised by a single block's process and stdio plumbing.
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("IO capture already in flight for '{plugin}' {stream}")]
    LinkConflict { plugin: String, stream: Stream },

    #[error("process not running for plugin '{plugin}'")]
    ProcessNotRunning { plugin: String },

    #[error("cannot start plugin '{plugin}': {source}")]
    StartFailed {
        plugin: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot prepare plugin '{plugin}': {source}")]
    Prepare {
        plugin: String,
        #[source]
        source: io::Error,
    },

    #[error("plugin '{plugin}' must be prepared before it is started")]
    NotPrepared { plugin: String },

    #[error("plugin '{plugin}' was started without a stdin pipe")]
    NoStdin { plugin: String },

    #[error("I/O error on plugin '{plugin}': {source}")]
    Io {
        plugin: String,
        #[source]
        source: io::Error,
    },
}

/// Failure of one output-draining task. Cloneable so every holder of the
/// shared drain handle observes the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("'{plugin}' {stream} line exceeds the relay limit of {limit} bytes")]
    LineTooLong {
        plugin: String,
        stream: Stream,
        limit: usize,
    },

    #[error("'{plugin}' {stream} relay failed: {message}")]
    Io {
        plugin: String,
        stream: Stream,
        kind: io::ErrorKind,
        message: String,
    },
}

/// Everything that can end a block-set, a command block or a whole plan.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Drain(#[from] DrainError),

    #[error(
        "output line length limit exceeded: '{plugin}' wrote a line longer than {limit} bytes; \
         raise the `stream_buffer_size` setting (currently {buffer_size} bytes, the relay limit is half of it)"
    )]
    OutputLineLimit {
        plugin: String,
        limit: usize,
        buffer_size: usize,
    },

    #[error("{message}")]
    PipelineFailed {
        message: String,
        exit_codes: BTreeMap<PluginRole, i32>,
    },

    #[error("command '{command}' of plugin '{plugin}' failed with exit code {code}")]
    CommandFailed {
        plugin: String,
        command: String,
        code: i32,
    },

    #[error("block '{plugin}' consumes input but has no upstream block")]
    NoUpstream { plugin: String },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    State(#[from] StateError),

    #[error("plan aborted at entry {index} ({entry}): {source}")]
    Aborted {
        index: usize,
        entry: String,
        #[source]
        source: Box<RunError>,
    },
}

impl RunError {
    /// Exit codes keyed by role, when the error came from a failed pipeline.
    pub fn exit_codes(&self) -> Option<&BTreeMap<PluginRole, i32>> {
        match self {
            Self::PipelineFailed { exit_codes, .. } => Some(exit_codes),
            Self::Aborted { source, .. } => source.exit_codes(),
            _ => None,
        }
    }
}
