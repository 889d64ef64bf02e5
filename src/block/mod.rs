//! Pipeline participants and the plan built from them.
//!
//! A block wraps one plugin process. Blocks that produce output can be linked
//! to blocks that consume input; `ExtractLoadBlocks` chains them into a single
//! pipeline and `BlockParser` turns a run request into an ordered plan of
//! such pipelines and standalone `CommandBlock`s.

pub mod blockset;
pub mod command;
pub mod parser;
pub mod plugin;
pub mod process;
pub mod relay;

use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backends::InvocationContext;
use crate::error::{BlockError, RunError};
use crate::plugins::PluginRole;
use crate::state::StateStore;

pub use blockset::{BlockSet, BlockSetOptions, ExtractLoadBlocks};
pub use command::CommandBlock;
pub use parser::{BlockParser, PlanOptions};
pub use plugin::PluginBlock;
pub use process::ProcessHandle;
pub use relay::{DrainHandle, OutputDestination, StdinHandle, Stream};

/// Default size of the buffer between two linked blocks: 10 MiB.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// The producer/consumer contract every pipeline participant implements.
#[async_trait]
pub trait IoBlock: Send + Sync {
    fn name(&self) -> &str;

    /// The token that selected this block in a run request.
    fn label(&self) -> &str {
        self.name()
    }

    fn role(&self) -> PluginRole;

    /// Writes records to stdout for a downstream block.
    fn producer(&self) -> bool;

    /// Reads records from stdin written by an upstream block.
    fn consumer(&self) -> bool;

    fn has_state(&self) -> bool;

    /// Prepare on-disk resources before the process starts.
    async fn pre(&mut self, ctx: &InvocationContext) -> Result<(), BlockError>;

    async fn start(&mut self) -> Result<(), BlockError>;

    /// Stop the process. `kill` sends SIGKILL; otherwise SIGTERM with a grace period.
    async fn stop(&mut self, kill: bool) -> Result<(), BlockError>;

    fn process(&self) -> Result<&ProcessHandle, BlockError>;

    fn stdin(&self) -> Result<StdinHandle, BlockError>;

    /// Signal end of input. Closing twice is a no-op.
    async fn close_stdin(&mut self) -> Result<(), BlockError>;

    fn link_stdout(&mut self, dst: Box<dyn OutputDestination>) -> Result<(), BlockError>;

    fn link_stderr(&mut self, dst: Box<dyn OutputDestination>) -> Result<(), BlockError>;

    fn proxy_stdout(&mut self) -> Result<DrainHandle, BlockError>;

    fn proxy_stderr(&mut self) -> Result<DrainHandle, BlockError>;

    /// Release resources acquired in `pre`. Always called, whatever the outcome.
    async fn post(&mut self) -> Result<(), BlockError>;
}

/// Flags applied uniformly to every pipeline in a run request.
#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    /// Ignore stored state and extract everything.
    pub full_refresh: bool,
    /// Do not persist the state captured from the loader.
    pub no_state_update: bool,
    /// Run even if another run holds the state id.
    pub force: bool,
    pub state_suffix: Option<String>,
}

/// Resources shared by every entry of one plan execution.
pub struct RunSession {
    pub store: StateStore,
    pub run_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl RunSession {
    pub fn new(store: StateStore, run_dir: PathBuf) -> Self {
        Self {
            store,
            run_dir,
            cancel: CancellationToken::new(),
        }
    }

    pub fn invocation_context(&self) -> InvocationContext {
        InvocationContext {
            run_dir: self.run_dir.clone(),
            mapping: None,
            state: None,
        }
    }

    /// Close the state store and remove the run directory.
    pub fn close(self) {
        self.store.close();
        if let Err(e) = std::fs::remove_dir_all(&self.run_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = ?self.run_dir, error = %e, "failed to remove run directory");
            }
        }
    }
}

/// One step of an execution plan.
pub enum PlanEntry {
    Pipeline(ExtractLoadBlocks),
    Command(CommandBlock),
}

impl PlanEntry {
    /// The tokens this entry was built from, e.g. `tap-a mapping-b target-c`.
    pub fn describe(&self) -> String {
        match self {
            Self::Pipeline(set) => set.describe(),
            Self::Command(cmd) => cmd.describe(),
        }
    }

    pub async fn run(&mut self, session: &RunSession) -> Result<(), RunError> {
        match self {
            Self::Pipeline(set) => set.run(session).await,
            Self::Command(cmd) => cmd.run(session).await,
        }
    }
}
