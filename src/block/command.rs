use tracing::{info, warn};

use super::relay::{LogDestination, LogLevel};
use super::{IoBlock, PluginBlock, RunSession, Stream};
use crate::error::RunError;

/// A utility-style plugin run on its own, optionally through a named command.
pub struct CommandBlock {
    block: PluginBlock,
    command: Option<String>,
}

impl CommandBlock {
    /// `block` should already carry the command's arguments.
    pub fn new(block: PluginBlock, command: Option<String>) -> Self {
        Self { block, command }
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn block(&self) -> &PluginBlock {
        &self.block
    }

    pub fn describe(&self) -> String {
        match self.command() {
            Some(command) => format!("{}:{}", self.block().name(), command),
            None => self.block().name().to_string(),
        }
    }

    pub async fn run(&mut self, session: &RunSession) -> Result<(), RunError> {
        info!(command = %self.describe(), "running command");
        let result = self.execute(session).await;
        if let Err(e) = self.block.post().await {
            warn!(command = %self.describe(), error = %e, "post failed");
        }
        result
    }

    async fn execute(&mut self, session: &RunSession) -> Result<(), RunError> {
        self.block.pre(&session.invocation_context()).await?;
        self.block.start().await?;

        let (name, role) = (self.block.name().to_string(), self.block.role());
        self.block
            .link_stdout(Box::new(LogDestination::new(&name, role, Stream::Stdout, LogLevel::Info)))?;
        self.block
            .link_stderr(Box::new(LogDestination::new(&name, role, Stream::Stderr, LogLevel::Info)))?;
        let stdout = self.block.proxy_stdout()?;
        let stderr = self.block.proxy_stderr()?;

        let exited = self.block.process()?.exit_future();
        let code = tokio::select! {
            code = exited => Some(code),
            _ = session.cancel.cancelled() => None,
        };
        let Some(code) = code else {
            warn!(command = %self.describe(), "cancelled");
            self.block.stop(false).await?;
            return Err(RunError::Cancelled);
        };

        stdout.await?;
        stderr.await?;

        if code != 0 {
            return Err(RunError::CommandFailed {
                plugin: name,
                command: self.command.clone().unwrap_or_else(|| "(default)".to_string()),
                code,
            });
        }
        info!(command = %self.describe(), "command completed");
        Ok(())
    }
}
