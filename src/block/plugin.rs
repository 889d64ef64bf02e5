use async_trait::async_trait;
use std::mem;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::process::ProcessHandle;
use super::relay::{spawn_drain, DrainHandle, OutputDestination, StdinHandle, Stream};
use super::IoBlock;
use crate::backends::{InvocationContext, Invoker, PreparedInvocation, StdioFlags};
use crate::error::BlockError;
use crate::plugins::{Capability, PluginDescriptor, PluginRole};

/// One output stream of a block: its links, and the drain once started.
struct OutputChannel<R> {
    stream: Stream,
    reader: Option<R>,
    links: Vec<Box<dyn OutputDestination>>,
    drain: Option<(DrainHandle, AbortHandle)>,
}

impl<R> OutputChannel<R>
where
    R: AsyncRead + Unpin + Send + Sync + 'static,
{
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            reader: None,
            links: Vec::new(),
            drain: None,
        }
    }

    fn link(&mut self, plugin: &str, dst: Box<dyn OutputDestination>) -> Result<(), BlockError> {
        if self.drain.is_some() {
            return Err(BlockError::LinkConflict {
                plugin: plugin.to_string(),
                stream: self.stream,
            });
        }
        self.links.push(dst);
        Ok(())
    }

    fn proxy(&mut self, plugin: &str, limit: usize) -> Result<DrainHandle, BlockError> {
        if let Some((handle, _)) = &self.drain {
            return Ok(handle.clone());
        }
        let reader = self.reader.take().ok_or_else(|| BlockError::ProcessNotRunning {
            plugin: plugin.to_string(),
        })?;
        let (handle, abort) = spawn_drain(
            reader,
            plugin.to_string(),
            self.stream,
            limit,
            mem::take(&mut self.links),
        );
        self.drain = Some((handle.clone(), abort));
        Ok(handle)
    }

    fn abort(&self) {
        if let Some((_, abort)) = &self.drain {
            abort.abort();
        }
    }
}

/// A pipeline participant backed by one plugin process.
pub struct PluginBlock {
    plugin: Arc<PluginDescriptor>,
    invoker: Arc<dyn Invoker>,
    mapping: Option<String>,
    extra_args: Vec<String>,
    stream_buffer_size: usize,
    relay_limit: usize,
    producer: bool,
    consumer: bool,
    prepared: Option<PreparedInvocation>,
    process: Option<ProcessHandle>,
    stdin: Option<StdinHandle>,
    stdout: OutputChannel<tokio::process::ChildStdout>,
    stderr: OutputChannel<tokio::process::ChildStderr>,
}

impl PluginBlock {
    pub fn new(plugin: Arc<PluginDescriptor>, invoker: Arc<dyn Invoker>, stream_buffer_size: usize) -> Self {
        let role = plugin.role;
        Self {
            plugin,
            invoker,
            mapping: None,
            extra_args: Vec::new(),
            stream_buffer_size,
            relay_limit: stream_buffer_size / 2,
            producer: role.is_producer(),
            consumer: role.is_consumer(),
            prepared: None,
            process: None,
            stdin: None,
            stdout: OutputChannel::new(Stream::Stdout),
            stderr: OutputChannel::new(Stream::Stderr),
        }
    }

    pub fn with_mapping(mut self, mapping: Option<String>) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// The name a run request uses for this block: the mapping name for
    /// mappers invoked through one, the plugin name otherwise.
    pub fn display_name(&self) -> &str {
        self.mapping.as_deref().unwrap_or(&self.plugin.name)
    }

    /// Maximum relayed line length, fixed when the process starts.
    pub fn relay_limit(&self) -> usize {
        self.relay_limit
    }

    async fn cleanup(&self) {
        let Some(prepared) = &self.prepared else { return };
        if let Err(e) = self.invoker.cleanup(prepared).await {
            warn!(plugin = %self.plugin.name, error = %e, "failed to clean up plugin files");
        }
    }
}

#[async_trait]
impl IoBlock for PluginBlock {
    fn name(&self) -> &str {
        &self.plugin.name
    }

    fn label(&self) -> &str {
        self.display_name()
    }

    fn role(&self) -> PluginRole {
        self.plugin.role
    }

    fn producer(&self) -> bool {
        self.producer
    }

    fn consumer(&self) -> bool {
        self.consumer
    }

    fn has_state(&self) -> bool {
        self.plugin.has_capability(Capability::State)
    }

    async fn pre(&mut self, ctx: &InvocationContext) -> Result<(), BlockError> {
        let mut ctx = ctx.clone();
        ctx.mapping = self.mapping.clone();
        let prepared = self
            .invoker
            .prepare(&self.plugin, &ctx)
            .await
            .map_err(|source| BlockError::Prepare {
                plugin: self.plugin.name.clone(),
                source,
            })?;
        self.prepared = Some(prepared);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), BlockError> {
        let Some(prepared) = &self.prepared else {
            return Err(BlockError::NotPrepared {
                plugin: self.plugin.name.clone(),
            });
        };

        self.relay_limit = self.stream_buffer_size / 2;
        let stdio = StdioFlags {
            stdin: self.consumer,
            stdout: true,
            stderr: true,
        };
        let mut child = self
            .invoker
            .spawn(&self.plugin, prepared, &self.extra_args, stdio)
            .map_err(|source| BlockError::StartFailed {
                plugin: self.plugin.name.clone(),
                source,
            })?;

        self.stdin = child
            .stdin
            .take()
            .map(|stdin| Arc::new(tokio::sync::Mutex::new(Some(stdin))));
        self.stdout.reader = child.stdout.take();
        self.stderr.reader = child.stderr.take();
        let process = ProcessHandle::watch(child, &self.plugin.name);
        info!(plugin = %self.plugin.name, role = %self.plugin.role, pid = ?process.pid(), "started");
        self.process = Some(process);
        Ok(())
    }

    async fn stop(&mut self, kill: bool) -> Result<(), BlockError> {
        // Prepared files go even when the process never started.
        let stopped = match &self.process {
            Some(process) => {
                let code = process.stop(kill).await;
                debug!(plugin = %self.plugin.name, code, kill, "stopped");
                Ok(())
            }
            None => Err(BlockError::ProcessNotRunning {
                plugin: self.plugin.name.clone(),
            }),
        };
        self.stdout.abort();
        self.stderr.abort();
        self.cleanup().await;
        stopped
    }

    fn process(&self) -> Result<&ProcessHandle, BlockError> {
        self.process.as_ref().ok_or_else(|| BlockError::ProcessNotRunning {
            plugin: self.plugin.name.clone(),
        })
    }

    fn stdin(&self) -> Result<StdinHandle, BlockError> {
        self.process()?;
        self.stdin.clone().ok_or_else(|| BlockError::NoStdin {
            plugin: self.plugin.name.clone(),
        })
    }

    async fn close_stdin(&mut self) -> Result<(), BlockError> {
        let Some(stdin) = &self.stdin else {
            return Ok(());
        };
        let taken = stdin.lock().await.take();
        if let Some(mut pipe) = taken {
            if let Err(e) = pipe.shutdown().await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(BlockError::Io {
                        plugin: self.plugin.name.clone(),
                        source: e,
                    });
                }
            }
            debug!(plugin = %self.plugin.name, "stdin closed");
        }
        Ok(())
    }

    fn link_stdout(&mut self, dst: Box<dyn OutputDestination>) -> Result<(), BlockError> {
        self.stdout.link(&self.plugin.name, dst)
    }

    fn link_stderr(&mut self, dst: Box<dyn OutputDestination>) -> Result<(), BlockError> {
        self.stderr.link(&self.plugin.name, dst)
    }

    fn proxy_stdout(&mut self) -> Result<DrainHandle, BlockError> {
        self.stdout.proxy(&self.plugin.name, self.relay_limit)
    }

    fn proxy_stderr(&mut self) -> Result<DrainHandle, BlockError> {
        self.stderr.proxy(&self.plugin.name, self.relay_limit)
    }

    async fn post(&mut self) -> Result<(), BlockError> {
        self.cleanup().await;
        self.prepared = None;
        Ok(())
    }
}
