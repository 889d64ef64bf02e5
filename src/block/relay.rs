//! Line-oriented relay of one child output stream into its linked destinations.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::task::AbortHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tracing::{debug, info};

use crate::error::DrainError;
use crate::plugins::PluginRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Handle to a running drain. Cloning yields the same underlying task.
pub type DrainHandle = Shared<BoxFuture<'static, Result<(), DrainError>>>;

/// Where relayed lines go. Lines are passed with their trailing newline,
/// except a final line the child never terminated.
#[async_trait]
pub trait OutputDestination: Send + Sync {
    async fn write_line(&mut self, line: &[u8]) -> io::Result<()>;

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A child's stdin, shared between the block that owns it and the upstream
/// relay writing into it. `None` once closed.
pub type StdinHandle = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

/// Writes into a downstream block's stdin.
pub struct PipeDestination {
    consumer: String,
    stdin: StdinHandle,
    gone: bool,
}

impl PipeDestination {
    pub fn new(consumer: impl Into<String>, stdin: StdinHandle) -> Self {
        Self {
            consumer: consumer.into(),
            stdin,
            gone: false,
        }
    }
}

#[async_trait]
impl OutputDestination for PipeDestination {
    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        if self.gone {
            return Ok(());
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            self.gone = true;
            return Ok(());
        };
        match stdin.write_all(line).await {
            Ok(()) => Ok(()),
            // The consumer stopped reading; what happens next is decided by
            // the block-set once the consumer's exit is observed.
            Err(e) if matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset) => {
                debug!(consumer = %self.consumer, "downstream closed its input");
                self.gone = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn finish(&mut self) -> io::Result<()> {
        if self.gone {
            return Ok(());
        }
        if let Some(stdin) = self.stdin.lock().await.as_mut() {
            if let Err(e) = stdin.flush().await {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Debug,
}

/// Emits every line as a tracing event tagged with the plugin.
pub struct LogDestination {
    plugin: String,
    role: PluginRole,
    stream: Stream,
    level: LogLevel,
}

impl LogDestination {
    pub fn new(plugin: impl Into<String>, role: PluginRole, stream: Stream, level: LogLevel) -> Self {
        Self {
            plugin: plugin.into(),
            role,
            stream,
            level,
        }
    }
}

#[async_trait]
impl OutputDestination for LogDestination {
    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end();
        match self.level {
            LogLevel::Info => info!(plugin = %self.plugin, role = %self.role, stream = %self.stream, "{}", text),
            LogLevel::Debug => debug!(plugin = %self.plugin, role = %self.role, stream = %self.stream, "{}", text),
        }
        Ok(())
    }
}

/// Keeps the last JSON object seen on a stream; loaders report state this way.
#[derive(Clone, Default)]
pub struct StateCapture {
    latest: Arc<Mutex<Option<serde_json::Value>>>,
}

impl StateCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<serde_json::Value> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl OutputDestination for StateCapture {
    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_slice::<serde_json::Value>(line) {
            *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        }
        Ok(())
    }
}

/// Newline framing that remembers whether each frame was terminated, so the
/// relay only writes back newlines the child actually wrote.
struct LineFrames {
    inner: AnyDelimiterCodec,
}

impl LineFrames {
    fn new(limit: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(vec![b'\n'], vec![b'\n'], limit),
        }
    }
}

impl Decoder for LineFrames {
    type Item = (Bytes, bool);
    type Error = AnyDelimiterCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(buf)?.map(|line| (line, true)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.inner.decode(buf)? {
            return Ok(Some((line, true)));
        }
        Ok(self.inner.decode_eof(buf)?.map(|rest| (rest, false)))
    }
}

/// Spawn a task relaying `reader` line by line into `destinations`.
///
/// A line longer than `limit` bytes (newline excluded) fails the drain with
/// [`DrainError::LineTooLong`].
pub fn spawn_drain<R>(
    reader: R,
    plugin: String,
    stream: Stream,
    limit: usize,
    destinations: Vec<Box<dyn OutputDestination>>,
) -> (DrainHandle, AbortHandle)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let task = tokio::spawn(relay_lines(reader, plugin.clone(), stream, limit, destinations));
    let abort = task.abort_handle();
    let handle = async move {
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(DrainError::Io {
                plugin,
                stream,
                kind: io::ErrorKind::Other,
                message: e.to_string(),
            }),
        }
    }
    .boxed()
    .shared();
    (handle, abort)
}

async fn relay_lines<R>(
    reader: R,
    plugin: String,
    stream: Stream,
    limit: usize,
    mut destinations: Vec<Box<dyn OutputDestination>>,
) -> Result<(), DrainError>
where
    R: AsyncRead + Unpin + Send,
{
    let io_error = |e: io::Error| DrainError::Io {
        plugin: plugin.clone(),
        stream,
        kind: e.kind(),
        message: e.to_string(),
    };

    let mut frames = FramedRead::new(reader, LineFrames::new(limit));
    let mut line = Vec::new();
    while let Some(frame) = frames.next().await {
        let (chunk, terminated) = match frame {
            Ok(chunk) => chunk,
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                return Err(DrainError::LineTooLong {
                    plugin: plugin.clone(),
                    stream,
                    limit,
                })
            }
            Err(AnyDelimiterCodecError::Io(e)) => return Err(io_error(e)),
        };
        line.clear();
        line.extend_from_slice(&chunk);
        if terminated {
            line.push(b'\n');
        }
        for dst in destinations.iter_mut() {
            dst.write_line(&line).await.map_err(io_error)?;
        }
    }
    for dst in destinations.iter_mut() {
        dst.finish().await.map_err(io_error)?;
    }
    Ok(())
}
