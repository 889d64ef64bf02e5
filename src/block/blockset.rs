use async_trait::async_trait;
use futures::future::{select_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use super::relay::{LogDestination, LogLevel, PipeDestination, StateCapture, Stream};
use super::{IoBlock, RunFlags, RunSession};
use crate::error::{DrainError, PlanError, RunError};
use crate::plugins::PluginRole;

/// A validated group of blocks executed and torn down as one unit.
#[async_trait]
pub trait BlockSet: Send {
    fn validate_set(&self) -> Result<(), PlanError>;

    async fn run(&mut self, session: &RunSession) -> Result<(), RunError>;

    /// Stop every block and release its resources.
    async fn terminate(&mut self) -> Result<(), RunError>;
}

/// The outcome of one pipeline, reduced from its two sides' exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Success,
    ProducerFailed(i32),
    ConsumerFailed(i32),
    BothFailed { producer: i32, consumer: i32 },
}

impl PipelineOutcome {
    pub fn from_codes(producer: i32, consumer: i32) -> Self {
        match (producer, consumer) {
            (0, 0) => Self::Success,
            (producer, 0) => Self::ProducerFailed(producer),
            (0, consumer) => Self::ConsumerFailed(consumer),
            (producer, consumer) => Self::BothFailed { producer, consumer },
        }
    }

    /// `producer` and `consumer` are the (name, role) of the first and last block.
    pub fn into_result(self, producer: (&str, PluginRole), consumer: (&str, PluginRole)) -> Result<(), RunError> {
        let (message, exit_codes) = match self {
            Self::Success => return Ok(()),
            Self::ProducerFailed(code) => (
                format!("{} '{}' failed with exit code {}", capitalized(producer.1), producer.0, code),
                BTreeMap::from([(producer.1, code)]),
            ),
            Self::ConsumerFailed(code) => (
                format!("{} '{}' failed with exit code {}", capitalized(consumer.1), consumer.0, code),
                BTreeMap::from([(consumer.1, code)]),
            ),
            Self::BothFailed {
                producer: producer_code,
                consumer: consumer_code,
            } => (
                format!(
                    "{} '{}' and {} '{}' failed with exit codes {} and {}",
                    capitalized(producer.1),
                    producer.0,
                    consumer.1,
                    consumer.0,
                    producer_code,
                    consumer_code
                ),
                BTreeMap::from([(producer.1, producer_code), (consumer.1, consumer_code)]),
            ),
        };
        Err(RunError::PipelineFailed { message, exit_codes })
    }
}

fn capitalized(role: PluginRole) -> String {
    let role = role.to_string();
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => role,
    }
}

/// Exit code to report for a side that is marked failed regardless of how it ended.
fn failed_code(code: Option<i32>) -> i32 {
    match code {
        Some(code) if code != 0 => code,
        _ => 1,
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockSetOptions {
    /// Set when the extractor keeps incremental state.
    pub state_id: Option<String>,
    pub flags: RunFlags,
    pub stream_buffer_size: usize,
}

/// An extractor, zero or more mappers and a loader, linked stdout to stdin.
pub struct ExtractLoadBlocks {
    blocks: Vec<Box<dyn IoBlock>>,
    options: BlockSetOptions,
}

impl ExtractLoadBlocks {
    pub fn new(blocks: Vec<Box<dyn IoBlock>>, options: BlockSetOptions) -> Result<Self, PlanError> {
        let set = Self { blocks, options };
        set.validate_set()?;
        Ok(set)
    }

    pub fn blocks(&self) -> &[Box<dyn IoBlock>] {
        &self.blocks
    }

    pub fn state_id(&self) -> Option<&str> {
        self.options.state_id.as_deref()
    }

    pub fn describe(&self) -> String {
        self.blocks()
            .iter()
            .map(|b| b.label())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn head(&self) -> &dyn IoBlock {
        self.blocks[0].as_ref()
    }

    fn tail(&self) -> &dyn IoBlock {
        self.blocks[self.blocks.len() - 1].as_ref()
    }

    fn acquire_state(&self, session: &RunSession) -> Result<Option<serde_json::Value>, RunError> {
        let Some(state_id) = self.options.state_id.as_deref() else {
            return Ok(None);
        };
        session.store.acquire(state_id, self.options.flags.force)?;
        if self.options.flags.full_refresh {
            info!(state_id, "full refresh, ignoring stored state");
            return Ok(None);
        }
        let state = session.store.get(state_id)?;
        if state.is_some() {
            debug!(state_id, "resuming from stored state");
        }
        Ok(state)
    }

    /// Prepare and start every block, left to right.
    async fn start_blocks(
        &mut self,
        session: &RunSession,
        state: Option<serde_json::Value>,
    ) -> Result<(), RunError> {
        let mut ctx = session.invocation_context();
        ctx.state = state;
        for block in self.blocks.iter_mut() {
            block.pre(&ctx).await?;
            block.start().await?;
            // only the extractor reads state
            ctx.state = None;
        }
        Ok(())
    }

    /// Link each block's stdout to the next block's stdin, left to right.
    fn link_io(&mut self, capture: &StateCapture) -> Result<(), RunError> {
        let last = self.blocks.len() - 1;
        for index in 0..self.blocks.len() {
            if index == 0 && self.blocks[index].consumer() {
                return Err(RunError::NoUpstream {
                    plugin: self.blocks[index].name().to_string(),
                });
            }
            if index < last {
                let next = &self.blocks[index + 1];
                let pipe = PipeDestination::new(next.name(), next.stdin()?);
                self.blocks[index].link_stdout(Box::new(pipe))?;
            }
            let block = &mut self.blocks[index];
            let log = LogDestination::new(block.name(), block.role(), Stream::Stderr, LogLevel::Info);
            block.link_stderr(Box::new(log))?;
        }

        let tail = &mut self.blocks[last];
        let log = LogDestination::new(tail.name(), tail.role(), Stream::Stdout, LogLevel::Debug);
        tail.link_stdout(Box::new(log))?;
        if self.options.state_id.is_some() && !self.options.flags.no_state_update {
            tail.link_stdout(Box::new(capture.clone()))?;
        }
        Ok(())
    }

    fn exit_futures(&self) -> Result<Vec<BoxFuture<'static, i32>>, RunError> {
        self.blocks
            .iter()
            .map(|b| Ok(b.process()?.exit_future()))
            .collect()
    }

    fn drain_failure(&self, index: usize, stream: Stream, err: DrainError) -> RunError {
        if index == 0 && stream == Stream::Stdout {
            if let DrainError::LineTooLong { plugin, limit, .. } = &err {
                return RunError::OutputLineLimit {
                    plugin: plugin.clone(),
                    limit: *limit,
                    buffer_size: self.options.stream_buffer_size,
                };
            }
        }
        RunError::Drain(err)
    }

    /// Wait until both output streams of block `index` are fully relayed.
    async fn await_output(&mut self, index: usize) -> Result<(), RunError> {
        let stdout = self.blocks[index].proxy_stdout()?;
        let stderr = self.blocks[index].proxy_stderr()?;
        if let Err(e) = stdout.await {
            return Err(self.drain_failure(index, Stream::Stdout, e));
        }
        if let Err(e) = stderr.await {
            return Err(self.drain_failure(index, Stream::Stderr, e));
        }
        Ok(())
    }

    async fn wait_for_completion(&mut self) -> Result<(), RunError> {
        let last = self.blocks.len() - 1;

        let mut drains = Vec::with_capacity(self.blocks.len() * 2);
        for (index, block) in self.blocks.iter_mut().enumerate() {
            drains.push((index, Stream::Stdout, block.proxy_stdout()?));
            drains.push((index, Stream::Stderr, block.proxy_stderr()?));
        }

        // Output failures are raced against the first process exit.
        let first_failure = async {
            let mut pending: FuturesUnordered<_> = drains
                .iter()
                .map(|(index, stream, handle)| {
                    let (index, stream, handle) = (*index, *stream, handle.clone());
                    async move { (index, stream, handle.await) }
                })
                .collect();
            while let Some((index, stream, result)) = pending.next().await {
                if let Err(e) = result {
                    return Some((index, stream, e));
                }
            }
            None
        };
        let first_exit = select_all(self.exit_futures()?);
        let failure = tokio::select! {
            failure = first_failure => failure,
            _ = first_exit => None,
        };
        if let Some((index, stream, err)) = failure {
            return Err(self.drain_failure(index, stream, err));
        }

        select_all(self.exit_futures()?).await;

        let mut mapper_failure = None;
        let (producer_code, consumer_code) = if self.tail().process()?.has_exited() {
            let upstream_done = self.blocks[..last]
                .iter()
                .all(|b| b.process().map(|p| p.has_exited()).unwrap_or(true));
            let producer_code = if upstream_done {
                self.head().process()?.wait().await
            } else {
                // The upstream side did not fail, it just was not read to the end.
                warn!(
                    consumer = %self.tail().name(),
                    "consumer finished before consuming all upstream output, stopping upstream"
                );
                for block in self.blocks[..last].iter_mut() {
                    if !block.process()?.has_exited() {
                        block.stop(true).await?;
                    }
                }
                0
            };
            self.await_output(last).await?;
            (producer_code, self.tail().process()?.wait().await)
        } else if self.head().process()?.has_exited() {
            self.await_output(0).await?;
            for index in 1..=last {
                self.blocks[index].close_stdin().await?;
                if index < last {
                    let code = self.blocks[index].process()?.wait().await;
                    if code != 0 && mapper_failure.is_none() {
                        mapper_failure = Some((index, code));
                    }
                    self.await_output(index).await?;
                }
            }
            self.await_output(last).await?;
            (
                self.head().process()?.wait().await,
                self.tail().process()?.wait().await,
            )
        } else {
            let culprit = self
                .blocks
                .iter()
                .find(|b| b.process().map(|p| p.has_exited()).unwrap_or(false))
                .map(|b| b.name().to_string())
                .unwrap_or_default();
            error!(
                pipeline = %self.describe(),
                block = %culprit,
                "unexpected completion sequence, stopping every block"
            );
            let producer_code = failed_code(self.head().process()?.try_exit_code());
            let consumer_code = failed_code(self.tail().process()?.try_exit_code());
            for block in self.blocks.iter_mut() {
                if !block.process()?.has_exited() {
                    block.stop(true).await?;
                }
            }
            let (head, tail) = (self.head(), self.tail());
            let exit_codes = BTreeMap::from([(head.role(), producer_code), (tail.role(), consumer_code)]);
            return Err(RunError::PipelineFailed {
                message: format!(
                    "unexpected completion sequence: '{}' exited before '{}' and '{}' (exit codes {} and {})",
                    culprit,
                    head.name(),
                    tail.name(),
                    producer_code,
                    consumer_code
                ),
                exit_codes,
            });
        };

        let outcome = PipelineOutcome::from_codes(producer_code, consumer_code);
        debug!(pipeline = %self.describe(), ?outcome, "block set finished");
        if let (PipelineOutcome::Success, Some((index, code))) = (outcome, mapper_failure) {
            let mapper = &self.blocks[index];
            return Err(RunError::PipelineFailed {
                message: format!("Mapper '{}' failed with exit code {}", mapper.label(), code),
                exit_codes: BTreeMap::from([(mapper.role(), code)]),
            });
        }
        outcome.into_result(
            (self.head().name(), self.head().role()),
            (self.tail().name(), self.tail().role()),
        )
    }

    async fn execute(&mut self, session: &RunSession, capture: &StateCapture) -> Result<(), RunError> {
        let state = self.acquire_state(session)?;
        self.start_blocks(session, state).await?;
        self.link_io(capture)?;

        let completion = tokio::select! {
            result = self.wait_for_completion() => Some(result),
            _ = session.cancel.cancelled() => None,
        };
        match completion {
            Some(result) => result,
            None => {
                warn!(pipeline = %self.describe(), "cancelled");
                self.terminate().await?;
                Err(RunError::Cancelled)
            }
        }
    }

    async fn stop_running(&mut self, kill: bool) {
        for block in self.blocks.iter_mut() {
            let running = matches!(block.process(), Ok(p) if !p.has_exited());
            if running {
                if let Err(e) = block.stop(kill).await {
                    warn!(plugin = %block.name(), error = %e, "failed to stop block");
                }
            }
        }
    }
}

#[async_trait]
impl BlockSet for ExtractLoadBlocks {
    fn validate_set(&self) -> Result<(), PlanError> {
        let Some(first) = self.blocks.first() else {
            return Err(PlanError::Adjacency {
                index: 0,
                reason: "a block set cannot be empty".to_string(),
            });
        };
        if first.consumer() {
            return Err(PlanError::Adjacency {
                index: 0,
                reason: format!("first block '{}' must not consume input", first.name()),
            });
        }
        let last_index = self.blocks.len() - 1;
        if last_index == 0 {
            return Err(PlanError::Adjacency {
                index: 0,
                reason: format!("'{}' needs a consumer after it", first.name()),
            });
        }
        let last = &self.blocks[last_index];
        if last.producer() {
            return Err(PlanError::Adjacency {
                index: last_index,
                reason: format!("last block '{}' must not produce output", last.name()),
            });
        }
        for (index, block) in self.blocks.iter().enumerate().take(last_index).skip(1) {
            if !(block.producer() && block.consumer()) {
                return Err(PlanError::Adjacency {
                    index,
                    reason: format!("intermediate block '{}' must both consume and produce", block.name()),
                });
            }
        }
        Ok(())
    }

    async fn run(&mut self, session: &RunSession) -> Result<(), RunError> {
        info!(pipeline = %self.describe(), "running block set");
        let capture = StateCapture::new();
        let mut result = self.execute(session, &capture).await;
        if result.is_err() {
            self.stop_running(true).await;
        }
        for block in self.blocks.iter_mut() {
            if let Err(e) = block.post().await {
                warn!(plugin = %block.name(), error = %e, "post failed");
            }
        }

        if let Some(state_id) = self.options.state_id.as_deref() {
            if result.is_ok() && !self.options.flags.no_state_update {
                match capture.latest() {
                    Some(state) => {
                        result = session.store.put(state_id, state).map_err(RunError::from);
                        info!(state_id, "state updated");
                    }
                    None => debug!(state_id, "loader emitted no state"),
                }
            }
            session.store.release(state_id);
        }

        match &result {
            Ok(()) => info!(pipeline = %self.describe(), "block set completed"),
            Err(e) => error!(pipeline = %self.describe(), error = %e, "block set failed"),
        }
        result
    }

    async fn terminate(&mut self) -> Result<(), RunError> {
        info!(pipeline = %self.describe(), "terminating block set");
        self.stop_running(false).await;
        for block in self.blocks.iter_mut() {
            block.post().await?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backends::{Invoker, LocalInvoker};
    use crate::block::PluginBlock;
    use crate::plugins::{Capability, PluginDescriptor};
    use crate::state::StateStore;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn sh_plugin(name: &str, role: PluginRole, script: &str) -> PluginDescriptor {
        PluginDescriptor::new(name, role)
            .with_executable("sh")
            .with_args(["-c", script])
    }

    fn sh_block(dir: &Path, plugin: PluginDescriptor, buffer_size: usize) -> Box<dyn IoBlock> {
        let invoker: Arc<dyn Invoker> = Arc::new(LocalInvoker::new(dir));
        Box::new(PluginBlock::new(Arc::new(plugin), invoker, buffer_size))
    }

    fn pipeline(dir: &Path, plugins: Vec<PluginDescriptor>) -> ExtractLoadBlocks {
        let blocks = plugins.into_iter().map(|p| sh_block(dir, p, 1024)).collect();
        ExtractLoadBlocks::new(
            blocks,
            BlockSetOptions {
                stream_buffer_size: 1024,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn session(dir: &Path) -> RunSession {
        RunSession::new(StateStore::open(dir.join("state")).unwrap(), dir.join("run"))
    }

    #[test]
    fn test_outcome_reduction() {
        assert_eq!(PipelineOutcome::from_codes(0, 0), PipelineOutcome::Success);
        assert_eq!(PipelineOutcome::from_codes(2, 0), PipelineOutcome::ProducerFailed(2));
        assert_eq!(PipelineOutcome::from_codes(0, 3), PipelineOutcome::ConsumerFailed(3));

        let err = PipelineOutcome::from_codes(2, 5)
            .into_result(("tap-a", PluginRole::Extractor), ("target-b", PluginRole::Loader))
            .unwrap_err();
        let codes = err.exit_codes().unwrap();
        assert_eq!(codes.get(&PluginRole::Extractor), Some(&2));
        assert_eq!(codes.get(&PluginRole::Loader), Some(&5));
        assert_eq!(
            err.to_string(),
            "Extractor 'tap-a' and loader 'target-b' failed with exit codes 2 and 5"
        );
    }

    #[test]
    fn test_validate_set_positions() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        let cases = vec![
            (vec![PluginRole::Loader, PluginRole::Loader], 0),
            (vec![PluginRole::Extractor, PluginRole::Extractor], 1),
            (vec![PluginRole::Extractor, PluginRole::Loader, PluginRole::Loader], 1),
            (vec![PluginRole::Extractor], 0),
        ];
        for (roles, expected) in cases {
            let blocks = roles
                .iter()
                .enumerate()
                .map(|(i, r)| sh_block(d, sh_plugin(&format!("p{}", i), *r, "true"), 1024))
                .collect();
            match ExtractLoadBlocks::new(blocks, BlockSetOptions::default()) {
                Err(PlanError::Adjacency { index, .. }) => assert_eq!(index, expected, "{:?}", roles),
                Err(other) => panic!("unexpected error {other}"),
                Ok(_) => panic!("{:?} should not validate", roles),
            }
        }

        let ok = vec![
            sh_block(d, sh_plugin("tap", PluginRole::Extractor, "true"), 1024),
            sh_block(d, sh_plugin("map", PluginRole::Mapper, "true"), 1024),
            sh_block(d, sh_plugin("target", PluginRole::Loader, "true"), 1024),
        ];
        assert!(ExtractLoadBlocks::new(ok, BlockSetOptions::default()).is_ok());
    }

    #[tokio::test]
    async fn test_records_flow_through_mapper() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = pipeline(
            dir.path(),
            vec![
                sh_plugin("tap-a", PluginRole::Extractor, "printf 'a\\nb\\n'"),
                sh_plugin("map-upper", PluginRole::Mapper, "tr a-z A-Z"),
                sh_plugin("target-b", PluginRole::Loader, "cat > out.txt"),
            ],
        );
        let session = session(dir.path());
        set.run(&session).await.unwrap();
        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out, "A\nB\n");
    }

    #[tokio::test]
    async fn test_consumer_exiting_early_stops_producer() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = pipeline(
            dir.path(),
            vec![
                sh_plugin("tap-a", PluginRole::Extractor, "echo a; exec sleep 30"),
                sh_plugin("target-b", PluginRole::Loader, "exit 0"),
            ],
        );
        let session = session(dir.path());
        let started = Instant::now();
        set.run(&session).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(set.head().process().unwrap().has_exited());
    }

    #[tokio::test]
    async fn test_loader_failure_after_producer_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = pipeline(
            dir.path(),
            vec![
                sh_plugin("tap-a", PluginRole::Extractor, "printf 'a\\nb\\n'"),
                sh_plugin("target-b", PluginRole::Loader, "cat > seen.txt; exit 3"),
            ],
        );
        let session = session(dir.path());
        let err = set.run(&session).await.unwrap_err();
        let codes = err.exit_codes().unwrap();
        assert_eq!(codes.get(&PluginRole::Loader), Some(&3));
        assert!(!codes.contains_key(&PluginRole::Extractor));
        assert!(err.to_string().contains("target-b"));
        // stdin was closed only after all producer output was relayed
        let seen = std::fs::read_to_string(dir.path().join("seen.txt")).unwrap();
        assert_eq!(seen, "a\nb\n");
    }

    #[tokio::test]
    async fn test_loader_sees_eof_after_last_delayed_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = pipeline(
            dir.path(),
            vec![
                sh_plugin("tap-a", PluginRole::Extractor, "echo 1; sleep 0.2; echo 2; sleep 0.2; echo 3"),
                sh_plugin("target-b", PluginRole::Loader, "cat > got.txt; echo eof >> got.txt"),
            ],
        );
        set.run(&session(dir.path())).await.unwrap();
        let got = std::fs::read_to_string(dir.path().join("got.txt")).unwrap();
        assert_eq!(got, "1\n2\n3\neof\n");
    }

    #[tokio::test]
    async fn test_producer_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = pipeline(
            dir.path(),
            vec![
                sh_plugin("tap-a", PluginRole::Extractor, "echo partial; exit 2"),
                sh_plugin("target-b", PluginRole::Loader, "cat > /dev/null"),
            ],
        );
        let err = set.run(&session(dir.path())).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::PipelineFailed { ref exit_codes, .. }
                if exit_codes == &BTreeMap::from([(PluginRole::Extractor, 2)])
        ));
    }

    #[tokio::test]
    async fn test_mapper_exiting_first_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = pipeline(
            dir.path(),
            vec![
                sh_plugin("tap-a", PluginRole::Extractor, "exec sleep 30"),
                sh_plugin("map-broken", PluginRole::Mapper, "exit 1"),
                sh_plugin("target-b", PluginRole::Loader, "exec sleep 30"),
            ],
        );
        let err = set.run(&session(dir.path())).await.unwrap_err();
        let codes = err.exit_codes().unwrap();
        assert_eq!(codes.get(&PluginRole::Extractor), Some(&1));
        assert_eq!(codes.get(&PluginRole::Loader), Some(&1));
        assert!(err.to_string().contains("map-broken"));
        for block in set.blocks() {
            assert!(block.process().unwrap().has_exited());
        }
    }

    #[tokio::test]
    async fn test_oversized_producer_line_has_dedicated_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = vec![
            sh_block(
                dir.path(),
                sh_plugin("tap-a", PluginRole::Extractor, "echo 'this record is far too long'; exec sleep 30"),
                16,
            ),
            sh_block(dir.path(), sh_plugin("target-b", PluginRole::Loader, "cat > /dev/null"), 16),
        ];
        let mut set = ExtractLoadBlocks::new(
            blocks,
            BlockSetOptions {
                stream_buffer_size: 16,
                ..Default::default()
            },
        )
        .unwrap();
        let err = set.run(&session(dir.path())).await.unwrap_err();
        match err {
            RunError::OutputLineLimit {
                plugin,
                limit,
                buffer_size,
            } => {
                assert_eq!(plugin, "tap-a");
                assert_eq!(limit, 8);
                assert_eq!(buffer_size, 16);
            }
            other => panic!("expected line limit error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_terminates_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = pipeline(
            dir.path(),
            vec![
                sh_plugin("tap-a", PluginRole::Extractor, "exec sleep 30"),
                sh_plugin("target-b", PluginRole::Loader, "exec sleep 30"),
            ],
        );
        let session = session(dir.path());
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let err = set.run(&session).await.unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
        for block in set.blocks() {
            assert!(block.process().unwrap().has_exited());
        }
    }

    #[tokio::test]
    async fn test_state_is_captured_and_handed_back() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let state_id = "dev:tap-a-to-target-b";
        let options = BlockSetOptions {
            state_id: Some(state_id.to_string()),
            stream_buffer_size: 1024,
            ..Default::default()
        };

        let tap = sh_plugin("tap-a", PluginRole::Extractor, "echo rec").with_capability(Capability::State);
        let target = sh_plugin(
            "target-b",
            PluginRole::Loader,
            "cat > /dev/null; echo '{\"bookmarks\":{\"n\":1}}'",
        );
        let mut first = ExtractLoadBlocks::new(
            vec![sh_block(dir.path(), tap, 1024), sh_block(dir.path(), target, 1024)],
            options.clone(),
        )
        .unwrap();
        first.run(&session).await.unwrap();
        assert_eq!(
            session.store.get(state_id).unwrap(),
            Some(serde_json::json!({"bookmarks": {"n": 1}}))
        );

        // the extractor now receives the stored state as `--state <file>` ($3)
        let tap = sh_plugin("tap-a", PluginRole::Extractor, "cat \"$3\"; echo").with_capability(Capability::State);
        let target = sh_plugin("target-b", PluginRole::Loader, "cat > got.txt");
        let mut second = ExtractLoadBlocks::new(
            vec![sh_block(dir.path(), tap, 1024), sh_block(dir.path(), target, 1024)],
            options,
        )
        .unwrap();
        second.run(&session).await.unwrap();
        let got = std::fs::read_to_string(dir.path().join("got.txt")).unwrap();
        let got: serde_json::Value = serde_json::from_str(got.trim()).unwrap();
        assert_eq!(got["bookmarks"]["n"], 1);

        // the run lock was released both times
        session.store.acquire(state_id, false).unwrap();
        session.close();
    }
}
