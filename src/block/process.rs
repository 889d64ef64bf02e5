use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::util::exit_code;

/// How long a terminated process gets before it is killed.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Kill,
    Terminate,
}

/// A spawned plugin process, watched by its own exit-wait task.
///
/// The task owns the `Child`; this handle only sends it stop signals and
/// observes the exit code, so any number of waiters can race on it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exited: watch::Receiver<Option<i32>>,
    signals: mpsc::UnboundedSender<StopSignal>,
}

impl ProcessHandle {
    pub fn watch(child: Child, plugin: &str) -> Self {
        let pid = child.id();
        let (exit_tx, exited) = watch::channel(None);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(wait_for_exit(child, plugin.to_string(), signal_rx, exit_tx));
        Self { pid, exited, signals }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code if the process already finished.
    pub fn try_exit_code(&self) -> Option<i32> {
        *self.exited.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.try_exit_code().is_some()
    }

    pub async fn wait(&self) -> i32 {
        let mut exited = self.exited.clone();
        let code = match exited.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(-1),
            Err(_) => -1,
        };
        code
    }

    /// An owned future resolving to the exit code.
    pub fn exit_future(&self) -> BoxFuture<'static, i32> {
        let mut exited = self.exited.clone();
        async move {
            let code = match exited.wait_for(Option::is_some).await {
                Ok(code) => code.unwrap_or(-1),
                Err(_) => -1,
            };
            code
        }
        .boxed()
    }

    pub fn kill(&self) {
        let _ = self.signals.send(StopSignal::Kill);
    }

    pub fn terminate(&self) {
        let _ = self.signals.send(StopSignal::Terminate);
    }

    /// Stop the process and wait for it to exit.
    pub async fn stop(&self, kill: bool) -> i32 {
        if self.has_exited() {
            return self.wait().await;
        }
        if kill {
            self.kill();
            return self.wait().await;
        }
        self.terminate();
        match tokio::time::timeout(STOP_GRACE_PERIOD, self.wait()).await {
            Ok(code) => code,
            Err(_) => {
                warn!(pid = ?self.pid, "process ignored SIGTERM, killing");
                self.kill();
                self.wait().await
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    plugin: String,
    mut signals: mpsc::UnboundedReceiver<StopSignal>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let status = loop {
        let signal = tokio::select! {
            status = child.wait() => break status,
            signal = signals.recv() => signal,
        };
        match signal {
            Some(StopSignal::Kill) => {
                if let Err(e) = child.start_kill() {
                    debug!(plugin = %plugin, error = %e, "kill failed");
                }
            }
            Some(StopSignal::Terminate) => send_terminate(&mut child, &plugin),
            None => break child.wait().await,
        }
    };
    let code = match status {
        Ok(status) => exit_code(&status),
        Err(e) => {
            warn!(plugin = %plugin, error = %e, "failed to wait for process");
            -1
        }
    };
    debug!(plugin = %plugin, code, "process exited");
    let _ = exit_tx.send(Some(code));
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, plugin: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else { return };
    let Ok(pid) = i32::try_from(pid) else { return };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(plugin = %plugin, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, plugin: &str) {
    if let Err(e) = child.start_kill() {
        debug!(plugin = %plugin, error = %e, "kill failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sh")
    }

    #[tokio::test]
    async fn test_exit_code_observed_by_every_waiter() {
        let handle = ProcessHandle::watch(sh("exit 7"), "util");
        let racing = handle.exit_future();
        assert_eq!(handle.wait().await, 7);
        assert_eq!(racing.await, 7);
        assert_eq!(handle.try_exit_code(), Some(7));
    }

    #[tokio::test]
    async fn test_kill_reports_signal() {
        let handle = ProcessHandle::watch(sh("sleep 30"), "tap-slow");
        assert!(!handle.has_exited());
        assert_eq!(handle.stop(true).await, -9);
    }

    #[tokio::test]
    async fn test_terminate_is_graceful() {
        let handle = ProcessHandle::watch(sh("trap 'exit 4' TERM; while true; do sleep 0.05; done"), "tap-trap");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.stop(false).await, 4);
    }
}
