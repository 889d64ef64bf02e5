use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;
use uuid::Uuid;

use crate::plugins::PluginDescriptor;
use crate::util::{expand_env, expand_env_json, sanitize_filename, write_artifact};

/// Per-invocation inputs for preparing a plugin's on-disk files.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// Directory under which this invocation gets its own folder.
    pub run_dir: PathBuf,
    /// Mapping configuration to apply when the plugin is a mapper.
    pub mapping: Option<String>,
    /// Incoming incremental state handed to the plugin.
    pub state: Option<serde_json::Value>,
}

/// Files written for one invocation. Removed again by [`Invoker::cleanup`].
#[derive(Debug, Clone)]
pub struct PreparedInvocation {
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct StdioFlags {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// Prepares and spawns plugin processes.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn prepare(
        &self,
        plugin: &PluginDescriptor,
        ctx: &InvocationContext,
    ) -> io::Result<PreparedInvocation>;

    fn spawn(
        &self,
        plugin: &PluginDescriptor,
        prepared: &PreparedInvocation,
        extra_args: &[String],
        stdio: StdioFlags,
    ) -> io::Result<Child>;

    /// Remove prepared files. A resource that is already gone is not an error.
    async fn cleanup(&self, prepared: &PreparedInvocation) -> io::Result<()>;
}

/// Local invoker: runs the plugin executable on the host
pub struct LocalInvoker {
    working_dir: PathBuf,
}

impl LocalInvoker {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn prepare(
        &self,
        plugin: &PluginDescriptor,
        ctx: &InvocationContext,
    ) -> io::Result<PreparedInvocation> {
        // One folder per invocation: the same plugin may appear twice in a run.
        let mut folder = sanitize_filename(&plugin.name);
        if let Some(mapping) = &ctx.mapping {
            folder = format!("{}--{}", folder, sanitize_filename(mapping));
        }
        let dir = ctx.run_dir.join(format!("{}-{}", folder, Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await?;

        let mut config = plugin.config.clone();
        if let Some(mapping) = ctx.mapping.as_deref().and_then(|m| plugin.mapping(m)) {
            for (k, v) in &mapping.config {
                config.insert(k.clone(), v.clone());
            }
        }
        let config = expand_env_json(&serde_json::Value::Object(config), &plugin.env);
        let config_path = write_artifact(&dir, "config.json", &serde_json::to_string_pretty(&config)?).await?;

        let state_path = match &ctx.state {
            Some(state) => Some(write_artifact(&dir, "state.json", &state.to_string()).await?),
            None => None,
        };

        debug!(plugin = %plugin.name, dir = ?dir, "prepared invocation");
        Ok(PreparedInvocation {
            dir,
            config_path,
            state_path,
        })
    }

    fn spawn(
        &self,
        plugin: &PluginDescriptor,
        prepared: &PreparedInvocation,
        extra_args: &[String],
        stdio: StdioFlags,
    ) -> io::Result<Child> {
        let mut c = Command::new(expand_env(plugin.executable(), &plugin.env));
        c.args(plugin.args.iter().map(|a| expand_env(a, &plugin.env)));

        // Streaming plugins take their files as arguments; everything else
        // finds the config through the environment.
        if !plugin.role.is_command_eligible() {
            c.arg("--config").arg(&prepared.config_path);
            if let Some(state_path) = &prepared.state_path {
                c.arg("--state").arg(state_path);
            }
        }
        c.args(extra_args);

        for (k, v) in &plugin.env {
            c.env(k, expand_env(v, &plugin.env));
        }
        c.env("ELTPIPE_PLUGIN_CONFIG", &prepared.config_path);

        c.current_dir(&self.working_dir)
            .stdin(if stdio.stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(if stdio.stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(if stdio.stderr { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);

        c.spawn()
    }

    async fn cleanup(&self, prepared: &PreparedInvocation) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&prepared.dir).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
