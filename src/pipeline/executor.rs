use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backends::{Invoker, LocalInvoker};
use crate::block::{BlockParser, PlanEntry, PlanOptions, RunFlags, RunSession};
use crate::error::RunError;
use crate::pipeline::parser::{load_project, project_dir, project_home, state_dir, validate_project, Project};
use crate::state::StateStore;
use crate::util::create_run_dir;

/// Public entry used by main.rs
pub async fn run(project_path: &Path, tokens: &[String], flags: RunFlags) -> anyhow::Result<()> {
    let project = load_project(project_path)?;
    validate_project(&project)?;
    let plan = build_plan(project_path, &project, tokens, flags)?;
    info!(entries = plan.len(), environment = %project.environment, "starting run");

    let store = StateStore::open(state_dir(project_path, &project))?;
    let run_dir = create_run_dir(&project_home(project_path)).context("failed to create run directory")?;
    let session = RunSession::new(store, run_dir);

    // graceful shutdown on Ctrl+C
    let cancel = session.cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received Ctrl+C, stopping the running entry");
            cancel.cancel();
        }
    });

    let result = run_plan(plan, &session).await;
    ctrl_c.abort();
    session.close();

    if let Err(e) = &result {
        if let Some(codes) = e.exit_codes() {
            for (role, code) in codes {
                error!(%role, code, "plugin failed");
            }
        }
    }
    result?;
    info!("run finished");
    Ok(())
}

/// Validate-only helper for main.rs: parse the request and print the plan.
pub fn validate(project_path: &Path, tokens: &[String]) -> anyhow::Result<()> {
    let project = load_project(project_path)?;
    validate_project(&project)?;
    let plan = build_plan(project_path, &project, tokens, RunFlags::default())?;
    for (index, entry) in plan.iter().enumerate() {
        match entry {
            PlanEntry::Pipeline(set) => match set.state_id() {
                Some(state_id) => println!("{}. pipeline: {} (state: {})", index + 1, set.describe(), state_id),
                None => println!("{}. pipeline: {}", index + 1, set.describe()),
            },
            PlanEntry::Command(cmd) => println!("{}. command: {}", index + 1, cmd.describe()),
        }
    }
    println!("Plan validated");
    Ok(())
}

fn build_plan(
    project_path: &Path,
    project: &Project,
    tokens: &[String],
    flags: RunFlags,
) -> anyhow::Result<Vec<PlanEntry>> {
    let plugins = project.plugin_registry();
    let jobs = project.job_registry();
    let invoker: Arc<dyn Invoker> = Arc::new(LocalInvoker::new(project_dir(project_path)));
    let options = PlanOptions {
        flags,
        stream_buffer_size: project.settings.stream_buffer_size,
        environment: project.environment.clone(),
    };
    let plan = BlockParser::new(&plugins, &jobs, invoker, options)
        .parse(tokens)
        .with_context(|| format!("invalid run request {:?}", tokens))?;
    Ok(plan)
}

/// Run every entry in order, stopping at the first failure.
pub async fn run_plan(plan: Vec<PlanEntry>, session: &RunSession) -> Result<(), RunError> {
    let total = plan.len();
    for (index, mut entry) in plan.into_iter().enumerate() {
        let name = entry.describe();
        let aborted = |source: RunError| RunError::Aborted {
            index,
            entry: name.clone(),
            source: Box::new(source),
        };
        if session.cancel.is_cancelled() {
            return Err(aborted(RunError::Cancelled));
        }
        info!(entry = %name, step = index + 1, total, "starting plan entry");
        entry.run(session).await.map_err(aborted)?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugins::PluginRole;
    use std::path::PathBuf;

    fn project(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("eltpipe.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    const PROJECT: &str = r#"
plugins:
  - name: tap-lines
    role: extractor
    executable: sh
    args: ["-c", "printf '{\"id\":1}\\n{\"id\":2}\\n'"]
  - name: target-file
    role: loader
    executable: sh
    args: ["-c", "cat > loaded.jsonl"]
  - name: target-broken
    role: loader
    executable: sh
    args: ["-c", "cat > /dev/null; exit 3"]
  - name: marker
    role: utility
    executable: sh
    args: ["-c", "touch marker"]
jobs:
  load: [tap-lines, target-file]
"#;

    fn tokens(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_job_then_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = project(dir.path(), PROJECT);
        run(&path, &tokens(&["load", "marker"]), RunFlags::default())
            .await
            .unwrap();

        let loaded = std::fs::read_to_string(dir.path().join("loaded.jsonl")).unwrap();
        assert_eq!(loaded, "{\"id\":1}\n{\"id\":2}\n");
        assert!(dir.path().join("marker").exists());
        // per-run files are gone once the session closes
        let runs = std::fs::read_dir(dir.path().join(".eltpipe").join("run")).unwrap();
        assert_eq!(runs.count(), 0);
    }

    #[tokio::test]
    async fn test_first_failure_aborts_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = project(dir.path(), PROJECT);
        let err = run(&path, &tokens(&["tap-lines", "target-broken", "marker"]), RunFlags::default())
            .await
            .unwrap_err();
        let run_err = err.downcast_ref::<RunError>().expect("run error");
        match run_err {
            RunError::Aborted { index, entry, .. } => {
                assert_eq!(*index, 0);
                assert_eq!(entry, "tap-lines target-broken");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(run_err.exit_codes().unwrap().get(&PluginRole::Loader), Some(&3));
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_invalid_request_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = project(dir.path(), PROJECT);
        let err = run(&path, &tokens(&["marker", "target-file"]), RunFlags::default())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("invalid block sequence at index 1"));
        assert!(!dir.path().join("marker").exists());
        assert!(!dir.path().join(".eltpipe").join("run").exists());
    }

    #[test]
    fn test_validate_prints_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = project(dir.path(), PROJECT);
        validate(&path, &tokens(&["load", "marker"])).unwrap();
        assert!(validate(&path, &tokens(&["tap-missing"])).is_err());
    }
}
