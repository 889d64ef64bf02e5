use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::OnceLock;
use uuid::Uuid;

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env pattern is valid")
    })
}

/// Replace `${NAME}` with the value from `env`, falling back to the process
/// environment. Unknown names expand to the empty string.
pub fn expand_env(template: &str, env: &HashMap<String, String>) -> String {
    env_pattern()
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            env.get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Expand env references in every string of a JSON value.
pub fn expand_env_json(value: &serde_json::Value, env: &HashMap<String, String>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(expand_env(s, env)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| expand_env_json(v, env)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_env_json(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Create a run directory and return it
pub fn create_run_dir(base: &Path) -> std::io::Result<PathBuf> {
    let run_id = Uuid::new_v4().to_string();
    let dir = base.join("run").join(run_id);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub async fn write_artifact(dir: &Path, name: &str, content: &str) -> std::io::Result<PathBuf> {
    let path = dir.join(name);
    tokio::fs::write(&path, content).await?;
    Ok(path)
}

/// Replace characters that are illegal in file names on any platform
pub fn sanitize_filename(name: &str) -> String {
    let illegal = ['<', '>', '/', '\\', '|', '?', '*', ':', '"'];
    name.chars()
        .map(|c| if illegal.contains(&c) { '_' } else { c })
        .collect()
}

/// Numeric exit code; a process killed by signal N reports -N.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
