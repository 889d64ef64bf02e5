use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::block::DEFAULT_STREAM_BUFFER_SIZE;
use crate::plugins::{JobRegistry, PluginDescriptor, PluginRegistry, PluginRole};

/// Overrides `settings.stream_buffer_size` when set.
pub const STREAM_BUFFER_SIZE_ENV: &str = "ELTPIPE_STREAM_BUFFER_SIZE";

/// Project file (`eltpipe.yaml`): plugins, saved jobs and run settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Project {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
    #[serde(default)]
    pub jobs: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Bytes buffered between two linked blocks; lines may use half of it.
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    /// Relative to the project file's directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            state_dir: None,
        }
    }
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_stream_buffer_size() -> usize {
    DEFAULT_STREAM_BUFFER_SIZE
}

impl Project {
    pub fn plugin_registry(&self) -> PluginRegistry {
        PluginRegistry::new(self.plugins.iter().cloned())
    }

    pub fn job_registry(&self) -> JobRegistry {
        JobRegistry::new(self.jobs.clone())
    }
}

/// Load YAML file into Project, applying environment overrides
pub fn load_project(path: &Path) -> anyhow::Result<Project> {
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    let mut project: Project =
        serde_yaml::from_str(&content).with_context(|| format!("failed to parse YAML {:?}", path))?;

    if let Ok(value) = std::env::var(STREAM_BUFFER_SIZE_ENV) {
        project.settings.stream_buffer_size = value
            .trim()
            .parse()
            .with_context(|| format!("{} must be a byte count, got '{}'", STREAM_BUFFER_SIZE_ENV, value))?;
    }
    Ok(project)
}

/// Validate names: unique plugins, unique mapping names, jobs that only reference known names
pub fn validate_project(p: &Project) -> anyhow::Result<()> {
    if p.settings.stream_buffer_size < 2 {
        anyhow::bail!(
            "stream_buffer_size must be at least 2 bytes, got {}",
            p.settings.stream_buffer_size
        );
    }

    let mut names = HashSet::new();
    for plugin in &p.plugins {
        if !names.insert(plugin.name.as_str()) {
            anyhow::bail!("duplicate plugin name '{}'", plugin.name);
        }
    }

    let mut mappings = HashSet::new();
    for plugin in &p.plugins {
        if plugin.role != PluginRole::Mapper && !plugin.mappings.is_empty() {
            anyhow::bail!("plugin '{}' declares mappings but is a {}", plugin.name, plugin.role);
        }
        for mapping in &plugin.mappings {
            if !mappings.insert(mapping.name.as_str()) {
                anyhow::bail!("duplicate mapping name '{}'", mapping.name);
            }
            if mapping.name != plugin.name && names.contains(mapping.name.as_str()) {
                anyhow::bail!(
                    "mapping '{}' of '{}' has the same name as a plugin",
                    mapping.name,
                    plugin.name
                );
            }
        }
        for command in plugin.commands.keys() {
            if command.is_empty() || command.contains(':') {
                anyhow::bail!("plugin '{}' has an invalid command name '{}'", plugin.name, command);
            }
        }
    }

    for (job, tokens) in &p.jobs {
        if names.contains(job.as_str()) {
            anyhow::bail!("job '{}' has the same name as a plugin", job);
        }
        if tokens.is_empty() {
            anyhow::bail!("job '{}' has no tasks", job);
        }
        for token in tokens {
            let name = token.split_once(':').map_or(token.as_str(), |(name, _)| name);
            if !names.contains(name) && !mappings.contains(name) {
                anyhow::bail!("job '{}' references unknown plugin '{}'", job, name);
            }
        }
    }

    Ok(())
}

/// Directory containing the project file. Plugins run from here.
pub fn project_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Directory holding run artifacts and state, next to the project file.
pub fn project_home(path: &Path) -> PathBuf {
    project_dir(path).join(".eltpipe")
}

pub fn state_dir(path: &Path, project: &Project) -> PathBuf {
    match &project.settings.state_dir {
        Some(dir) => project_dir(path).join(dir),
        None => project_home(path).join("state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
environment: prod
settings:
  stream_buffer_size: 2048
plugins:
  - name: tap-csv
    role: extractor
    capabilities: [state]
    config:
      path: ${DATA_DIR}/input.csv
  - name: transform-field
    role: mapper
    mappings:
      - name: hash-emails
        config:
          field: email
  - name: target-jsonl
    role: loader
  - name: dbt
    role: transformer
    commands:
      run:
        args: [run]
jobs:
  daily: [tap-csv, hash-emails, target-jsonl, "dbt:run"]
"#;

    fn write(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("eltpipe.yaml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let project = load_project(&write(dir.path(), PROJECT)).unwrap();
        validate_project(&project).unwrap();
        assert_eq!(project.environment, "prod");
        assert_eq!(project.plugins.len(), 4);
        assert!(project.job_registry().get("daily").is_some());
        let registry = project.plugin_registry();
        assert_eq!(registry.find_mapping("hash-emails").unwrap().name, "transform-field");
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "plugins: []\n");
        let project = load_project(&path).unwrap();
        assert_eq!(project.environment, "dev");
        assert_eq!(state_dir(&path, &project), dir.path().join(".eltpipe").join("state"));
        assert_eq!(project_dir(Path::new("eltpipe.yaml")), PathBuf::from("."));
    }

    #[test]
    fn test_rejects_duplicates_and_unknown_references() {
        let dir = tempfile::tempdir().unwrap();
        let duplicate = "plugins:\n  - {name: tap-csv, role: extractor}\n  - {name: tap-csv, role: loader}\n";
        let project = load_project(&write(dir.path(), duplicate)).unwrap();
        assert!(validate_project(&project).unwrap_err().to_string().contains("duplicate plugin"));

        let unknown = "plugins:\n  - {name: tap-csv, role: extractor}\njobs:\n  daily: [tap-csv, target-x]\n";
        let project = load_project(&write(dir.path(), unknown)).unwrap();
        assert!(validate_project(&project).unwrap_err().to_string().contains("target-x"));

        let clash = "plugins:\n  - {name: daily, role: utility}\njobs:\n  daily: [daily]\n";
        let project = load_project(&write(dir.path(), clash)).unwrap();
        assert!(validate_project(&project).is_err());
    }

    #[test]
    fn test_rejects_mapping_named_like_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
plugins:
  - {name: target-jsonl, role: loader}
  - name: transform-field
    role: mapper
    mappings:
      - name: target-jsonl
"#;
        let project = load_project(&write(dir.path(), yaml)).unwrap();
        let err = validate_project(&project).unwrap_err();
        assert!(err.to_string().contains("same name as a plugin"));
    }

    #[test]
    fn test_invalid_yaml_has_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_project(&write(dir.path(), "plugins: [")).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to parse YAML"));
    }
}
