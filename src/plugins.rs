use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// What a plugin does inside a run. Extractors, loaders and mappers stream;
/// every other role runs standalone as a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PluginRole {
    Extractor,
    Mapper,
    Loader,
    Transformer,
    Utility,
    Orchestrator,
}

impl PluginRole {
    pub fn is_producer(self) -> bool {
        matches!(self, Self::Extractor | Self::Mapper)
    }

    pub fn is_consumer(self) -> bool {
        matches!(self, Self::Loader | Self::Mapper)
    }

    /// Roles that may appear on their own in a run request.
    pub fn is_command_eligible(self) -> bool {
        !matches!(self, Self::Extractor | Self::Loader | Self::Mapper)
    }
}

impl fmt::Display for PluginRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Extractor => "extractor",
            Self::Mapper => "mapper",
            Self::Loader => "loader",
            Self::Transformer => "transformer",
            Self::Utility => "utility",
            Self::Orchestrator => "orchestrator",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Accepts and emits incremental state (bookmarks).
    State,
    Catalog,
    Discover,
    About,
}

/// A named subcommand of a command-eligible plugin.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CommandDef {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A named configuration of a mapper plugin.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Mapping {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub role: PluginRole,
    /// Defaults to the plugin name.
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub capabilities: HashSet<Capability>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandDef>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, role: PluginRole) -> Self {
        Self {
            name: name.into(),
            role,
            executable: None,
            args: Vec::new(),
            capabilities: HashSet::new(),
            config: serde_json::Map::new(),
            commands: BTreeMap::new(),
            mappings: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_command(mut self, name: impl Into<String>, def: CommandDef) -> Self {
        self.commands.insert(name.into(), def);
        self
    }

    pub fn with_mapping(mut self, name: impl Into<String>) -> Self {
        self.mappings.push(Mapping {
            name: name.into(),
            config: serde_json::Map::new(),
        });
        self
    }

    pub fn executable(&self) -> &str {
        self.executable.as_deref().unwrap_or(&self.name)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn mapping(&self, name: &str) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.name == name)
    }
}

/// Lookup of plugin descriptors by name or mapper mapping name.
#[derive(Debug, Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<PluginDescriptor>>,
}

impl PluginRegistry {
    pub fn new(plugins: impl IntoIterator<Item = PluginDescriptor>) -> Self {
        Self {
            plugins: plugins
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins.get(name).cloned()
    }

    /// Find the mapper that declares a mapping called `name`.
    pub fn find_mapping(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins
            .values()
            .filter(|p| p.role == PluginRole::Mapper)
            .find(|p| p.mapping(name).is_some())
            .cloned()
    }
}

/// Saved run requests, expanded in place by the block parser.
#[derive(Debug, Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Vec<String>>,
}

impl JobRegistry {
    pub fn new(jobs: HashMap<String, Vec<String>>) -> Self {
        Self { jobs }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.jobs.get(name).map(Vec::as_slice)
    }
}
