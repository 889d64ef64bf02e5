//! Turns a flat run request into an ordered plan of block-sets and command blocks.
//!
//! Parsing happens in three passes: job names are expanded in place, every
//! token is resolved against the plugin registry, and the resolved list is
//! scanned left to right. An extractor opens a block-set, mappers extend it
//! and a loader closes it; command-eligible plugins stand alone. Nothing is
//! spawned here.

use std::sync::Arc;
use tracing::debug;

use super::{
    BlockSetOptions, CommandBlock, ExtractLoadBlocks, IoBlock, PlanEntry, PluginBlock, RunFlags,
    DEFAULT_STREAM_BUFFER_SIZE,
};
use crate::backends::Invoker;
use crate::error::PlanError;
use crate::plugins::{JobRegistry, PluginDescriptor, PluginRegistry, PluginRole};

/// Settings applied to every entry of a parsed plan.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub flags: RunFlags,
    pub stream_buffer_size: usize,
    /// Prefix of every state id.
    pub environment: String,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            flags: RunFlags::default(),
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            environment: "dev".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ResolvedToken {
    /// Position in the job-expanded request.
    index: usize,
    token: String,
    plugin: Arc<PluginDescriptor>,
    command: Option<String>,
    mapping: Option<String>,
}

pub struct BlockParser<'a> {
    plugins: &'a PluginRegistry,
    jobs: &'a JobRegistry,
    invoker: Arc<dyn Invoker>,
    options: PlanOptions,
}

impl<'a> BlockParser<'a> {
    pub fn new(
        plugins: &'a PluginRegistry,
        jobs: &'a JobRegistry,
        invoker: Arc<dyn Invoker>,
        options: PlanOptions,
    ) -> Self {
        Self {
            plugins,
            jobs,
            invoker,
            options,
        }
    }

    pub fn parse(&self, tokens: &[String]) -> Result<Vec<PlanEntry>, PlanError> {
        if tokens.is_empty() {
            return Err(PlanError::Empty);
        }
        let expanded = self.expand_jobs(tokens)?;
        let resolved = expanded
            .iter()
            .enumerate()
            .map(|(index, token)| self.resolve(index, token))
            .collect::<Result<Vec<_>, _>>()?;
        let plan = self.find_blocks(&resolved)?;
        debug!(entries = plan.len(), "plan parsed");
        Ok(plan)
    }

    /// Replace job names by their token lists. Expanded tokens are not expanded again.
    pub fn expand_jobs(&self, tokens: &[String]) -> Result<Vec<String>, PlanError> {
        let mut expanded = Vec::with_capacity(tokens.len());
        for token in tokens {
            let Some(job) = self.jobs.get(token) else {
                expanded.push(token.clone());
                continue;
            };
            if self.plugins.find(token).is_some() {
                return Err(PlanError::Ambiguous {
                    name: token.clone(),
                    reason: "name refers to both a job and a plugin".to_string(),
                });
            }
            debug!(job = %token, tokens = ?job, "expanding job");
            expanded.extend(job.iter().cloned());
        }
        Ok(expanded)
    }

    fn resolve(&self, index: usize, token: &str) -> Result<ResolvedToken, PlanError> {
        let (name, command) = match token.split_once(':') {
            Some((name, command)) => (name, Some(command.to_string())),
            None => (token, None),
        };

        let (plugin, mapping) = match (self.plugins.find(name), self.plugins.find_mapping(name)) {
            // Same mapper under both names; rejected once the block-set is assembled.
            (Some(plugin), Some(mapper)) if Arc::ptr_eq(&plugin, &mapper) => (plugin, Some(name.to_string())),
            (Some(plugin), Some(mapper)) => {
                return Err(PlanError::Ambiguous {
                    name: name.to_string(),
                    reason: format!(
                        "mapping of '{}' has the same name as {} '{}'",
                        mapper.name, plugin.role, plugin.name
                    ),
                })
            }
            (Some(plugin), None) => (plugin, None),
            (None, Some(mapper)) => (mapper, Some(name.to_string())),
            (None, None) => {
                return Err(PlanError::BlockNotFound {
                    name: token.to_string(),
                })
            }
        };

        if let Some(command) = &command {
            if plugin.role.is_command_eligible() && !plugin.commands.contains_key(command) {
                return Err(PlanError::CommandNotFound {
                    plugin: plugin.name.clone(),
                    command: command.clone(),
                });
            }
        }

        Ok(ResolvedToken {
            index,
            token: token.to_string(),
            plugin,
            command,
            mapping,
        })
    }

    fn find_blocks(&self, resolved: &[ResolvedToken]) -> Result<Vec<PlanEntry>, PlanError> {
        let mut plan = Vec::new();
        let mut index = 0;
        while let Some(token) = resolved.get(index) {
            if token.plugin.role == PluginRole::Extractor {
                let (set, next) = self.find_block_set(resolved, index)?;
                plan.push(PlanEntry::Pipeline(set));
                index = next;
            } else if token.plugin.role.is_command_eligible() {
                plan.push(PlanEntry::Command(self.command_block(token)));
                index += 1;
            } else {
                return Err(PlanError::Adjacency {
                    index: token.index,
                    reason: format!("{} '{}' is not preceded by an extractor", token.plugin.role, token.token),
                });
            }
        }
        Ok(plan)
    }

    /// Grow a block-set from the extractor at `start`. Returns the set and the
    /// index just past its loader.
    fn find_block_set(
        &self,
        resolved: &[ResolvedToken],
        start: usize,
    ) -> Result<(ExtractLoadBlocks, usize), PlanError> {
        let head = &resolved[start];
        reject_command(head)?;
        let mut blocks = vec![self.plugin_block(head)];

        for token in &resolved[start + 1..] {
            reject_command(token)?;
            match token.plugin.role {
                PluginRole::Mapper => {
                    if token.mapping.as_deref() == Some(token.plugin.name.as_str()) {
                        return Err(PlanError::Ambiguous {
                            name: token.token.clone(),
                            reason: format!(
                                "'{}' names both the mapper plugin and one of its mappings",
                                token.plugin.name
                            ),
                        });
                    }
                    blocks.push(self.plugin_block(token));
                }
                PluginRole::Loader => {
                    blocks.push(self.plugin_block(token));
                    let state_id = if blocks[0].has_state() {
                        Some(self.state_id(&head.plugin.name, &token.plugin.name))
                    } else {
                        None
                    };
                    let options = BlockSetOptions {
                        state_id,
                        flags: self.options.flags.clone(),
                        stream_buffer_size: self.options.stream_buffer_size,
                    };
                    let set = ExtractLoadBlocks::new(blocks, options)?;
                    return Ok((set, token.index + 1));
                }
                role => {
                    return Err(PlanError::Adjacency {
                        index: token.index,
                        reason: format!(
                            "expected a mapper or loader after extractor '{}', found {} '{}'",
                            head.token, role, token.token
                        ),
                    })
                }
            }
        }

        Err(PlanError::Adjacency {
            index: head.index,
            reason: format!("extractor '{}' is never followed by a loader", head.token),
        })
    }

    fn state_id(&self, extractor: &str, loader: &str) -> String {
        let mut id = format!("{}:{}-to-{}", self.options.environment, extractor, loader);
        if let Some(suffix) = &self.options.flags.state_suffix {
            id.push(':');
            id.push_str(suffix);
        }
        id
    }

    fn new_block(&self, token: &ResolvedToken) -> PluginBlock {
        PluginBlock::new(
            token.plugin.clone(),
            self.invoker.clone(),
            self.options.stream_buffer_size,
        )
    }

    fn plugin_block(&self, token: &ResolvedToken) -> Box<dyn IoBlock> {
        Box::new(self.new_block(token).with_mapping(token.mapping.clone()))
    }

    fn command_block(&self, token: &ResolvedToken) -> CommandBlock {
        let args = token
            .command
            .as_ref()
            .and_then(|c| token.plugin.commands.get(c))
            .map(|def| def.args.clone())
            .unwrap_or_default();
        CommandBlock::new(self.new_block(token).with_extra_args(args), token.command.clone())
    }
}

/// Streaming plugins cannot run subcommands inside a pipeline.
fn reject_command(token: &ResolvedToken) -> Result<(), PlanError> {
    match &token.command {
        Some(command) => Err(PlanError::Adjacency {
            index: token.index,
            reason: format!(
                "{} '{}' cannot run command '{}' inside a pipeline",
                token.plugin.role, token.plugin.name, command
            ),
        }),
        None => Ok(()),
    }
}
