use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::block::RunFlags;

#[derive(Parser, Debug)]
#[command(name = "eltpipe")]
#[command(about = "Run extract/load pipelines and plugin commands", long_about = None)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the project file
    #[arg(short, long, value_name = "FILE", global = true, default_value = "eltpipe.yaml")]
    pub project: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run plugins and jobs, e.g. `tap-csv hash-emails target-jsonl dbt:run`
    Run {
        /// Ignore stored state and extract everything
        #[arg(long)]
        full_refresh: bool,

        /// Do not store the state emitted by the loader
        #[arg(long)]
        no_state_update: bool,

        /// Run even if another run holds the same state id
        #[arg(long)]
        force: bool,

        /// Appended to every state id of this run
        #[arg(long, value_name = "SUFFIX")]
        state_id_suffix: Option<String>,

        #[arg(required = true, value_name = "BLOCK")]
        blocks: Vec<String>,
    },
    /// Parse a run request and print the plan without running it
    Validate {
        #[arg(required = true, value_name = "BLOCK")]
        blocks: Vec<String>,
    },
}

impl Command {
    pub fn run_flags(&self) -> RunFlags {
        match self {
            Self::Run {
                full_refresh,
                no_state_update,
                force,
                state_id_suffix,
                ..
            } => RunFlags {
                full_refresh: *full_refresh,
                no_state_update: *no_state_update,
                force: *force,
                state_suffix: state_id_suffix.clone(),
            },
            Self::Validate { .. } => RunFlags::default(),
        }
    }
}

pub fn get_opts() -> Opts {
    Opts::parse()
}
