use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "ams-transform")]
#[command(about = "Rewrite compiled classes in directories and jars for an Android build")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Log per-class decisions
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Run the transform over the given inputs
    Run {
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        #[arg(long, value_name = "DIR")]
        output: PathBuf,

        /// Class directory or jar of the current module
        #[arg(long = "project", value_name = "PATH")]
        project: Vec<PathBuf>,

        /// Class directory or jar of a sub-module
        #[arg(long = "sub-project", value_name = "PATH")]
        sub_projects: Vec<PathBuf>,

        /// External library jar
        #[arg(long = "external", value_name = "PATH")]
        external: Vec<PathBuf>,

        /// Incremental state file; defaults to `<output>.state.lmdb`
        #[arg(long, value_name = "FILE")]
        state: Option<PathBuf>,

        /// Ignore the previous run's state
        #[arg(long)]
        full: bool,
    },
    /// Print the stage declaration
    Describe {
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Print a summary of a class file
    Inspect { class_file: PathBuf },
    /// Remove the incremental state
    Clean {
        #[arg(long, value_name = "DIR")]
        output: PathBuf,

        #[arg(long, value_name = "FILE")]
        state: Option<PathBuf>,
    },
}
