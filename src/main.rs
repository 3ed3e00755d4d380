use ams_transform::classfile::ParsedClass;
use ams_transform::cli::{Cli, Commands};
use ams_transform::config::{AmsConfig, clean_state, default_state_path};
use ams_transform::pipeline::AmsTransform;
use ams_transform::stage::{
    CancellationToken, OutputLayout, Scope, TransformInput, TransformInvocation, TransformStage,
};
use ams_transform::telemetry::init_tracing;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(
        cli.log_json,
        if cli.verbose { Level::DEBUG } else { Level::INFO },
    );

    match cli.command {
        Commands::Run {
            config,
            output,
            project,
            sub_projects,
            external,
            state,
            full,
        } => {
            let stage = load_stage(&config)?;
            let inputs = collect_inputs(project, sub_projects, external);
            let state_path = state.unwrap_or_else(|| default_state_path(&output));
            let invocation = TransformInvocation {
                inputs,
                output: OutputLayout::new(output),
                incremental: !full,
                state_path,
                cancel: CancellationToken::new(),
            };
            let report = stage.transform(&invocation)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Describe { config } => {
            let stage = load_stage(&config)?;
            println!("{}", serde_json::to_string_pretty(&stage.descriptor())?);
        }
        Commands::Inspect { class_file } => {
            let bytes = std::fs::read(&class_file)
                .with_context(|| format!("Failed to read class file: {}", class_file.display()))?;
            let class = ParsedClass::parse(&bytes)
                .with_context(|| format!("Failed to parse class file: {}", class_file.display()))?;
            println!("{}", serde_json::to_string_pretty(&class.summary())?);
        }
        Commands::Clean { output, state } => {
            let state_path = state.unwrap_or_else(|| default_state_path(&output));
            clean_state(&state_path)?;
        }
    }

    Ok(())
}

fn load_stage(config: &Path) -> Result<AmsTransform> {
    let settings = AmsConfig::load(config)?.into_settings()?;
    Ok(AmsTransform::new(Arc::new(settings)))
}

fn collect_inputs(
    project: Vec<PathBuf>,
    sub_projects: Vec<PathBuf>,
    external: Vec<PathBuf>,
) -> Vec<TransformInput> {
    let scoped = [
        (Scope::Project, project),
        (Scope::SubProjects, sub_projects),
        (Scope::ExternalLibraries, external),
    ];
    scoped
        .into_iter()
        .flat_map(|(scope, paths)| {
            paths
                .into_iter()
                .map(move |p| TransformInput::from_path(scope, p))
        })
        .collect()
}
