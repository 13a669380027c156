use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use orchestrator::chain;
use orchestrator::exit_codes;
use orchestrator::io::config::{Config, load_config};
use orchestrator::io::gate::StdinGate;
use orchestrator::io::paths::OrchestratorPaths;
use orchestrator::io::session::CliSession;
use orchestrator::io::state_store::load_execution_state;
use orchestrator::io::stories::{load_stories, next_incomplete};
use orchestrator::logging;
use orchestrator::run::{self, RunOutcome};

/// Unattended backlog execution orchestrator.
#[derive(Parser)]
#[command(name = "orchestrator", version, about)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Config file (defaults to `.orchestrator/config.toml` under the root).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the backlog of a single feature group.
    Run,
    /// Execute an ordered chain of feature groups.
    Chain,
    /// List the backlog's stories and their progress.
    Stories,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let project_root = match cli.project {
        Some(path) => path,
        None => std::env::current_dir().context("determine current directory")?,
    };
    let paths = OrchestratorPaths::new(&project_root);
    let config_path = cli.config.unwrap_or_else(|| paths.config_path.clone());
    let config = load_config(&config_path)?;

    match cli.command {
        Command::Run => {
            let session = CliSession::new(&config.session);
            let mut gate = StdinGate;
            let outcome = run::execute(&project_root, &config, &session, &mut gate)?;
            Ok(exit_code(outcome))
        }
        Command::Chain => {
            let session = CliSession::new(&config.session);
            let mut gate = StdinGate;
            let outcome = chain::execute(&project_root, &config, &session, &mut gate)?;
            Ok(exit_code(outcome))
        }
        Command::Stories => {
            print_stories(&project_root, &paths, &config)?;
            Ok(exit_codes::OK)
        }
    }
}

fn exit_code(outcome: RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed => exit_codes::OK,
        RunOutcome::Failed => exit_codes::FAILED,
        RunOutcome::Paused => exit_codes::PAUSED,
        RunOutcome::Blocked => exit_codes::BLOCKED,
    }
}

fn print_stories(project_root: &std::path::Path, paths: &OrchestratorPaths, config: &Config) -> Result<()> {
    config.validate_for_run()?;
    let stories = load_stories(&project_root.join(&config.document))?;
    let state = load_execution_state(&paths.state_path)?;

    for story in &stories {
        let checked = story.criteria.iter().filter(|c| c.checked).count();
        let doc_mark = if story.completed { "x" } else { " " };
        let attempts = state
            .as_ref()
            .and_then(|s| s.stories.get(&story.id))
            .map(|s| s.attempts)
            .unwrap_or(0);
        println!(
            "[{doc_mark}] {}: {} ({checked}/{} criteria, {attempts} attempts)",
            story.id,
            story.title,
            story.criteria.len(),
        );
    }
    match next_incomplete(&stories) {
        Some(story) => println!("\nnext up: {}", story.id),
        None => println!("\nbacklog complete"),
    }
    Ok(())
}
