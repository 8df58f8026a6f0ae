//! livecd-builder - assemble bootable LiveCD ISO images from cached base
//! layers and a provisioning repository.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use livecd_builder::config::{BuildConfig, BuildParams};
use livecd_builder::interrupt::Interrupt;
use livecd_builder::pipeline::{self, identity, RunContext, RunOutcome};
use livecd_builder::selection::parse_selection;
use livecd_builder::settings::Settings;
use livecd_builder::tools::SystemTools;
use livecd_builder::{hash, preflight};

/// Exit status after SIGINT/SIGTERM, as a shell would report it.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "livecd-builder", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the named images (`all` for every configured build).
    Build {
        /// Build names, `all`, and `-f` to rebuild images that already exist.
        #[arg(
            value_name = "[-f] NAME|all",
            required = true,
            allow_hyphen_values = true,
            trailing_var_arg = true
        )]
        targets: Vec<String>,
    },

    /// List configured builds with their resolved parameters.
    Ls {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Print the short content hash of a file, or of the argument itself.
    Hash { input: String },
}

#[derive(Serialize)]
struct ListedBuild<'a> {
    name: &'a str,
    #[serde(flatten)]
    params: BuildParams,
}

fn main() -> ExitCode {
    // Before anything spawns a thread: the local UTC offset is only
    // available to single-threaded processes.
    let build_date = identity::today();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Build { targets } => build(&targets, build_date),
        Command::Ls { json } => list(json).map(|()| ExitCode::SUCCESS),
        Command::Hash { input } => hash::hash_file_or_string(&input).map(|digest| {
            println!("{digest}");
            ExitCode::SUCCESS
        }),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<(Settings, BuildConfig)> {
    let settings = Settings::from_env()?;
    let config = BuildConfig::load(&settings.config_path)?;
    Ok((settings, config))
}

fn build(targets: &[String], build_date: time::Date) -> Result<ExitCode> {
    let (settings, config) = load_config()?;
    let selection = parse_selection(targets, &config.registry)?;

    let needs_git = selection
        .ids
        .iter()
        .filter_map(|&id| config.build_params(id))
        .any(|params| params.uses_repo());
    preflight::check_root()?;
    preflight::check_host_tools(needs_git)?;
    preflight::check_directories(&settings)?;

    let interrupt = Interrupt::install()?;
    let tools = SystemTools::new();
    let ctx = RunContext {
        config: &config,
        settings: &settings,
        tools: &tools,
        interrupt: &interrupt,
        build_date,
    };

    let (report, result) = pipeline::execute(&ctx, &selection);
    report.print();

    match result.context("build run stopped")? {
        RunOutcome::Completed => Ok(ExitCode::SUCCESS),
        RunOutcome::Interrupted => {
            warn!("Interrupted; scratch directory removed, rerun to continue");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
    }
}

fn list(json: bool) -> Result<()> {
    let (_, config) = load_config()?;
    let builds: Vec<ListedBuild> = config
        .registry
        .iter()
        .filter_map(|(id, name)| {
            config
                .build_params(id)
                .map(|params| ListedBuild { name, params })
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&builds)?);
        return Ok(());
    }

    if builds.is_empty() {
        println!("No builds configured in {}", config.path.display());
        return Ok(());
    }
    for build in &builds {
        let p = &build.params;
        println!("{}", build.name.bold());
        println!("  base_layer      = {}", p.base_layer);
        println!("  repo_url        = {}", p.repo_url);
        println!("  repo_checkout   = {}", p.repo_checkout);
        println!("  repo_clone_into = {}", p.repo_clone_into);
        println!("  repo_depth      = {}", p.repo_depth);
        println!("  run_from_repo   = {}", p.run_from_repo);
    }
    Ok(())
}
