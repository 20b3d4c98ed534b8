#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]

mod commands;
mod logging;

use clap::Parser;
use miette::Result;
use std::path::{Path, PathBuf};
use weave_core::Mode;

#[derive(Parser, Debug)]
#[command(name = "weave")]
#[command(author, version, about = "An incremental module bundler", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by `build` and `watch`.
#[derive(clap::Args, Debug, Clone)]
struct ProjectArgs {
    /// Build mode: development or production
    #[arg(long, value_parser = parse_mode)]
    mode: Option<Mode>,

    /// Configuration file (defaults to weave.config.json in the project root)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(long, value_name = "DIR")]
    out_dir: Option<PathBuf>,

    /// Disable the persisted cache
    #[arg(long)]
    no_cache: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build the project once
    Build {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Build, then rebuild on every file change
    Watch {
        #[command(flatten)]
        project: ProjectArgs,

        /// Debounce window in milliseconds
        #[arg(long, value_name = "MS")]
        debounce_ms: Option<u64>,
    },

    /// Inspect or clear the persisted transform cache
    Cache {
        #[command(subcommand)]
        cache_cmd: CacheCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum CacheCommands {
    /// Remove every persisted entry
    Clear,

    /// Show location and size of the persisted cache
    Stats,
}

fn parse_mode(value: &str) -> Result<Mode, String> {
    value.parse::<Mode>().map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let cwd = dunce::canonicalize(&cwd).unwrap_or(cwd);
    let root = weave_core::paths::project_root(&cwd).unwrap_or_else(|| cwd.clone());

    logging::init(cli.verbose, cli.json);

    match cli.command {
        Commands::Build { project } => {
            let span = tracing::info_span!("build", cmd = "build", cwd = %cwd.display());
            let _guard = span.enter();
            commands::build::run(&project.into_options(&cwd, &root), cli.json)
        }
        Commands::Watch {
            project,
            debounce_ms,
        } => {
            let span = tracing::info_span!("watch", cmd = "watch", cwd = %cwd.display());
            let _guard = span.enter();
            let mut options = project.into_options(&cwd, &root);
            options.debounce_ms = debounce_ms;
            commands::watch::run(&options, cli.json)
        }
        Commands::Cache { cache_cmd } => {
            let action = match cache_cmd {
                CacheCommands::Clear => commands::cache::CacheAction::Clear,
                CacheCommands::Stats => commands::cache::CacheAction::Stats,
            };
            commands::cache::run(&root, action, cli.json)
        }
    }
}

impl ProjectArgs {
    /// Relative paths on the command line are taken from `cwd`; the project
    /// itself lives at `root`.
    fn into_options(self, cwd: &Path, root: &Path) -> commands::ProjectOptions {
        let absolute = |p: PathBuf| if p.is_absolute() { p } else { cwd.join(p) };
        commands::ProjectOptions {
            root: root.to_path_buf(),
            mode: self.mode,
            config: self.config.map(absolute),
            out_dir: self.out_dir.map(absolute),
            no_cache: self.no_cache,
            debounce_ms: None,
        }
    }
}
