use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use karakuri::{BuildError, KarakuriError, Mode, Pipeline};
use tracing_subscriber::EnvFilter;

/// karakuri - asset build-and-package pipeline with live reload
#[derive(Parser)]
#[command(name = "karakuri")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Project root directory
    #[arg(long, default_value = ".", global = true)]
    project_dir: Utf8PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Full non-watch pipeline into the distribution tree (the default)
    Build,

    /// Remove the staging, distribution and release directories
    Clean,

    /// Watch mode: staging build, managed process, live restart/reload
    Serve,

    /// Build, then serve the release-ready distribution
    ServeDist,

    /// Build, then invoke the packager per enabled platform
    Package {
        /// Platform target(s) to package; defaults to the configured list
        #[arg(short, long)]
        platform: Vec<String>,
    },

    /// Run a single named task and its prerequisites
    Run {
        task: String,

        /// Use the watch-mode variant of the task
        #[arg(long)]
        watch: bool,
    },

    /// List the registered tasks
    Tasks,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), KarakuriError> {
    // Watch-mode classification matches paths relative to the project
    // root, so resolve it up front.
    let root = cli
        .project_dir
        .canonicalize_utf8()
        .unwrap_or(cli.project_dir);

    let pipeline = Pipeline::new(root)?;

    match cli.command.unwrap_or(Commands::Build) {
        Commands::Build => pipeline.build(),
        Commands::Clean => pipeline.clean(),
        Commands::Serve => pipeline.serve(),
        Commands::ServeDist => pipeline.serve_dist(),
        Commands::Package { platform } => {
            pipeline.package((!platform.is_empty()).then_some(platform))
        }
        Commands::Run { task, watch } => {
            let mode = if watch { Mode::Watch } else { Mode::Build };
            pipeline.run_task(&task, mode)
        }
        Commands::Tasks => {
            let mut ids: Vec<&str> = pipeline.graph().ids().collect();
            ids.sort_unstable();
            for id in ids {
                println!("{id}");
            }
            Ok(())
        }
    }
}

fn report(error: &KarakuriError) {
    let prefix = style("error:").red().bold();

    match error {
        KarakuriError::Build(BuildError::Tasks(failures)) => {
            for failure in failures {
                eprintln!("{prefix} {failure}");
            }
        }
        KarakuriError::Packaging(failures) => {
            for failure in failures {
                eprintln!("{prefix} {failure}");
            }
        }
        other => eprintln!("{prefix} {other}"),
    }
}
