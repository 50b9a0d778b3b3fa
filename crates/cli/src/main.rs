//! strata: incremental, content-addressed build pipelines.

mod cmd;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{
  Session, cmd_clean, cmd_gc, cmd_get, cmd_graph, cmd_history, cmd_make, cmd_outdated, cmd_purge, cmd_trace,
};
use output::{OutputFormat, print_error};
use strata_lib::consts::STORE_ENV_VAR;
use strata_lib::plan::file::PLAN_FILE_NAME;

#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about = "Incremental, content-addressed build pipelines", long_about = None)]
struct Cli {
  /// Store directory (default: <project>/.strata)
  #[arg(long, global = true, env = STORE_ENV_VAR)]
  store: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build every outdated target in a plan
  Make {
    /// Plan file
    #[arg(default_value = PLAN_FILE_NAME)]
    plan: PathBuf,

    /// Maximum number of commands running at once
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Cap on sub-targets per dynamic target
    #[arg(long)]
    max_expand: Option<usize>,

    /// Keep building targets that do not depend on a failure
    #[arg(short, long)]
    keep_going: bool,

    /// Do not append history records
    #[arg(long)]
    no_history: bool,

    /// Map over unequal lengths by truncating to the shortest
    #[arg(long)]
    truncate: bool,

    /// Build only these targets and what they depend on
    #[arg(short, long = "target", value_name = "NAME")]
    targets: Vec<String>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// List targets that a build would run
  Outdated {
    /// Plan file
    #[arg(default_value = PLAN_FILE_NAME)]
    plan: PathBuf,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Show the dependency graph with per-node status
  Graph {
    /// Plan file
    #[arg(default_value = PLAN_FILE_NAME)]
    plan: PathBuf,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Show build history
  History {
    /// Only records for this name
    name: Option<String>,

    /// Only the record each name currently points at
    #[arg(long)]
    latest: bool,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Print a stored value as JSON
  Get {
    /// Target name (latest value)
    #[arg(required_unless_present = "digest", conflicts_with = "digest")]
    name: Option<String>,

    /// Look up by value digest instead
    #[arg(long)]
    digest: Option<String>,
  },

  /// Show which keys produced each sub-target of a dynamic target
  Trace {
    /// Dynamic target name
    name: String,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Forget latest builds so they rebuild (all when no names given)
  Clean {
    /// Target names
    names: Vec<String>,

    /// Skip the confirmation prompt when cleaning everything
    #[arg(short, long)]
    yes: bool,
  },

  /// Delete values no latest build references
  Gc {
    /// Report what would be deleted without deleting
    #[arg(long)]
    dry_run: bool,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Delete one stored value
  Purge {
    /// Value digest
    digest: String,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
  },
}

fn main() {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let session = Session {
    store: cli.store,
    verbose: cli.verbose,
  };

  let result = match cli.command {
    Commands::Make {
      plan,
      workers,
      max_expand,
      keep_going,
      no_history,
      truncate,
      targets,
      output,
    } => cmd_make(
      &session,
      &plan,
      cmd::MakeOptions {
        workers,
        max_expand,
        keep_going,
        no_history,
        truncate,
        targets,
      },
      output,
    ),
    Commands::Outdated { plan, output } => cmd_outdated(&session, &plan, output),
    Commands::Graph { plan, output } => cmd_graph(&session, &plan, output),
    Commands::History { name, latest, output } => cmd_history(&session, name.as_deref(), latest, output),
    Commands::Get { name, digest } => cmd_get(&session, name.as_deref(), digest.as_deref()),
    Commands::Trace { name, output } => cmd_trace(&session, &name, output),
    Commands::Clean { names, yes } => cmd_clean(&session, &names, yes),
    Commands::Gc { dry_run, output } => cmd_gc(&session, dry_run, output),
    Commands::Purge { digest, yes } => cmd_purge(&session, &digest, yes),
  };

  if let Err(e) = result {
    print_error(&format!("{e:#}"));
    std::process::exit(1);
  }
}
