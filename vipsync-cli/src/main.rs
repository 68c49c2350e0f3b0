use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vipsync_core::manager::EntrypointRun;
use vipsync_core::{
    Action, Balancers, EntrypointManager, ManagerOptions, RunSummary, Services, Settings, StaticConfig,
};

/// Reconcile load balancer VIPs, DNS records and inventory interfaces
#[derive(Parser)]
#[command(name = "vipsync")]
#[command(about = "Create, delete and inspect entrypoint VIPs", long_about = None)]
struct Cli {
    /// Static topology (entrypoints, balancers, health checks)
    #[arg(long, env = "VIPSYNC_CONFIG", default_value = "conf/static.json")]
    config: PathBuf,

    /// Collaborator endpoints and credentials
    #[arg(long, env = "VIPSYNC_SETTINGS", default_value = "conf/settings.json")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Selection {
    /// Entrypoints to process (comma separated)
    #[arg(long, value_delimiter = ',')]
    entrypoints: Vec<String>,

    /// Process every entrypoint of these services (comma separated)
    #[arg(long, value_delimiter = ',')]
    services: Vec<String>,

    /// Process every entrypoint of every service in the environment
    #[arg(long, conflicts_with_all = ["entrypoints", "services"])]
    all: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update entrypoints (mandatory ones when nothing is selected)
    Create {
        /// Environment name
        env: String,

        #[command(flatten)]
        selection: Selection,
    },

    /// Delete entrypoints
    Delete {
        /// Environment name
        env: String,

        #[command(flatten)]
        selection: Selection,
    },

    /// Show the desired state of a service's entrypoints
    Plan {
        /// Environment name
        env: String,
        service: String,
    },

    /// Show the observed state of a service's entrypoints
    State {
        /// Environment name
        env: String,
        service: String,
    },

    /// Show what a create would change
    Diff {
        /// Environment name
        env: String,
        service: String,
    },

    /// Show what the balancer serves for an entrypoint
    Show {
        /// Environment name
        env: String,
        entrypoint: String,
    },

    /// Remove inventory interfaces holding addresses nobody published
    Clean {
        /// Environment name
        env: String,
        entrypoint: String,

        /// Remove them instead of only listing them
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "ENTRYPOINT")]
    entrypoint: String,
    #[tabled(rename = "RESULT")]
    result: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

impl RunRow {
    fn new(run: &EntrypointRun, action: Action) -> Self {
        let (result, detail) = match &run.result {
            Ok(outcome) if outcome.is_success() => ("ok", String::new()),
            Ok(outcome) => {
                let result = if run.is_success(action) { "ok" } else { "failed" };
                (result, outcome.failures().join(", "))
            }
            Err(message) => ("error", message.clone()),
        };
        Self {
            entrypoint: run.entrypoint.clone(),
            result: result.to_string(),
            detail,
        }
    }
}

impl Commands {
    fn env(&self) -> &str {
        match self {
            Commands::Create { env, .. }
            | Commands::Delete { env, .. }
            | Commands::Plan { env, .. }
            | Commands::State { env, .. }
            | Commands::Diff { env, .. }
            | Commands::Show { env, .. }
            | Commands::Clean { env, .. } => env,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn connect(config_path: &Path, settings_path: &Path, env: &str) -> Result<EntrypointManager> {
    let config = StaticConfig::load(config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    let settings = Settings::load(settings_path)
        .await
        .with_context(|| format!("loading {}", settings_path.display()))?;

    let services = Services::connect(&settings, env)?;
    let location = services
        .environment
        .info()
        .await
        .with_context(|| format!("looking up environment {}", env))?
        .location;
    let balancers = Balancers::connect(&config, &settings, &location)?;

    let manager = EntrypointManager::new(
        Arc::new(config),
        services,
        balancers,
        ManagerOptions::from_settings(&settings),
    )
    .await?;
    Ok(manager)
}

async fn select(manager: &EntrypointManager, selection: Selection, action: Action) -> Result<Vec<String>> {
    let services = if selection.all {
        manager.all_services().await?
    } else {
        selection.services
    };
    let entrypoints = manager.select_entrypoints(&selection.entrypoints, &services, action == Action::Patch);
    if entrypoints.is_empty() {
        bail!("no entrypoints selected");
    }
    Ok(entrypoints)
}

/// Print the report and the summary table. Returns whether every
/// entrypoint succeeded.
fn report(summary: &RunSummary) -> Result<bool> {
    print_json(summary)?;
    let rows: Vec<RunRow> = summary.runs.iter().map(|run| RunRow::new(run, summary.action)).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    eprintln!("{}", table);
    Ok(summary.is_success())
}

async fn run(cli: Cli) -> Result<bool> {
    let mut manager = connect(&cli.config, &cli.settings, cli.command.env()).await?;

    match cli.command {
        Commands::Create { selection, .. } => {
            let entrypoints = select(&manager, selection, Action::Patch).await?;
            info!(entrypoints = ?entrypoints, "creating entrypoints");
            let summary = manager.create_entrypoints(&entrypoints).await?;
            report(&summary)
        }
        Commands::Delete { selection, .. } => {
            let entrypoints = select(&manager, selection, Action::Delete).await?;
            info!(entrypoints = ?entrypoints, "deleting entrypoints");
            let summary = manager.delete_entrypoints(&entrypoints).await?;
            report(&summary)
        }
        Commands::Plan { service, .. } => {
            print_json(&manager.global_plan(&service).await?)?;
            Ok(true)
        }
        Commands::State { service, .. } => {
            print_json(&manager.global_state(&service).await?)?;
            Ok(true)
        }
        Commands::Diff { service, .. } => {
            print_json(&manager.global_diff(&service).await?)?;
            Ok(true)
        }
        Commands::Show { entrypoint, .. } => {
            print_json(&manager.describe_vip(&entrypoint).await?)?;
            Ok(true)
        }
        Commands::Clean { entrypoint, apply, .. } => {
            let affected = manager.clean_entrypoint(&entrypoint, apply).await?;
            if !apply && !affected.is_empty() {
                eprintln!("dry run, pass --apply to remove {} interface(s)", affected.len());
            }
            print_json(&affected)?;
            Ok(true)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vipsync=info,vipsync_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if !run(cli).await? {
        std::process::exit(1);
    }
    Ok(())
}
