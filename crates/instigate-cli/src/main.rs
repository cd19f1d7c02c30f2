mod cmd;
mod home;
mod output;

use clap::{Parser, Subcommand};
use cmd::{
    api::ApiArgs, daemon::DaemonSubcommand, instigator::InstigatorSubcommand,
    start::StartArgs, WorkspaceArgs,
};

#[derive(Parser)]
#[command(
    name = "instigate",
    about = "Evaluate schedules and sensors and launch the runs they request",
    version,
    propagate_version = true
)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon and the API side by side until interrupted
    Start(StartArgs),

    /// The evaluation daemon
    Daemon {
        #[command(subcommand)]
        subcommand: DaemonSubcommand,
    },

    /// Serve the HTTP API
    Api(ApiArgs),

    /// Inspect and operate schedules and sensors
    Instigator {
        #[command(flatten)]
        workspace: WorkspaceArgs,

        #[command(subcommand)]
        subcommand: InstigatorSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Start(_) | Commands::Daemon { .. } | Commands::Api(_) => tracing::Level::INFO,
        Commands::Instigator { .. } => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Start(args) => cmd::start::run(args),
        Commands::Daemon { subcommand } => cmd::daemon::run(subcommand, cli.json),
        Commands::Api(args) => cmd::api::run(args),
        Commands::Instigator {
            workspace,
            subcommand,
        } => cmd::instigator::run(&workspace, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
