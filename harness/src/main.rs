use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relay_harness::{config, enqueue, migrate, server};

#[derive(Parser, Debug)]
#[command(name = "relay-harness")]
#[command(about = "Per-environment task-run dispatcher harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run DB migrations.
    Migrate,

    /// Run the relay websocket server.
    Serve,

    /// Enqueue a task run (manual testing helper).
    Enqueue {
        /// Environment to enqueue into.
        #[arg(long)]
        environment_id: uuid::Uuid,

        /// Task identifier (slug) the run targets.
        #[arg(long)]
        task: String,

        /// Named queue within the environment.
        #[arg(long, default_value = "default")]
        queue: String,

        /// Run payload.
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::RelayConfig::from_env().context("load relay config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Serve => server::run(&cfg).await,
        Command::Enqueue {
            environment_id,
            task,
            queue,
            payload,
        } => enqueue::run(&cfg, environment_id, &task, &queue, &payload).await,
    }
}
