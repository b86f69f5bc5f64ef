use anyhow::Result;
use clap::{Parser, Subcommand};

mod client;
mod commands;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "STRATA build engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build from a plan file
    Build {
        /// Path to the build plan (JSON)
        plan: String,

        /// Build id (defaults to a fresh id)
        #[arg(long)]
        id: Option<String>,
    },

    /// Stream status for an in-flight build
    Status {
        /// Build id
        id: String,
    },

    /// Show cache disk usage
    Du,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { plan, id } => commands::build::build(&plan, id).await,
        Commands::Status { id } => commands::status::status(&id).await,
        Commands::Du => commands::du::du().await,
    }
}
