mod state;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lease_qa::config::config_id;
use lease_qa::inference::QueryRequest;
use state::AppState;

#[derive(Parser)]
#[command(name = "lease-qa")]
#[command(version, about = "Answer questions about extracted site lease data, with citations", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Sources {
    /// Directory of `<name>-<version>.json` lease configurations
    #[arg(long, env = "LEASE_QA_CONFIG_DIR", default_value = "./data/configs")]
    config_dir: PathBuf,

    /// Directory of `<SITE_ID>-<lease_config_hash>.json` extraction results
    #[arg(long, env = "LEASE_QA_STORE_DIR", default_value = "./data/sites")]
    store_dir: PathBuf,

    /// Directory where chat sessions are kept
    #[arg(long, env = "LEASE_QA_SESSION_DIR", default_value = "./data/sessions")]
    session_dir: PathBuf,

    #[arg(long)]
    config_name: String,

    #[arg(long)]
    config_version: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question about one or more sites
    Ask {
        #[command(flatten)]
        sources: Sources,

        /// Session to continue
        #[arg(long, default_value = "default")]
        session_id: String,

        #[arg(long, default_value = "local")]
        user_id: String,

        /// Override the configured model
        #[arg(long)]
        model: Option<String>,

        question: String,
    },

    /// Print a site's data as the model sees it
    Site {
        #[command(flatten)]
        sources: Sources,

        #[arg(long)]
        site_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ask {
            sources,
            session_id,
            user_id,
            model,
            question,
        } => {
            let state = AppState::new(
                &sources.config_dir,
                &sources.store_dir,
                &sources.session_dir,
            )?;
            let config_id = config_id(&sources.config_name, &sources.config_version);
            info!(config = %config_id, "Querying");

            let request = QueryRequest {
                cid: format!("{}-{}", session_id, chrono::Utc::now().timestamp_millis()),
                sid: session_id,
                query: question,
                model,
            };
            let mut history = state
                .histories
                .read_messages(&request.sid, &user_id)
                .await
                .context("Failed to read chat history")?;
            let response = state
                .engine
                .query(&request, &config_id, &mut history)
                .await?;
            state
                .histories
                .store_messages(&request.sid, &user_id, &history)
                .await
                .context("Failed to store chat history")?;

            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Site { sources, site_id } => {
            let state = AppState::new(
                &sources.config_dir,
                &sources.store_dir,
                &sources.session_dir,
            )?;
            let config_id = config_id(&sources.config_name, &sources.config_version);
            let plugin = state.engine.plugin(&config_id).await?;
            let text = plugin.fetch_site_data(&site_id).await?;
            let document: serde_json::Value = serde_json::from_str(&text)?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }

    Ok(())
}
