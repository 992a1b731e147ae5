mod backend;
mod chat_client;
mod cli;
mod config;
mod stream;

use std::io;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use eyre::Result;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use crate::backend::{RestBackend, DEFAULT_FEED_LIMIT};
use crate::chat_client::ChatClient;
use crate::cli::chat::ChatContext;
use crate::config::Config;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input to send to the chat
    #[arg(short, long)]
    input: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Root URL of the gallery backend
    #[arg(long, env = "GALLERY_BACKEND_URL", global = true)]
    backend_url: Option<String>,

    /// Publishable API key for the gallery backend
    #[arg(long, env = "GALLERY_PUBLISHABLE_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    /// Chat endpoint (defaults to the backend's chat function)
    #[arg(long, env = "GALLERY_CHAT_URL", global = true)]
    chat_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a chat session with the AI art assistant
    Chat {
        /// Input to send to the chat
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Show recent community posts
    Feed {
        /// Number of posts to show
        #[arg(short, long, default_value_t = DEFAULT_FEED_LIMIT)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load environment variables from .env file
    dotenv().ok();

    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };

    // Replies stream to stdout, so logs go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = match Config::new(
        cli.backend_url.as_deref(),
        cli.api_key.as_deref(),
        cli.chat_url.as_deref(),
    ) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    info!("Starting gallery chat against {}", config.backend_url);

    let input = match &cli.command {
        Some(Commands::Chat { input }) => input.clone().or(cli.input.clone()),
        _ => cli.input.clone(),
    };

    let mut chat_context = ChatContext::new(
        Box::new(io::stdout()),
        input,
        true,
        ChatClient::new(&config),
        Box::new(RestBackend::new(&config)),
    );

    match cli.command {
        Some(Commands::Feed { limit }) => chat_context.run_feed(limit).await,
        // Default to chat if no subcommand is provided
        Some(Commands::Chat { .. }) | None => chat_context.run().await,
    }
}
