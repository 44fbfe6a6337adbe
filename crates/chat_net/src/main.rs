use std::io::{self, Write};

use anyhow::Context;
use chat_client::NetError;
use chat_core::NetConfig;
use chat_net::NetworkServices;
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "chat-net")]
#[command(about = "Talk to the chat backend through the resilient network layer")]
#[command(version)]
struct Cli {
    /// Override the API base URL
    #[arg(long)]
    api_base: Option<String>,

    /// Start with connectivity reported as offline
    #[arg(long, default_value = "false")]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a chat reply
    Stream {
        /// Message content
        message: String,
    },
    /// GET an endpoint
    Get { endpoint: String },
    /// POST a JSON body to an endpoint
    Post { endpoint: String, body: String },
    /// Show offline queue statistics
    QueueStats,
    /// Replay the offline queue now
    Replay,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = NetConfig::load();
    if let Some(api_base) = cli.api_base {
        config.api_base = api_base;
    }
    if cli.offline {
        config.start_offline = true;
    }
    let services =
        NetworkServices::from_config(config).context("Failed to build network services")?;

    // The queue commands inspect or replay the queue themselves.
    if !matches!(cli.command, Commands::QueueStats | Commands::Replay) {
        services.init();
    }
    let outcome = run(&services, cli.command).await;
    services.cleanup().await;
    outcome
}

async fn run(services: &NetworkServices, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Stream { message } => stream(services, &message).await,
        Commands::Get { endpoint } => {
            let response = services.dispatcher().get(&endpoint).await?;
            print_json(&response.data)
        }
        Commands::Post { endpoint, body } => {
            let body: Value = serde_json::from_str(&body).context("Body is not valid JSON")?;
            match services.dispatcher().post(&endpoint, body).await {
                Ok(response) => print_json(&response.data),
                Err(err @ NetError::Queued { .. }) => {
                    println!("{}", err.user_message());
                    println!("{err}");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        }
        Commands::QueueStats => {
            let stats = services.queue().get_stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            for item in services.queue().queued_requests().await {
                println!(
                    "  {} {:?} {} {} (retries {}/{})",
                    item.id, item.priority, item.method, item.endpoint, item.retry_count, item.max_retries
                );
            }
            Ok(())
        }
        Commands::Replay => {
            let summary = services.queue().process_queue().await;
            println!(
                "Replay {:?}: {} processed, {} failed, {} dropped",
                summary.mode, summary.processed, summary.failed, summary.dropped
            );
            Ok(())
        }
    }
}

async fn stream(services: &NetworkServices, message: &str) -> anyhow::Result<()> {
    let mut printed = 0usize;
    let outcome = services
        .stream()
        .send_message(message, |running| {
            // Updates carry the whole running text; print only what is new.
            if let Some(delta) = running.get(printed..) {
                print!("{delta}");
                let _ = io::stdout().flush();
            }
            printed = running.len();
        })
        .await?;
    println!();

    if outcome.used_fallback {
        eprintln!("(reply served by the non-streaming endpoint)");
    }
    if let Some(metadata) = &outcome.metadata {
        eprintln!("personality context: {metadata}");
    }
    for execution in services.tracker().executions().await {
        eprintln!(
            "tool {} [{:?}] {}%",
            execution.tool_name, execution.status, execution.progress
        );
    }
    Ok(())
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
