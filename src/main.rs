use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chatrelay::client::{ChatClient, Speaker};
use chatrelay::config::AppConfig;
use chatrelay::context::AppContext;
use chatrelay::logging::{self, LogConfig};
use chatrelay::relay::{Registry, codec};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Line-based TCP chat relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve(ServerArgs),
    /// Join a relay as an interactive participant
    Connect(ConnectArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    bind_address: Option<IpAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    charset: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    locale: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args, Serialize)]
struct ConnectArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    server_host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    charset: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    locale: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    chat_datetime_pattern: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    match &cli.command {
        Commands::Serve(args) => {
            let config = AppConfig::load(config_file, Some(args))?;
            run_server(config).await.context("Relay stopped with an error")?
        }
        Commands::Connect(args) => {
            let config = AppConfig::load(config_file, Some(args))?;
            run_client(config).await.context("Chat session failed")?
        }
    }

    Ok(())
}

async fn run_server(config: AppConfig) -> Result<()> {
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });
    info!("Application started");

    let ctx = AppContext::new(config)?;
    let registry = Registry::new(ctx);

    let on_signal = Arc::clone(&registry);
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Forced shutdown...");
            on_signal.shutdown().await;
        }
    });

    match registry.start().await {
        // Only shutdown stops a running relay cleanly; let it finish closing connections.
        Ok(()) => {
            let _ = signal_task.await;
        }
        Err(e) => {
            signal_task.abort();
            return Err(e.into());
        }
    }

    info!("Application finished");
    Ok(())
}

async fn run_client(config: AppConfig) -> Result<()> {
    let encoding = config.encoding()?;
    let language = config.language();

    let client = ChatClient::connect((config.server_host.as_str(), config.port), encoding)
        .await
        .with_context(|| format!("Unable to connect to {}:{}", config.server_host, config.port))?;
    let (id, mut reader, mut writer) = client.into_split();

    let pattern = config.chat_datetime_pattern.clone();
    let mut printer = tokio::spawn(async move {
        while let Ok(Some(message)) = reader.next_message().await {
            let label = Speaker::of(id, message.from).label(language);
            println!("{} {} {}", Local::now().format(&pattern), label, message.text);
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            // The relay closed the connection (kick or shutdown).
            _ = &mut printer => return Ok(()),
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                writer.send(&line).await?;
                if line.trim() == codec::QUIT_COMMAND {
                    break;
                }
            }
        }
    }

    writer.close().await?;
    let _ = printer.await;
    Ok(())
}
