use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_adapters::{DeliveryOutcome, NotificationSink};
use relay_sync::{LogFormat, RelayConfig, RelayServices};
use relay_web::{AppState, TEST_MESSAGE};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay-cli")]
#[command(about = "Relays new CRM appointments to a group chat")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the poller and the HTTP surface until Ctrl-C.
    Serve,
    /// Run a single poll cycle and print its report.
    PollOnce {
        /// Directory holding meetings.json and clients.json.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Log messages instead of posting them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Post one test message to the chat channel.
    SendTest {
        #[arg(long)]
        text: Option<String>,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = RelayConfig::from_env().context("loading relay configuration")?;
    init_logging(config.log_format);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::PollOnce { fixtures, dry_run } => {
            let report = relay_sync::run_poll_once(config, fixtures.as_deref(), dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::SendTest { text } => {
            let services = RelayServices::from_config(config)?;
            let text = text.unwrap_or_else(|| TEST_MESSAGE.to_string());
            let outcome = services.sink.deliver(&text).await?;
            match outcome {
                DeliveryOutcome::Delivered => println!("test message delivered"),
                DeliveryOutcome::Skipped => println!("test message skipped: chat bot not configured"),
            }
        }
    }

    Ok(())
}

async fn serve(config: RelayConfig) -> Result<()> {
    let services = RelayServices::from_config(config)?;
    if services.config.chat_bot_id.is_none() {
        warn!("CHAT_BOT_ID is not set; notifications will be skipped");
    }

    let mut state = AppState::new(Arc::clone(&services.sink), services.config.formatter());
    if services.config.poller_enabled {
        services.scheduler.start().await?;
        state = state.with_poller(Arc::clone(&services.scheduler));
    } else {
        info!("poller disabled by configuration");
    }

    relay_web::serve(state, services.config.web_port, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
        }
    })
    .await?;

    services.scheduler.stop().await?;
    info!("relay stopped");
    Ok(())
}
