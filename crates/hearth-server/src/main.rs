use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hearth_xmpp::roster::RosterTrust;
use hearth_xmpp::{ChannelDelivery, Connector, SessionManager};
use tracing::{error, info, warn};

mod config;
mod telemetry;

use config::Config;

#[derive(Parser)]
#[command(name = "hearthd")]
#[command(author, version, about = "Jabber client connector and session manager", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "hearth.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_json)?;

    info!("Hearth starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;

    let accounts = Arc::new(config.accounts()?);
    let roster = Arc::new(config.roster()?);
    let trust = Arc::new(RosterTrust::new(roster.clone()));
    info!(
        accounts = accounts.len(),
        roster_entries = config.roster.len(),
        "Seeded accounts and rosters"
    );

    let (bus, bus_rx) = ChannelDelivery::new();
    let bus = Arc::new(bus);

    let connector = Connector::new(config.connector(), bus.clone());
    let sm = SessionManager::new(
        config.session_manager()?,
        bus,
        connector.handle(),
        accounts,
        roster,
        trust,
    )
    .context("Failed to create session manager")?;
    info!(domain = sm.host(), connector = connector.handle().host(), "Session manager ready");

    // A connector that cannot listen takes only itself down
    let connector_task = tokio::spawn(async move {
        match connector.bind().await {
            Ok(bound) => bound.serve().await,
            Err(e) => error!(error = %e, "Failed to bind client connector"),
        }
    });
    let mut sm_task = tokio::spawn(sm.run(bus_rx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
        _ = &mut sm_task => warn!("Session manager stopped"),
    }

    connector_task.abort();
    sm_task.abort();
    info!("Hearth stopped");
    Ok(())
}
