use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use parkwatch_gateway::{Gateway, GatewayConfig, RouterExit};

#[derive(Parser, Debug)]
#[command(name = "parkwatch-gateway", version, about = "ParkWatch telemetry gateway")]
struct Args {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long, env = "PARKWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// InfluxDB API token, overrides `influx.token`
    #[arg(long, env = "PARKWATCH_INFLUX_TOKEN", hide_env_values = true)]
    influx_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(token) = args.influx_token {
        config.influx.token = Some(token);
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    let mut gateway = Gateway::connect(&config)
        .await
        .context("starting gateway")?;

    let exit = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            info!("Interrupt received");
            RouterExit::Shutdown
        }
        exit = gateway.wait() => exit,
    };

    gateway.stop().await;

    if exit == RouterExit::SubscriptionClosed {
        warn!("Bus connection lost");
        anyhow::bail!("bus connection lost");
    }
    Ok(())
}
