//! Minimal Astarte device simulator.
//!
//! Connects to a broker as one device, registers the `com.astarte.Tester`
//! telemetry interface and, once connected, publishes a synthetic
//! `{timestamp, counter, random}` aggregate every second until the optional
//! send limit is reached.

mod config;
mod device;
mod interface;
mod telemetry;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};

use config::Config;
use device::DeviceClient;
use interface::{Interface, TESTER_INTERFACE};
use telemetry::TelemetryLoop;

const SEND_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "astarte-tester", about = "Publish synthetic telemetry to an Astarte broker")]
struct Args {
    /// Astarte device id
    #[arg(short = 'i', long)]
    device_id: String,

    /// Credential secret obtained at pairing time
    #[arg(short = 's', long)]
    device_secret: String,

    /// Pairing endpoint the device was registered against
    #[arg(short = 'u', long)]
    astarte_pairing_url: String,

    /// Astarte realm the device belongs to
    #[arg(short = 'n', long)]
    realm_name: String,

    /// Number of samples to send; zero or negative means send forever
    #[arg(short = 'l', long, default_value_t = -1, allow_negative_numbers = true)]
    limit: i64,
}

#[tokio::main]
async fn main() {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    color_backtrace::install();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!("{err:#}");
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::new(
        args.device_id,
        args.device_secret,
        args.astarte_pairing_url,
        args.realm_name,
        args.limit,
    );
    info!("send limit: {:?}", config.limit);

    config.ensure_persistence_dir()?;

    info!(
        "connecting to {}@{} as {}",
        config.pairing_url, config.realm_name, config.device_id
    );
    let (mut device, event_loop) = DeviceClient::new(&config)?;
    device.add_interface(Interface::tester())?;

    let mut handler = TelemetryLoop::new(TESTER_INTERFACE, config.limit, SEND_INTERVAL);

    tokio::select! {
        result = device.run(event_loop, &mut handler) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
