//! Standalone monitor server
//!
//! Deployments that do not colocate a monitor with their archetypes run
//! this binary on a separately addressable node.

use std::time::Duration;

use clap::Parser;
use mpcal_runtime::monitor::{Monitor, MonitorConfig};

#[derive(Parser)]
#[command(name = "monitor", about = "Node-liveness monitor for MPCal archetypes")]
struct Args {
    /// Address to listen on, e.g. 0.0.0.0:7800
    #[arg(long)]
    listen: String,

    /// Heartbeat silence tolerated before a peer is reported suspected,
    /// in milliseconds
    #[arg(long, default_value_t = 2000)]
    window_ms: u64,

    /// Log filter, e.g. "info" or "mpcal_runtime=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log))
        .init();

    let config = MonitorConfig {
        inactivity_window: Duration::from_millis(args.window_ms),
        ..MonitorConfig::default()
    };
    let monitor = Monitor::spawn(args.listen, config)?;
    tracing::info!(addr = monitor.addr(), "monitor running");

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
