//! portmap-probe
//!
//! Looks for PCP and NAT-PMP gateways reachable from this host.

use anyhow::Context;
use clap::Parser;
use portmap::config::Config;
use portmap::gateway::UdpGateway;
use portmap::orchestrator::AttemptSchedule;
use portmap::presets::COMMON_GATEWAY_ADDRESSES;
use portmap::probe::probe_gateways;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, warn};

/// Probe LAN gateways for PCP and NAT-PMP support.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a JSON configuration file. Defaults are used if it doesn't exist.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    /// Number of send/wait rounds. Overrides the configuration file.
    #[arg(long, short = 'a')]
    attempts: Option<u32>,
    /// Gateway address to probe. May be repeated. Defaults to the system
    /// default gateway plus a table of common router addresses.
    #[arg(long = "gateway", short = 'g')]
    gateways: Vec<IpAddr>,
    /// Print results as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    portmap::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(attempts) = args.attempts {
        config.attempts = attempts;
    }
    config.validate()?;

    let candidates = if args.gateways.is_empty() {
        default_candidates()
    } else {
        args.gateways.clone()
    };
    let schedule: AttemptSchedule = config.attempt_schedule();
    info!(
        "Probing {} gateways over {} rounds (up to {:?})",
        candidates.len(),
        schedule.len(),
        schedule.total()
    );

    let gateway = UdpGateway::spawn(&config);
    let result = probe_gateways(
        gateway.bus(),
        &candidates,
        &schedule,
        config.provisioning_timeout(),
    )
    .await;
    gateway.shutdown().await?;
    let discovered = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&discovered)?);
    } else if discovered.is_empty() {
        println!("No PCP or NAT-PMP gateway answered.");
    } else {
        for found in &discovered {
            let external = found
                .external_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<8} {:<40} via {:<40} external {} (epoch {}s)",
                found.kind.to_string(),
                found.gateway,
                found.local_ip,
                external,
                found.epoch_secs
            );
        }
    }

    Ok(())
}

/// System default gateway first, then the preset table
fn default_candidates() -> Vec<IpAddr> {
    let mut candidates: Vec<IpAddr> = match netdev::get_default_gateway() {
        Ok(gateway) => gateway.ipv4.into_iter().map(IpAddr::V4).collect(),
        Err(e) => {
            warn!("Default gateway unknown: {}", e);
            Vec::new()
        }
    };
    for preset in COMMON_GATEWAY_ADDRESSES {
        let preset = IpAddr::V4(*preset);
        if !candidates.contains(&preset) {
            candidates.push(preset);
        }
    }
    candidates
}
