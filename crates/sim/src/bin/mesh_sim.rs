//! mesh transport simulation over lossy LoRa-style links
//!
//! Usage: `mesh_sim [config.json]`. The optional JSON file overrides
//! [`SimulationConfig`] fields; missing fields keep their defaults.

use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use meshnode_sim::scenarios::{self, ScenarioReport};
use meshnode_sim::{tune_for_channel, SimulationConfig, SimulationPresets};

fn load_config() -> Result<SimulationConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))
        }
        None => Ok(SimulationConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = load_config()?;
    config.mesh.validate()?;

    println!("{}", "Mesh Transport Simulation".bright_blue().bold());
    println!("{}", "=========================".bright_blue());
    println!(
        "{} relays, {} byte payload, {} byte fragments",
        config.hops,
        config.payload_size,
        config.mesh.max_fragment_payload()
    );

    let mut reports: Vec<ScenarioReport> = Vec::new();
    for name in &config.presets {
        let Some(channel) = SimulationPresets::by_name(name) else {
            println!("{}", format!("Unknown preset '{}', skipping", name).bright_yellow());
            continue;
        };
        println!("{}", format!("\n>>> Line transfer: {} conditions", name).bright_green().bold());
        println!("Bandwidth: {} bps", channel.bandwidth_bps);
        println!("Packet Loss: {}%", (channel.packet_loss * 100.0) as u32);
        println!("Corruption: {}%", (channel.corruption_rate * 100.0) as u32);
        println!("Latency: {:?}", channel.latency);

        let mesh = tune_for_channel(&config.mesh, &channel, config.hops);
        let report = scenarios::line_transfer(
            name,
            channel,
            mesh,
            config.hops,
            config.payload_size,
            Duration::from_secs(config.deadline_secs),
        )
        .await?;
        scenarios::print_report(&report);
        reports.push(report);
    }

    println!("{}", "\n>>> Unreachable destination".bright_green().bold());
    let good = SimulationPresets::good_conditions();
    let mesh = tune_for_channel(&config.mesh, &good, config.hops);
    let report = scenarios::unreachable_destination("unreachable", good, mesh).await?;
    scenarios::print_report(&report);
    reports.push(report);

    let delivered = reports.iter().filter(|report| report.delivered).count();
    println!(
        "\n{}",
        format!("{} of {} transfers delivered", delivered, reports.len() - 1)
            .bright_green()
            .bold()
    );
    log::debug!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
