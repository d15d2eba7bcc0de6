//! Simulation scenarios for the mesh transport over a simulated medium

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use meshnode_transport::{
    Address, ChannelConfig, Frame, FrameType, HandlerKey, MediumStats, MeshConfig, MeshNode,
    NodeStats, RouteState, SimulatedMedium,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

/// Address no node in a scenario uses.
pub const ABSENT_ADDRESS: Address = 9;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub delivered: bool,
    pub elapsed: Duration,
    pub route: String,
    pub nodes: Vec<(Address, NodeStats)>,
    pub medium: MediumStats,
}

/// Nodes 1..=n on a line, each in range of its immediate neighbors only.
pub async fn build_line(
    medium: &Arc<SimulatedMedium>,
    count: usize,
    config: &MeshConfig,
) -> Result<Vec<MeshNode>> {
    let mut nodes = Vec::with_capacity(count);
    for address in 1..=count as Address {
        if address > 1 {
            medium.connect(address - 1, address);
        }
        let link = Arc::new(medium.join(address).await);
        let neighbors = Arc::new(medium.neighbor_view(address));
        let node = MeshNode::new(address, config.clone(), link, neighbors)
            .with_context(|| format!("creating node {}", address))?;
        node.start();
        nodes.push(node);
    }
    Ok(nodes)
}

fn collect_stats(nodes: &[MeshNode]) -> Vec<(Address, NodeStats)> {
    nodes
        .iter()
        .map(|node| (node.local_address(), node.stats()))
        .collect()
}

fn describe(state: RouteState) -> String {
    match state {
        RouteState::Unknown => "unknown".into(),
        RouteState::Discovering => "discovering".into(),
        RouteState::Known { next_hop, hop_count } => {
            format!("via {} ({} hops)", next_hop, hop_count)
        }
        RouteState::Unreachable => "unreachable".into(),
    }
}

/// Sends `payload_size` bytes from one end of a line to the other, across
/// `hops` relays, and waits for the far end to deliver them.
pub async fn line_transfer(
    name: &str,
    channel: ChannelConfig,
    config: MeshConfig,
    hops: usize,
    payload_size: usize,
    deadline: Duration,
) -> Result<ScenarioReport> {
    let medium = SimulatedMedium::new(channel);
    let nodes = build_line(&medium, hops + 2, &config).await?;
    let (origin, target) = match (nodes.first(), nodes.last()) {
        (Some(origin), Some(target)) => (origin, target),
        _ => anyhow::bail!("line has no nodes"),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    target
        .register_handler(HandlerKey::Type(FrameType::Replication), move |frame: &Frame| {
            tx.send(frame.clone())?;
            Ok(())
        })
        .await;

    let payload: Vec<u8> = (0..payload_size).map(|i| (i % 251) as u8).collect();
    let started = Instant::now();
    origin
        .send(FrameType::Replication, payload.clone(), target.local_address())
        .await?;

    let delivered = match timeout(deadline, rx.recv()).await {
        Ok(Some(frame)) => {
            if frame.payload != payload {
                anyhow::bail!("payload corrupted in transit");
            }
            log::info!("{} delivered {} bytes in {:?}", name, payload_size, started.elapsed());
            true
        }
        _ => false,
    };
    let elapsed = started.elapsed();
    // let the final acknowledgement travel back before sampling counters
    sleep(config.ack_timeout).await;

    Ok(ScenarioReport {
        name: name.to_string(),
        delivered,
        elapsed,
        route: describe(origin.route_state(target.local_address()).await),
        nodes: collect_stats(&nodes),
        medium: medium.get_stats(),
    })
}

/// Sends to an address nobody answers for and waits out discovery.
pub async fn unreachable_destination(
    name: &str,
    channel: ChannelConfig,
    config: MeshConfig,
) -> Result<ScenarioReport> {
    let medium = SimulatedMedium::new(channel);
    let nodes = build_line(&medium, 3, &config).await?;
    let origin = nodes.first().context("line has no nodes")?;

    let started = Instant::now();
    origin
        .send(FrameType::Config, b"interval=60".to_vec(), ABSENT_ADDRESS)
        .await?;
    sleep(config.discovery_timeout + config.route_retry_interval * 2).await;

    Ok(ScenarioReport {
        name: name.to_string(),
        delivered: false,
        elapsed: started.elapsed(),
        route: describe(origin.route_state(ABSENT_ADDRESS).await),
        nodes: collect_stats(&nodes),
        medium: medium.get_stats(),
    })
}

pub fn print_report(report: &ScenarioReport) {
    let verdict = if report.delivered {
        "delivered".bright_green().bold()
    } else {
        "not delivered".bright_red().bold()
    };
    println!("{} {} in {:?}", report.name.bright_blue().bold(), verdict, report.elapsed);
    println!("  route: {}", report.route);
    println!(
        "  medium: {} sent, {} lost, {} corrupted, {} delivered",
        report.medium.packets_sent,
        report.medium.packets_dropped,
        report.medium.packets_corrupted,
        report.medium.packets_delivered
    );
    for (address, stats) in &report.nodes {
        println!(
            "  node {}: {} sent, {} received, {} retries, {} acks, {} relayed",
            address,
            stats.frames_sent,
            stats.frames_received,
            stats.retransmissions,
            stats.acks_received,
            stats.forwarded
        );
        println!(
            "          {} corrupt, {} abandoned, {} unroutable",
            stats.corrupt_dropped, stats.abandoned, stats.unroutable
        );
    }
}
