//! simulation tools for meshnode

pub mod scenarios;

use std::time::Duration;

use meshnode_transport::{ChannelConfig, MeshConfig};
use serde::{Deserialize, Serialize};

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> ChannelConfig {
        ChannelConfig {
            mtu: 255,
            bandwidth_bps: 9600,
            latency: Duration::from_millis(20),
            latency_jitter: Duration::from_millis(5),
            packet_loss: 0.02,
            corruption_rate: 0.02,
            max_corrupted_bytes: 1,
            rssi: Some(200),
        }
    }

    pub fn average_conditions() -> ChannelConfig {
        ChannelConfig {
            mtu: 255,
            bandwidth_bps: 2400,
            latency: Duration::from_millis(50),
            latency_jitter: Duration::from_millis(15),
            packet_loss: 0.08,
            corruption_rate: 0.05,
            max_corrupted_bytes: 2,
            rssi: Some(150),
        }
    }

    pub fn poor_conditions() -> ChannelConfig {
        ChannelConfig {
            mtu: 255,
            bandwidth_bps: 1200,
            latency: Duration::from_millis(100),
            latency_jitter: Duration::from_millis(40),
            packet_loss: 0.20,
            corruption_rate: 0.15,
            max_corrupted_bytes: 2,
            rssi: Some(90),
        }
    }

    /// Corruption beyond what the parity bytes can repair, at the slowest air rate.
    pub fn extreme_conditions() -> ChannelConfig {
        ChannelConfig {
            mtu: 255,
            bandwidth_bps: 300,
            latency: Duration::from_millis(250),
            latency_jitter: Duration::from_millis(100),
            packet_loss: 0.35,
            corruption_rate: 0.30,
            max_corrupted_bytes: 4,
            rssi: Some(40),
        }
    }

    pub fn by_name(name: &str) -> Option<ChannelConfig> {
        match name {
            "good" => Some(Self::good_conditions()),
            "average" => Some(Self::average_conditions()),
            "poor" => Some(Self::poor_conditions()),
            "extreme" => Some(Self::extreme_conditions()),
            _ => None,
        }
    }
}

/// Simulator run description, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub presets: Vec<String>,
    /// Relays between sender and receiver on the line topology.
    pub hops: usize,
    pub payload_size: usize,
    pub deadline_secs: u64,
    pub mesh: MeshConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            presets: vec!["good".into(), "average".into(), "poor".into()],
            hops: 2,
            payload_size: 512,
            deadline_secs: 120,
            mesh: MeshConfig {
                heartbeat_interval: None,
                ..Default::default()
            },
        }
    }
}

/// Stretches ack timing so one acknowledgement round trip over `hops` links
/// fits in the first deadline at the channel's air rate.
pub fn tune_for_channel(mesh: &MeshConfig, channel: &ChannelConfig, hops: usize) -> MeshConfig {
    let airtime = if channel.bandwidth_bps == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64((mesh.packet_size * 8) as f64 / channel.bandwidth_bps as f64)
    };
    let per_link = airtime + channel.latency + channel.latency_jitter * 2 + mesh.poll_interval;
    let round_trip = per_link * (2 * (hops as u32 + 1));
    MeshConfig {
        ack_timeout: mesh.ack_timeout.max(round_trip),
        rssi_appended: channel.rssi.is_some(),
        ..mesh.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_by_name() {
        assert!(SimulationPresets::by_name("good").is_some());
        assert!(SimulationPresets::by_name("solar-storm").is_none());
        assert_eq!(SimulationPresets::by_name("poor").unwrap().bandwidth_bps, 1200);
    }

    #[test]
    fn slow_channels_get_longer_ack_timeouts() {
        let mesh = MeshConfig::default();
        let fast = tune_for_channel(&mesh, &ChannelConfig::default(), 2);
        assert_eq!(fast.ack_timeout, mesh.ack_timeout);
        assert!(!fast.rssi_appended);

        let slow = tune_for_channel(&mesh, &SimulationPresets::poor_conditions(), 2);
        assert!(slow.ack_timeout > Duration::from_secs(5));
        assert!(slow.rssi_appended);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{ "hops": 4, "mesh": { "max_tries": 5 } }"#).unwrap();
        assert_eq!(config.hops, 4);
        assert_eq!(config.payload_size, 512);
        assert_eq!(config.mesh.max_tries, 5);
        assert_eq!(config.mesh.default_ttl, 20);
    }
}
