//! Board file loading.
//!
//! The TOML file carries the endpoint table, the routes and a few knobs for
//! the simulated device layer.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use audio_route::config::{BoardSpec, EndpointSpec, RouteSpec};

/// Endpoint count exposed by the simulated device layer when unset.
const DEFAULT_ENDPOINT_COUNT: usize = 32;

/// Top-level board configuration loaded from TOML.
#[derive(Debug, Deserialize)]
pub struct BoardConfig {
    /// Endpoint table.
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    /// Configured routes (playback, record, voice, loopback).
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    /// Simulated hardware settings.
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct SimConfig {
    /// Number of endpoints the device layer reports.
    pub endpoint_count: Option<usize>,
    /// Voice call TX frequency in Hz (0 = no call).
    #[serde(default)]
    pub voice_tx_hz: u32,
    /// Voice call RX frequency in Hz (0 = no call).
    #[serde(default)]
    pub voice_rx_hz: u32,
}

impl BoardConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<BoardConfig>(raw)?)
    }

    pub fn board(&self) -> BoardSpec {
        BoardSpec {
            endpoints: self.endpoints.clone(),
            routes: self.routes.clone(),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.sim.endpoint_count.unwrap_or(DEFAULT_ENDPOINT_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_route::config::RouteKindSpec;
    use audio_route_types::{Capability, EndpointId};

    const SAMPLE: &str = r#"
[sim]
endpoint_count = 8
voice_tx_hz = 8000
voice_rx_hz = 8000

[[endpoints]]
id = 0
name = "handset_rx"
capability = "rx"

[[endpoints]]
id = 2
name = "fm_rx"
capability = "tx"
sample_rate = 44100

[[routes]]
id = 1
name = "music"
session = 1
kind = "playback"
endpoint = 0

[[routes]]
id = 4
name = "fm"
session = 10
kind = "loopback"
source = 2
"#;

    #[test]
    fn parses_sample_board() {
        let cfg = BoardConfig::parse(SAMPLE).expect("parse");
        assert_eq!(cfg.endpoint_count(), 8);
        assert_eq!(cfg.sim.voice_rx_hz, 8000);
        assert_eq!(cfg.endpoints[0].capability, Capability::Rx);
        assert_eq!(cfg.endpoints[0].sample_rate, 48_000);
        assert_eq!(cfg.endpoints[1].sample_rate, 44_100);
        assert_eq!(
            cfg.routes[0].kind,
            RouteKindSpec::Playback {
                endpoint: Some(EndpointId(0))
            }
        );
        assert_eq!(
            cfg.routes[1].kind,
            RouteKindSpec::Loopback {
                source: EndpointId(2),
                dest: None
            }
        );
        cfg.board().validate().expect("valid");
    }

    #[test]
    fn missing_sim_section_uses_defaults() {
        let cfg = BoardConfig::parse("").expect("empty board");
        assert_eq!(cfg.endpoint_count(), DEFAULT_ENDPOINT_COUNT);
        assert!(cfg.routes.is_empty());
    }

    #[test]
    fn unknown_route_kind_is_an_error() {
        let raw = r#"
[[routes]]
id = 1
name = "x"
session = 1
kind = "karaoke"
"#;
        assert!(BoardConfig::parse(raw).is_err());
    }
}
