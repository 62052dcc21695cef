//! Static board description: endpoint table and configured routes.

use std::collections::HashSet;

use audio_route_types::{Capability, EndpointId, RouteId, SessionId};
use serde::Deserialize;

use crate::error::{Result, RouteError};

/// Session id the DSP reserves for the FM loopback client.
pub const FM_SESSION_ID: SessionId = SessionId(10);

/// Default endpoint sample rate when the table does not specify one.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// One row of the endpoint table.
#[derive(Clone, Debug, Deserialize)]
pub struct EndpointSpec {
    pub id: EndpointId,
    pub name: String,
    pub capability: Capability,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

/// Endpoint bindings of a route.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteKindSpec {
    Playback {
        #[serde(default)]
        endpoint: Option<EndpointId>,
    },
    Record {
        #[serde(default)]
        endpoint: Option<EndpointId>,
    },
    Voice {
        #[serde(default)]
        rx: Option<EndpointId>,
        #[serde(default)]
        tx: Option<EndpointId>,
    },
    Loopback {
        source: EndpointId,
        /// Fixed destination; when unset the first RX endpoint to become ready is used.
        #[serde(default)]
        dest: Option<EndpointId>,
    },
}

/// One configured route.
#[derive(Clone, Debug, Deserialize)]
pub struct RouteSpec {
    pub id: RouteId,
    pub name: String,
    pub session: SessionId,
    #[serde(flatten)]
    pub kind: RouteKindSpec,
}

/// Full board description handed to [`crate::Context::new`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BoardSpec {
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

impl BoardSpec {
    /// Check ids are unique, references resolve and directions fit.
    pub fn validate(&self) -> Result<()> {
        let mut endpoint_ids = HashSet::new();
        for ep in &self.endpoints {
            if !endpoint_ids.insert(ep.id) {
                return Err(RouteError::InvalidConfig(format!(
                    "duplicate endpoint id {}",
                    ep.id.0
                )));
            }
        }

        let mut route_ids = HashSet::new();
        let mut sessions = HashSet::new();
        let mut loopbacks = 0usize;
        for route in &self.routes {
            if !route_ids.insert(route.id) {
                return Err(RouteError::InvalidConfig(format!(
                    "duplicate route id {}",
                    route.id.0
                )));
            }
            if !sessions.insert((route_class_key(&route.kind), route.session)) {
                return Err(RouteError::InvalidConfig(format!(
                    "route '{}' reuses session {}",
                    route.name, route.session.0
                )));
            }
            match &route.kind {
                RouteKindSpec::Playback { endpoint } => {
                    self.check_direction(&route.name, *endpoint, Capability::supports_rx, "rx")?;
                }
                RouteKindSpec::Record { endpoint } => {
                    self.check_direction(&route.name, *endpoint, Capability::supports_tx, "tx")?;
                }
                RouteKindSpec::Voice { rx, tx } => {
                    self.check_direction(&route.name, *rx, Capability::supports_rx, "rx")?;
                    self.check_direction(&route.name, *tx, Capability::supports_tx, "tx")?;
                }
                RouteKindSpec::Loopback { source, dest } => {
                    loopbacks += 1;
                    self.check_direction(&route.name, Some(*source), |_| true, "source")?;
                    self.check_direction(&route.name, *dest, Capability::supports_rx, "rx")?;
                    if Some(*source) == *dest {
                        return Err(RouteError::InvalidConfig(format!(
                            "route '{}' loops endpoint {} onto itself",
                            route.name, source.0
                        )));
                    }
                }
            }
        }
        if loopbacks > 1 {
            return Err(RouteError::InvalidConfig(
                "at most one loopback route is supported".to_string(),
            ));
        }
        Ok(())
    }

    fn check_direction(
        &self,
        route: &str,
        endpoint: Option<EndpointId>,
        fits: fn(Capability) -> bool,
        required: &str,
    ) -> Result<()> {
        let Some(id) = endpoint else {
            return Ok(());
        };
        let Some(spec) = self.endpoints.iter().find(|ep| ep.id == id) else {
            return Err(RouteError::InvalidConfig(format!(
                "route '{route}' references unknown endpoint {}",
                id.0
            )));
        };
        if !fits(spec.capability) {
            return Err(RouteError::InvalidConfig(format!(
                "route '{route}' needs {required} on endpoint {} ({:?})",
                id.0, spec.capability
            )));
        }
        Ok(())
    }
}

fn route_class_key(kind: &RouteKindSpec) -> u8 {
    match kind {
        RouteKindSpec::Voice { .. } => 0,
        RouteKindSpec::Playback { .. } | RouteKindSpec::Loopback { .. } => 1,
        RouteKindSpec::Record { .. } => 2,
    }
}
