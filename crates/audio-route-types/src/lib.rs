use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable small integer identifying a physical audio endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub u16);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// Logical client session id (decoder/encoder/voice instance).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u16);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess{}", self.0)
    }
}

/// Identifier of a configured logical route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(pub u16);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route{}", self.0)
    }
}

/// Direction(s) an endpoint can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Output (speaker, headset earpiece).
    Rx,
    /// Input (microphone, FM receiver tap).
    Tx,
    /// Both directions.
    Duplex,
}

impl Capability {
    pub fn supports_rx(self) -> bool {
        matches!(self, Capability::Rx | Capability::Duplex)
    }

    pub fn supports_tx(self) -> bool {
        matches!(self, Capability::Tx | Capability::Duplex)
    }
}

/// Class of logical client bound to an endpoint.
///
/// Discriminants follow the hardware session mask layout: each class owns one
/// 8-bit lane starting at `8 * class`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientClass {
    Voice = 0,
    Decoder = 1,
    Encoder = 2,
}

impl ClientClass {
    pub const ALL: [ClientClass; 3] = [ClientClass::Voice, ClientClass::Decoder, ClientClass::Encoder];

    /// Bit offset of this class' lane in a session mask.
    pub fn lane_shift(self) -> u32 {
        8 * self as u32
    }
}

impl TryFrom<u8> for ClientClass {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ClientClass::Voice),
            1 => Ok(ClientClass::Decoder),
            2 => Ok(ClientClass::Encoder),
            other => Err(other),
        }
    }
}

impl fmt::Display for ClientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientClass::Voice => "voice",
            ClientClass::Decoder => "decoder",
            ClientClass::Encoder => "encoder",
        };
        f.write_str(name)
    }
}

/// Kind of readiness notification.
///
/// Raw codes are single bits so that a set of kinds fits in an event mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A voice endpoint was unrouted.
    VoiceDeviceChanged = 0x01,
    /// Endpoint powered up and usable.
    DeviceReady = 0x02,
    /// Endpoint released; dependents must stop using it.
    DeviceReleased = 0x04,
    /// Endpoint is about to be released.
    ReleasePending = 0x08,
    /// Stream volume for a session changed.
    VolumeChanged = 0x20,
    /// Playback/record routing for an endpoint changed.
    RouteChanged = 0x40,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::VoiceDeviceChanged,
        EventKind::DeviceReady,
        EventKind::DeviceReleased,
        EventKind::ReleasePending,
        EventKind::VolumeChanged,
        EventKind::RouteChanged,
    ];

    pub fn bit(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for EventKind {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.bit() == raw)
            .ok_or(raw)
    }
}

/// Route state as seen by callers.
///
/// `Opening` is the persisted "enabled, waiting for dependencies" state.
/// `Closing` only exists inside a single controller call and is never reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
}

/// Snapshot of one endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub id: EndpointId,
    pub name: String,
    pub capability: Capability,
    /// Default sample rate from the board table (Hz).
    pub sample_rate: u32,
    /// Rate negotiated by the last successful open (Hz).
    pub negotiated_rate: Option<u32>,
    pub open: bool,
    /// Held powered by device control.
    #[serde(default)]
    pub pinned: bool,
    /// Routes holding the endpoint powered.
    #[serde(default)]
    pub holders: Vec<RouteId>,
    pub ready: bool,
    pub session_mask: u32,
}

/// Snapshot of one logical route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStatus {
    pub id: RouteId,
    pub name: String,
    /// `playback`, `record`, `voice` or `loopback`.
    pub kind: String,
    pub session: SessionId,
    pub state: RouteState,
    /// User asked for the route to be on.
    pub enabled: bool,
    /// Endpoints this route currently depends on.
    pub endpoints: Vec<EndpointId>,
    /// Last volume applied through the route's session.
    pub volume: Option<u16>,
}

/// Snapshot of the shared loopback gate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackStatus {
    /// A client holds the gate.
    #[serde(default)]
    pub open: bool,
    pub enabled: bool,
    pub running: bool,
    pub source: Option<EndpointId>,
    pub dest: Option<EndpointId>,
    pub source_ready: bool,
    pub dest_ready: bool,
}

/// Whole-context snapshot returned by `status` commands.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub endpoints: Vec<EndpointStatus>,
    pub routes: Vec<RouteStatus>,
    pub loopback: Option<LoopbackStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_raw_code() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::try_from(kind.bit()), Ok(kind));
        }
        assert_eq!(EventKind::try_from(0x10), Err(0x10));
        assert_eq!(EventKind::try_from(0x03), Err(0x03));
    }

    #[test]
    fn client_class_rejects_unknown_raw_values() {
        assert_eq!(ClientClass::try_from(1), Ok(ClientClass::Decoder));
        assert_eq!(ClientClass::try_from(7), Err(7));
    }

    #[test]
    fn capability_directions() {
        assert!(Capability::Rx.supports_rx());
        assert!(!Capability::Rx.supports_tx());
        assert!(Capability::Duplex.supports_rx() && Capability::Duplex.supports_tx());
    }

    #[test]
    fn route_state_serializes_snake_case() {
        let json = serde_json::to_string(&RouteState::Opening).expect("serialize");
        assert_eq!(json, "\"opening\"");
        let id: EndpointId = serde_json::from_str("5").expect("deserialize");
        assert_eq!(id, EndpointId(5));
    }
}
