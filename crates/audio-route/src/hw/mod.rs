//! Hardware collaborator interface.
//!
//! The core never talks to codecs or the DSP directly. Every side effect goes
//! through [`AudioHardware`]; calls are synchronous and report pass/fail.

pub mod sim;

use audio_route_types::{ClientClass, EndpointId, SessionId};

/// Failure reported by the hardware layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HwError {
    message: String,
}

impl HwError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Calls the routing core makes into the device/DSP layer.
pub trait AudioHardware: Send + Sync {
    /// Power up an endpoint at the requested rate; returns the rate the codec settled on.
    fn open_endpoint(&self, endpoint: EndpointId, sample_rate: u32) -> Result<u32, HwError>;

    /// Power down an endpoint.
    fn close_endpoint(&self, endpoint: EndpointId) -> Result<(), HwError>;

    /// Connect (or break) the AFE loopback from `source` to `dest`.
    fn set_loopback(&self, enable: bool, dest: EndpointId, source: EndpointId)
    -> Result<(), HwError>;

    /// Attach or detach a stream session to an endpoint's post-processing path.
    fn route_stream(
        &self,
        class: ClientClass,
        session: SessionId,
        endpoint: EndpointId,
        enable: bool,
    ) -> Result<(), HwError>;

    /// Apply a stream volume (0..=16383) to a decoder session.
    fn set_stream_volume(&self, session: SessionId, level: u16) -> Result<(), HwError>;

    /// Number of endpoints the device layer exposes.
    fn endpoint_count(&self) -> usize;

    /// Current voice call frequencies `(tx_hz, rx_hz)`; zero means "no voice call".
    fn voice_frequencies(&self) -> (u32, u32);
}
