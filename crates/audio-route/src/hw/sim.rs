//! In-process hardware backend.
//!
//! Records every call so tests (and `routectl`) can check exactly what the
//! core asked the device layer to do. Individual operations can be told to fail.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use audio_route_types::{ClientClass, EndpointId, SessionId};

use super::{AudioHardware, HwError};

/// One recorded hardware call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwCall {
    Open { endpoint: EndpointId, rate: u32 },
    Close { endpoint: EndpointId },
    Loopback {
        enable: bool,
        dest: EndpointId,
        source: EndpointId,
    },
    RouteStream {
        class: ClientClass,
        session: SessionId,
        endpoint: EndpointId,
        enable: bool,
    },
    Volume { session: SessionId, level: u16 },
}

#[derive(Default)]
struct SimState {
    calls: Vec<HwCall>,
    fail_open: HashSet<EndpointId>,
    fail_close: HashSet<EndpointId>,
    fail_loopback: bool,
    fail_route_stream: HashSet<EndpointId>,
    rate_caps: HashMap<EndpointId, u32>,
    open_delay: Option<Duration>,
    voice_frequencies: (u32, u32),
}

/// Simulated device layer with a call log and failure injection.
pub struct SimulatedHardware {
    endpoint_count: usize,
    state: Mutex<SimState>,
}

impl SimulatedHardware {
    pub fn new(endpoint_count: usize) -> Self {
        Self {
            endpoint_count,
            state: Mutex::new(SimState::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        f(&mut state)
    }

    /// Make `open_endpoint` fail for this endpoint until cleared.
    pub fn fail_open(&self, endpoint: EndpointId, fail: bool) {
        self.with_state(|s| {
            if fail {
                s.fail_open.insert(endpoint);
            } else {
                s.fail_open.remove(&endpoint);
            }
        });
    }

    /// Make `close_endpoint` fail for this endpoint until cleared.
    pub fn fail_close(&self, endpoint: EndpointId, fail: bool) {
        self.with_state(|s| {
            if fail {
                s.fail_close.insert(endpoint);
            } else {
                s.fail_close.remove(&endpoint);
            }
        });
    }

    pub fn fail_loopback(&self, fail: bool) {
        self.with_state(|s| s.fail_loopback = fail);
    }

    /// Make `route_stream` fail for this endpoint, in either direction.
    pub fn fail_route_stream(&self, endpoint: EndpointId, fail: bool) {
        self.with_state(|s| {
            if fail {
                s.fail_route_stream.insert(endpoint);
            } else {
                s.fail_route_stream.remove(&endpoint);
            }
        });
    }

    /// Clamp negotiated rates for an endpoint (codec cannot run faster).
    pub fn cap_rate(&self, endpoint: EndpointId, max_rate: u32) {
        self.with_state(|s| {
            s.rate_caps.insert(endpoint, max_rate);
        });
    }

    /// Block inside `open_endpoint` for this long (clock slew).
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.open_delay = delay);
    }

    pub fn set_voice_frequencies(&self, tx_hz: u32, rx_hz: u32) {
        self.with_state(|s| s.voice_frequencies = (tx_hz, rx_hz));
    }

    /// Copy of the call log in call order.
    pub fn calls(&self) -> Vec<HwCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    pub fn open_count(&self, endpoint: EndpointId) -> usize {
        self.count(|c| matches!(c, HwCall::Open { endpoint: e, .. } if *e == endpoint))
    }

    pub fn close_count(&self, endpoint: EndpointId) -> usize {
        self.count(|c| matches!(c, HwCall::Close { endpoint: e } if *e == endpoint))
    }

    /// Loopback calls with the given `enable` flag.
    pub fn loopback_count(&self, enable: bool) -> usize {
        self.count(|c| matches!(c, HwCall::Loopback { enable: e, .. } if *e == enable))
    }

    /// Stream routing calls for a session with the given `enable` flag.
    pub fn route_stream_count(&self, session: SessionId, enable: bool) -> usize {
        self.count(|c| {
            matches!(
                c,
                HwCall::RouteStream { session: s, enable: e, .. } if *s == session && *e == enable
            )
        })
    }

    pub fn count(&self, pred: impl Fn(&HwCall) -> bool) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| pred(c)).count())
    }
}

impl AudioHardware for SimulatedHardware {
    fn open_endpoint(&self, endpoint: EndpointId, sample_rate: u32) -> Result<u32, HwError> {
        let delay = self.with_state(|s| s.open_delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.with_state(|s| {
            s.calls.push(HwCall::Open {
                endpoint,
                rate: sample_rate,
            });
            if s.fail_open.contains(&endpoint) {
                return Err(HwError::new(format!("{endpoint} failed to power up")));
            }
            let rate = match s.rate_caps.get(&endpoint) {
                Some(cap) => sample_rate.min(*cap),
                None => sample_rate,
            };
            Ok(rate)
        })
    }

    fn close_endpoint(&self, endpoint: EndpointId) -> Result<(), HwError> {
        self.with_state(|s| {
            s.calls.push(HwCall::Close { endpoint });
            if s.fail_close.contains(&endpoint) {
                return Err(HwError::new(format!("{endpoint} failed to power down")));
            }
            Ok(())
        })
    }

    fn set_loopback(
        &self,
        enable: bool,
        dest: EndpointId,
        source: EndpointId,
    ) -> Result<(), HwError> {
        self.with_state(|s| {
            s.calls.push(HwCall::Loopback {
                enable,
                dest,
                source,
            });
            if s.fail_loopback {
                return Err(HwError::new("afe loopback command rejected"));
            }
            Ok(())
        })
    }

    fn route_stream(
        &self,
        class: ClientClass,
        session: SessionId,
        endpoint: EndpointId,
        enable: bool,
    ) -> Result<(), HwError> {
        self.with_state(|s| {
            s.calls.push(HwCall::RouteStream {
                class,
                session,
                endpoint,
                enable,
            });
            if s.fail_route_stream.contains(&endpoint) {
                return Err(HwError::new(format!("{class} session could not be assigned to {endpoint}")));
            }
            Ok(())
        })
    }

    fn set_stream_volume(&self, session: SessionId, level: u16) -> Result<(), HwError> {
        self.with_state(|s| {
            s.calls.push(HwCall::Volume { session, level });
            Ok(())
        })
    }

    fn endpoint_count(&self) -> usize {
        self.endpoint_count
    }

    fn voice_frequencies(&self) -> (u32, u32) {
        self.with_state(|s| s.voice_frequencies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_and_applies_rate_cap() {
        let hw = SimulatedHardware::new(4);
        hw.cap_rate(EndpointId(1), 16_000);
        assert_eq!(hw.open_endpoint(EndpointId(1), 48_000), Ok(16_000));
        assert_eq!(hw.open_endpoint(EndpointId(2), 48_000), Ok(48_000));
        assert_eq!(hw.open_count(EndpointId(1)), 1);
        assert_eq!(hw.calls().len(), 2);
    }

    #[test]
    fn injected_failures_are_still_logged() {
        let hw = SimulatedHardware::new(4);
        hw.fail_open(EndpointId(3), true);
        assert!(hw.open_endpoint(EndpointId(3), 8_000).is_err());
        assert_eq!(hw.open_count(EndpointId(3)), 1);

        hw.fail_open(EndpointId(3), false);
        assert!(hw.open_endpoint(EndpointId(3), 8_000).is_ok());
    }
}
