//! AFE loopback gate.
//!
//! One hardware loopback path exists per board. The gate tracks exactly two
//! readiness flags and drives the path on when the user enabled it and both
//! ends are ready, off as soon as either condition goes away. A single mutex
//! guards the gate and is held across `set_loopback`.
//!
//! The gate has one client at a time: [`LoopbackGate::open`] claims it and
//! subscribes to readiness events, [`LoopbackGate::release`] breaks the path
//! and unsubscribes.

use std::sync::{Arc, Mutex, MutexGuard};

use audio_route_types::{ClientClass, EndpointId, EventKind, LoopbackStatus, RouteId, RouteState, SessionId};

use crate::config::{RouteKindSpec, RouteSpec};
use crate::error::{Result, RouteError};
use crate::events::{Event, EventBus, EventMask, Handler};
use crate::hw::AudioHardware;
use crate::registry::DeviceRegistry;

#[derive(Debug, Default)]
struct GateState {
    opened: bool,
    enabled: bool,
    running: bool,
    /// Current destination; fixed by config or adopted from the first ready RX endpoint.
    dest: Option<EndpointId>,
    source_ready: bool,
    dest_ready: bool,
}

pub struct LoopbackGate {
    route: RouteId,
    name: String,
    session: SessionId,
    source: EndpointId,
    fixed_dest: Option<EndpointId>,
    registry: Arc<DeviceRegistry>,
    hw: Arc<dyn AudioHardware>,
    state: Mutex<GateState>,
}

impl LoopbackGate {
    pub fn new(
        spec: &RouteSpec,
        registry: Arc<DeviceRegistry>,
        hw: Arc<dyn AudioHardware>,
    ) -> Result<Self> {
        let RouteKindSpec::Loopback { source, dest } = spec.kind else {
            return Err(RouteError::InvalidConfig(format!(
                "route '{}' is not a loopback route",
                spec.name
            )));
        };
        if !registry.contains(source) {
            return Err(RouteError::endpoint_not_found(source));
        }
        if let Some(dest) = dest {
            if !registry.capability(dest)?.supports_rx() {
                return Err(RouteError::CapabilityMismatch {
                    endpoint: dest,
                    required: "rx",
                });
            }
        }
        Ok(Self {
            route: spec.id,
            name: spec.name.clone(),
            session: spec.session,
            source,
            fixed_dest: dest,
            registry,
            hw,
            state: Mutex::new(GateState {
                dest,
                ..GateState::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn route_id(&self) -> RouteId {
        self.route
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn source(&self) -> EndpointId {
        self.source
    }

    /// Claim the gate and subscribe it to readiness events.
    ///
    /// A second open before [`release`](Self::release) is refused. Readiness
    /// of the configured ends is taken from the registry.
    pub fn open(self: &Arc<Self>, bus: &EventBus) -> Result<()> {
        let mut state = self.lock();
        if state.opened {
            return Err(RouteError::InvalidState(format!(
                "{} loopback is already open",
                self.route
            )));
        }
        bus.register(
            ClientClass::Decoder,
            self.session,
            EventMask::READINESS,
            Handler::Loopback(Arc::downgrade(self)),
        )?;
        *state = GateState {
            opened: true,
            dest: self.fixed_dest,
            source_ready: self.registry.is_ready(self.source)?,
            dest_ready: match self.fixed_dest {
                Some(dest) => self.registry.is_ready(dest)?,
                None => false,
            },
            ..GateState::default()
        };
        tracing::info!(route = %self.route, session = %self.session, "loopback opened");
        Ok(())
    }

    /// Unsubscribe, break a running path and give the gate up.
    pub fn release(&self, bus: &EventBus) -> Result<()> {
        let mut state = self.lock();
        if !state.opened {
            return Ok(());
        }
        bus.unregister(ClientClass::Decoder, self.session);
        state.enabled = false;
        let result = self.apply(&mut state);
        state.opened = false;
        tracing::info!(route = %self.route, "loopback released");
        result
    }

    /// User enable. Enabling twice is success.
    pub fn enable(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.opened {
            return Err(RouteError::InvalidState(format!(
                "{} loopback is not open",
                self.route
            )));
        }
        if state.enabled {
            return Ok(());
        }
        state.enabled = true;
        tracing::info!(route = %self.route, source = %self.source, dest = ?state.dest, "loopback enabled");
        self.apply(&mut state)
    }

    /// User disable. Breaks the path if it is running.
    pub fn disable(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.enabled && !state.running {
            return Ok(());
        }
        state.enabled = false;
        tracing::info!(route = %self.route, "loopback disabled");
        self.apply(&mut state)
    }

    pub(crate) fn handle_event(&self, event: &Event) {
        let Some(endpoint) = event.endpoint_id() else {
            return;
        };
        let result = match event.kind {
            EventKind::DeviceReady => self.on_ready(endpoint),
            EventKind::DeviceReleased => self.on_released(endpoint),
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::warn!(route = %self.route, endpoint = %endpoint, kind = ?event.kind, error = %err, "loopback update failed");
        }
    }

    pub fn on_ready(&self, endpoint: EndpointId) -> Result<()> {
        let mut state = self.lock();
        if endpoint == self.source {
            state.source_ready = true;
        } else if state.dest == Some(endpoint) {
            state.dest_ready = true;
        } else if state.dest.is_none() && self.fixed_dest.is_none() {
            if self.registry.capability(endpoint)?.supports_rx() {
                tracing::debug!(route = %self.route, dest = %endpoint, "loopback destination adopted");
                state.dest = Some(endpoint);
                state.dest_ready = true;
            }
        } else {
            return Ok(());
        }
        self.apply(&mut state)
    }

    pub fn on_released(&self, endpoint: EndpointId) -> Result<()> {
        let mut state = self.lock();
        if endpoint == self.source {
            state.source_ready = false;
        } else if state.dest == Some(endpoint) {
            state.dest_ready = false;
        } else {
            return Ok(());
        }
        let result = self.apply(&mut state);
        if self.fixed_dest.is_none() && state.dest == Some(endpoint) {
            state.dest = None;
        }
        result
    }

    /// Drive hardware to match the flags. Caller holds the gate lock.
    fn apply(&self, state: &mut GateState) -> Result<()> {
        let wanted = state.enabled && state.source_ready && state.dest_ready;
        match (wanted, state.running, state.dest) {
            (true, false, Some(dest)) => {
                if let Err(err) = self.hw.set_loopback(true, dest, self.source) {
                    state.enabled = false;
                    tracing::warn!(route = %self.route, error = %err, "loopback enable failed; closed");
                    return Err(RouteError::hardware("loopback enable", err));
                }
                state.running = true;
                tracing::info!(route = %self.route, dest = %dest, source = %self.source, "loopback running");
            }
            (false, true, Some(dest)) => {
                state.running = false;
                let result = self.hw.set_loopback(false, dest, self.source);
                tracing::info!(route = %self.route, dest = %dest, source = %self.source, "loopback stopped");
                result.map_err(|err| RouteError::hardware("loopback disable", err))?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn state(&self) -> RouteState {
        let state = self.lock();
        match (state.running, state.enabled) {
            (true, _) => RouteState::Open,
            (false, true) => RouteState::Opening,
            (false, false) => RouteState::Closed,
        }
    }

    pub fn status(&self) -> LoopbackStatus {
        let state = self.lock();
        LoopbackStatus {
            open: state.opened,
            enabled: state.enabled,
            running: state.running,
            source: Some(self.source),
            dest: state.dest,
            source_ready: state.source_ready,
            dest_ready: state.dest_ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointSpec;
    use crate::hw::sim::{HwCall, SimulatedHardware};
    use audio_route_types::Capability;

    const A: EndpointId = EndpointId(0);
    const B: EndpointId = EndpointId(1);
    const C: EndpointId = EndpointId(2);

    fn build(
        dest: Option<EndpointId>,
    ) -> (Arc<SimulatedHardware>, Arc<DeviceRegistry>, Arc<LoopbackGate>) {
        let hw = Arc::new(SimulatedHardware::new(4));
        let specs: Vec<EndpointSpec> = [(A, Capability::Rx), (B, Capability::Tx), (C, Capability::Rx)]
            .into_iter()
            .map(|(id, capability)| EndpointSpec {
                id,
                name: format!("dev{}", id.0),
                capability,
                sample_rate: 48_000,
            })
            .collect();
        let registry = Arc::new(DeviceRegistry::new(&specs, hw.clone()).expect("registry"));
        let spec = RouteSpec {
            id: RouteId(9),
            name: "fm".to_string(),
            session: crate::config::FM_SESSION_ID,
            kind: RouteKindSpec::Loopback { source: B, dest },
        };
        let gate = LoopbackGate::new(&spec, registry.clone(), hw.clone()).expect("gate");
        (hw, registry, Arc::new(gate))
    }

    fn gate_with(dest: Option<EndpointId>) -> (Arc<SimulatedHardware>, Arc<LoopbackGate>) {
        let (hw, _registry, gate) = build(dest);
        gate.open(&EventBus::new()).expect("open");
        (hw, gate)
    }

    #[test]
    fn enables_once_when_both_ends_ready() {
        let (hw, gate) = gate_with(None);
        gate.enable().expect("enable");
        gate.on_ready(B).expect("source");
        assert_eq!(hw.loopback_count(true), 0);
        gate.on_ready(A).expect("dest");
        gate.on_ready(A).expect("dest again");

        assert_eq!(
            hw.calls(),
            vec![HwCall::Loopback {
                enable: true,
                dest: A,
                source: B
            }]
        );
        assert_eq!(gate.state(), RouteState::Open);
    }

    #[test]
    fn dest_alone_never_enables() {
        let (hw, gate) = gate_with(None);
        gate.enable().expect("enable");
        gate.on_ready(A).expect("dest");
        gate.on_ready(C).expect("other rx");
        assert_eq!(hw.loopback_count(true), 0);
        assert_eq!(gate.state(), RouteState::Opening);
        assert_eq!(gate.status().dest, Some(A));
    }

    #[test]
    fn release_stops_and_waits_for_resume() {
        let (hw, gate) = gate_with(None);
        gate.enable().expect("enable");
        gate.on_ready(B).expect("source");
        gate.on_ready(A).expect("dest");

        gate.on_released(A).expect("release dest");
        assert_eq!(hw.loopback_count(false), 1);
        assert_eq!(gate.state(), RouteState::Opening);
        assert_eq!(gate.status().dest, None);

        gate.on_ready(C).expect("new dest");
        assert!(hw.calls().contains(&HwCall::Loopback {
            enable: true,
            dest: C,
            source: B
        }));
        assert_eq!(hw.loopback_count(true) - hw.loopback_count(false), 1);
    }

    #[test]
    fn fixed_dest_ignores_other_rx_endpoints() {
        let (hw, gate) = gate_with(Some(C));
        gate.enable().expect("enable");
        gate.on_ready(B).expect("source");
        gate.on_ready(A).expect("unrelated rx");
        assert_eq!(hw.loopback_count(true), 0);
        gate.on_ready(C).expect("dest");
        assert_eq!(hw.loopback_count(true), 1);

        gate.on_released(C).expect("dest gone");
        assert_eq!(gate.status().dest, Some(C));
    }

    #[test]
    fn user_disable_breaks_running_path() {
        let (hw, gate) = gate_with(None);
        gate.on_ready(B).expect("source");
        gate.on_ready(A).expect("dest");
        assert_eq!(hw.loopback_count(true), 0);

        gate.enable().expect("enable");
        gate.disable().expect("disable");
        gate.disable().expect("disable again");
        assert_eq!(hw.loopback_count(true), 1);
        assert_eq!(hw.loopback_count(false), 1);
        assert_eq!(gate.state(), RouteState::Closed);
    }

    #[test]
    fn enable_failure_leaves_gate_closed() {
        let (hw, gate) = gate_with(None);
        gate.on_ready(B).expect("source");
        gate.on_ready(A).expect("dest");
        hw.fail_loopback(true);
        assert!(gate.enable().is_err());
        assert_eq!(gate.state(), RouteState::Closed);
        assert!(!gate.status().running);
    }

    #[test]
    fn rejects_non_rx_fixed_destination() {
        let hw = Arc::new(SimulatedHardware::new(4));
        let registry = Arc::new(
            DeviceRegistry::new(
                &[EndpointSpec {
                    id: B,
                    name: "fm".to_string(),
                    capability: Capability::Tx,
                    sample_rate: 48_000,
                }],
                hw.clone(),
            )
            .expect("registry"),
        );
        let spec = RouteSpec {
            id: RouteId(1),
            name: "fm".to_string(),
            session: SessionId(10),
            kind: RouteKindSpec::Loopback { source: B, dest: Some(B) },
        };
        assert!(LoopbackGate::new(&spec, registry, hw).is_err());
    }

    #[test]
    fn single_client_and_release_tears_down() {
        let (hw, registry, gate) = build(None);
        let bus = EventBus::new();
        assert!(matches!(gate.enable(), Err(RouteError::InvalidState(_))));

        registry.set_ready(B, true).expect("source ready");
        gate.open(&bus).expect("open");
        assert!(matches!(gate.open(&bus), Err(RouteError::InvalidState(_))));
        assert!(bus.is_registered(ClientClass::Decoder, gate.session()));
        assert!(gate.status().source_ready);

        gate.enable().expect("enable");
        gate.on_ready(A).expect("dest");
        assert_eq!(gate.state(), RouteState::Open);

        gate.release(&bus).expect("release");
        assert!(!gate.status().open);
        assert!(!bus.is_registered(ClientClass::Decoder, gate.session()));
        assert_eq!(hw.loopback_count(false), 1);
        assert_eq!(gate.state(), RouteState::Closed);

        gate.open(&bus).expect("open again");
        assert_eq!(gate.status().dest, None);
        assert!(!gate.status().enabled);
    }
}
