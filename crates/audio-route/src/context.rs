//! Explicitly owned routing context.
//!
//! Builds the registry, session tracker, bus, route controller and loopback
//! gate from a [`BoardSpec`] and is the single entry point for user requests
//! and hardware notifications. Everything is shared behind `Arc`, so a
//! `Context` can be driven from a user thread and any number of event threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use audio_route_types::{
    ClientClass, EndpointId, EventKind, RouteId, RouteState, RouteStatus, SessionId, SystemStatus,
};

use crate::config::{BoardSpec, RouteKindSpec};
use crate::error::{Result, RouteError};
use crate::events::{Event, EventBus, EventSubject};
use crate::hw::AudioHardware;
use crate::loopback::LoopbackGate;
use crate::registry::DeviceRegistry;
use crate::route::{MAX_VOLUME, RouteController, RouteKind};
use crate::sessions::SessionTracker;

pub struct Context {
    registry: Arc<DeviceRegistry>,
    tracker: SessionTracker,
    bus: Arc<EventBus>,
    routes: Arc<RouteController>,
    loopback: Option<Arc<LoopbackGate>>,
    shut_down: AtomicBool,
}

impl Context {
    pub fn new(board: &BoardSpec, hw: Arc<dyn AudioHardware>) -> Result<Self> {
        board.validate()?;
        let registry = Arc::new(DeviceRegistry::new(&board.endpoints, hw.clone())?);
        let tracker = SessionTracker::new(registry.clone());
        let bus = Arc::new(EventBus::new());

        let (loopbacks, streams): (Vec<_>, Vec<_>) = board
            .routes
            .iter()
            .cloned()
            .partition(|route| matches!(route.kind, RouteKindSpec::Loopback { .. }));

        let routes = Arc::new(RouteController::new(
            &streams,
            registry.clone(),
            tracker.clone(),
            hw.clone(),
            bus.clone(),
        )?);
        routes.register_listeners()?;

        let loopback = match loopbacks.first() {
            Some(spec) => {
                let gate = Arc::new(LoopbackGate::new(spec, registry.clone(), hw)?);
                gate.open(&bus)?;
                Some(gate)
            }
            None => None,
        };

        tracing::info!(
            endpoints = board.endpoints.len(),
            routes = streams.len(),
            loopback = loopback.is_some(),
            listeners = bus.listener_count(),
            "routing context ready"
        );
        Ok(Self {
            registry,
            tracker,
            bus,
            routes,
            loopback,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn gate_for(&self, route: RouteId) -> Option<&LoopbackGate> {
        self.loopback
            .as_deref()
            .filter(|gate| gate.route_id() == route)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RouteError::InvalidState(
                "routing context is shut down".to_string(),
            ));
        }
        Ok(())
    }

    pub fn start_route(&self, route: RouteId) -> Result<()> {
        self.ensure_running()?;
        match self.gate_for(route) {
            Some(gate) => gate.enable(),
            None => self.routes.start(route),
        }
    }

    pub fn stop_route(&self, route: RouteId) -> Result<()> {
        match self.gate_for(route) {
            Some(gate) => gate.disable(),
            None => self.routes.stop(route),
        }
    }

    pub fn set_route(&self, route: RouteId, endpoint: EndpointId, bound: bool) -> Result<()> {
        self.ensure_running()?;
        if self.gate_for(route).is_some() {
            return Err(RouteError::InvalidState(format!(
                "{route} is a loopback route; its endpoints are fixed"
            )));
        }
        self.routes.set_route(route, endpoint, bound)
    }

    pub fn session_id(&self, route: RouteId) -> Result<SessionId> {
        match self.gate_for(route) {
            Some(gate) => Ok(gate.session()),
            None => self.routes.session(route),
        }
    }

    pub fn route_state(&self, route: RouteId) -> Result<RouteState> {
        match self.gate_for(route) {
            Some(gate) => Ok(gate.state()),
            None => self.routes.state(route),
        }
    }

    /// Set the stream volume of a decoder session, `0..=16383`.
    pub fn set_volume(&self, session: SessionId, level: u32) -> Result<()> {
        self.ensure_running()?;
        let level = u16::try_from(level)
            .ok()
            .filter(|level| *level <= MAX_VOLUME)
            .ok_or(RouteError::OutOfRange {
                what: "volume",
                value: level,
                max: u32::from(MAX_VOLUME),
            })?;
        self.routes.set_volume(session, level)
    }

    /// Device power control.
    ///
    /// On: open at the negotiated rate, mark ready, announce `DeviceReady`.
    /// Off: announce `ReleasePending`, close, announce `DeviceReleased`.
    pub fn set_device(&self, endpoint: EndpointId, on: bool) -> Result<()> {
        self.ensure_running()?;
        let device = self.registry.find(endpoint)?;
        if on {
            let voice = self
                .routes
                .routes_for_endpoint(endpoint)
                .into_iter()
                .any(|id| matches!(self.routes.kind(id), Ok(RouteKind::Voice { .. })));
            let rate = self.registry.preferred_rate(endpoint, voice)?;
            self.registry.open(endpoint, rate)?;
            self.bus.publish_with(Event::device_ready(endpoint), || {
                self.registry.set_ready(endpoint, true).map(drop)
            })?;
            return Ok(());
        }

        if !device.open && !device.ready {
            return Ok(());
        }
        self.bus.publish(Event::release_pending(endpoint));
        let mut closed = Ok(());
        self.bus.publish_with(Event::device_released(endpoint), || {
            self.registry.set_ready(endpoint, false)?;
            closed = self.registry.close(endpoint);
            Ok(())
        })?;
        closed
    }

    /// Hardware-side ingress with raw values.
    ///
    /// Unknown kinds and unknown endpoints are logged and dropped; the return
    /// value is the number of handlers that ran.
    pub fn notify(&self, kind: u32, id: u32, payload: u32) -> Result<usize> {
        match Event::from_raw(kind, id, payload) {
            Ok(event) => self.publish(event),
            Err(err) => {
                tracing::warn!(kind = format_args!("{kind:#x}"), id, payload, error = %err, "hardware event ignored");
                Ok(0)
            }
        }
    }

    /// Typed ingress.
    ///
    /// Readiness is recorded in the registry under the subject's dispatch
    /// lock, so the registry and every listener see ready/released for one
    /// endpoint in the same order.
    pub fn publish(&self, event: Event) -> Result<usize> {
        if self.shut_down.load(Ordering::Acquire) {
            tracing::debug!(kind = ?event.kind, "event after shutdown ignored");
            return Ok(0);
        }
        if let EventSubject::Endpoint(endpoint) = event.subject {
            if !self.registry.contains(endpoint) {
                tracing::warn!(endpoint = %endpoint, kind = ?event.kind, "event for unknown endpoint ignored");
                return Ok(0);
            }
            let ready = match event.kind {
                EventKind::DeviceReady => Some(true),
                EventKind::DeviceReleased => Some(false),
                EventKind::RouteChanged => {
                    if let Err(err @ RouteError::AmbiguousRoute { .. }) =
                        self.routes.resolve_endpoint(endpoint)
                    {
                        return Err(err);
                    }
                    None
                }
                _ => None,
            };
            if let Some(ready) = ready {
                return self.bus.publish_with(event, || {
                    self.registry.set_ready(endpoint, ready).map(drop)
                });
            }
        }
        self.bus.publish_with(event, || Ok(()))
    }

    pub fn status(&self) -> SystemStatus {
        let mut routes = self.routes.snapshot();
        if let Some(gate) = self.loopback.as_deref() {
            let status = gate.status();
            routes.push(RouteStatus {
                id: gate.route_id(),
                name: gate.name().to_string(),
                kind: "loopback".to_string(),
                session: gate.session(),
                state: gate.state(),
                enabled: status.enabled,
                endpoints: std::iter::once(gate.source()).chain(status.dest).collect(),
                volume: None,
            });
            routes.sort_by_key(|route| route.id);
        }
        SystemStatus {
            endpoints: self.registry.snapshot(),
            routes,
            loopback: self.loopback.as_deref().map(LoopbackGate::status),
        }
    }

    /// Tear everything down: stop routes and the gate, drop listeners, close
    /// endpoints. Runs once; later calls return immediately.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err = self.routes.stop_all().err();
        if let Some(gate) = self.loopback.as_deref() {
            if let Err(err) = gate.release(&self.bus) {
                tracing::warn!(error = %err, "loopback release failed during shutdown");
                first_err.get_or_insert(err);
            }
        }
        self.routes.unregister_listeners();

        for endpoint in self.registry.ids() {
            let open = self.registry.find(endpoint).map(|ep| ep.open).unwrap_or(false);
            if !open {
                continue;
            }
            if let Err(err) = self.registry.close(endpoint) {
                tracing::warn!(endpoint = %endpoint, error = %err, "endpoint close failed during shutdown");
                first_err.get_or_insert(err);
            }
        }
        tracing::info!(listeners = self.bus.listener_count(), "routing context shut down");
        first_err.map_or(Ok(()), Err)
    }

    /// Bind a client class that is not driven by a configured route.
    pub fn bind_class(&self, endpoint: EndpointId, class: ClientClass) -> Result<()> {
        self.ensure_running()?;
        self.tracker.bind(endpoint, class)
    }

    /// Drop a class binding made with [`bind_class`](Self::bind_class).
    ///
    /// Classes owned by a route change through `set_route` instead. The last
    /// unbind closes the endpoint when no route references it.
    pub fn unbind_class(&self, endpoint: EndpointId, class: ClientClass) -> Result<()> {
        self.ensure_running()?;
        let routes = self.routes.routes_for_endpoint(endpoint);
        if let Some(owner) = routes
            .iter()
            .find(|id| matches!(self.routes.kind(**id), Ok(kind) if kind.class() == class))
        {
            return Err(RouteError::InvalidState(format!(
                "{class} on {endpoint} is bound through {owner}; use set_route"
            )));
        }
        let now_empty = self.tracker.unbind(endpoint, class)?;
        if now_empty && routes.is_empty() && self.registry.find(endpoint)?.open {
            self.registry.close(endpoint)?;
        }
        Ok(())
    }

    /// Client classes currently bound to `endpoint`.
    pub fn bound_classes(&self, endpoint: EndpointId) -> Result<Vec<ClientClass>> {
        Ok(self.tracker.session_mask(endpoint)?.classes())
    }
}
