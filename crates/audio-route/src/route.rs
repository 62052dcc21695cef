//! Route controller: per-route readiness state machine.
//!
//! Every route has two locks. `op` serializes start/stop/set-route and event
//! handling for that route and is held across its hardware calls, so a `stop`
//! issued while a `start` is blocked in an endpoint open simply runs after it.
//! `data` guards the `{kind, state, enabled, volume}` tuple and is only held
//! for short reads and writes. Lock order is route, then registry.
//!
//! `Opening` is the persisted "enabled, waiting for dependencies" state;
//! `Closing` never outlives a single call.
//!
//! An open route holds each of its endpoints in the registry and drops the
//! hold whenever it leaves `Open`, so an endpoint no running route needs is
//! powered down unless device control pinned it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use audio_route_types::{
    Capability, ClientClass, EndpointId, EventKind, RouteId, RouteState, RouteStatus, SessionId,
};

use crate::config::{RouteKindSpec, RouteSpec};
use crate::error::{Result, RouteError};
use crate::events::{Event, EventBus, EventMask, EventPayload, Handler};
use crate::hw::AudioHardware;
use crate::registry::DeviceRegistry;
use crate::sessions::SessionTracker;

/// Highest stream volume the DSP accepts.
pub const MAX_VOLUME: u16 = 16_383;

/// Endpoint bindings of a non-loopback route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
    Playback { endpoint: Option<EndpointId> },
    Record { endpoint: Option<EndpointId> },
    Voice {
        rx: Option<EndpointId>,
        tx: Option<EndpointId>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Stream,
    Rx,
    Tx,
}

impl RouteKind {
    pub fn class(&self) -> ClientClass {
        match self {
            RouteKind::Playback { .. } => ClientClass::Decoder,
            RouteKind::Record { .. } => ClientClass::Encoder,
            RouteKind::Voice { .. } => ClientClass::Voice,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RouteKind::Playback { .. } => "playback",
            RouteKind::Record { .. } => "record",
            RouteKind::Voice { .. } => "voice",
        }
    }

    /// Bound endpoints, RX before TX for voice.
    pub fn endpoints(&self) -> Vec<EndpointId> {
        match *self {
            RouteKind::Playback { endpoint } | RouteKind::Record { endpoint } => {
                endpoint.into_iter().collect()
            }
            RouteKind::Voice { rx, tx } => rx.into_iter().chain(tx).collect(),
        }
    }

    pub fn contains(&self, endpoint: EndpointId) -> bool {
        self.endpoints().contains(&endpoint)
    }

    /// Every slot the route needs is bound.
    fn is_complete(&self) -> bool {
        match self {
            RouteKind::Playback { endpoint } | RouteKind::Record { endpoint } => endpoint.is_some(),
            RouteKind::Voice { rx, tx } => rx.is_some() && tx.is_some(),
        }
    }

    fn slot_for(&self, route: RouteId, endpoint: EndpointId, capability: Capability) -> Result<Slot> {
        match self {
            RouteKind::Playback { .. } if capability.supports_rx() => Ok(Slot::Stream),
            RouteKind::Playback { .. } => Err(RouteError::CapabilityMismatch {
                endpoint,
                required: "rx",
            }),
            RouteKind::Record { .. } if capability.supports_tx() => Ok(Slot::Stream),
            RouteKind::Record { .. } => Err(RouteError::CapabilityMismatch {
                endpoint,
                required: "tx",
            }),
            RouteKind::Voice { .. } => match capability {
                Capability::Rx => Ok(Slot::Rx),
                Capability::Tx => Ok(Slot::Tx),
                Capability::Duplex => Err(RouteError::AmbiguousRoute {
                    endpoint,
                    candidates: vec![route],
                }),
            },
        }
    }

    fn bound_slot(&self, endpoint: EndpointId) -> Option<Slot> {
        match *self {
            RouteKind::Playback { endpoint: ep } | RouteKind::Record { endpoint: ep } => {
                (ep == Some(endpoint)).then_some(Slot::Stream)
            }
            RouteKind::Voice { rx, tx } => {
                if rx == Some(endpoint) {
                    Some(Slot::Rx)
                } else if tx == Some(endpoint) {
                    Some(Slot::Tx)
                } else {
                    None
                }
            }
        }
    }

    fn slot(&self, slot: Slot) -> Option<EndpointId> {
        match (*self, slot) {
            (RouteKind::Playback { endpoint } | RouteKind::Record { endpoint }, _) => endpoint,
            (RouteKind::Voice { rx, .. }, Slot::Rx) => rx,
            (RouteKind::Voice { tx, .. }, _) => tx,
        }
    }

    fn with_slot(self, slot: Slot, value: Option<EndpointId>) -> Self {
        match (self, slot) {
            (RouteKind::Playback { .. }, _) => RouteKind::Playback { endpoint: value },
            (RouteKind::Record { .. }, _) => RouteKind::Record { endpoint: value },
            (RouteKind::Voice { tx, .. }, Slot::Rx) => RouteKind::Voice { rx: value, tx },
            (RouteKind::Voice { rx, .. }, _) => RouteKind::Voice { rx, tx: value },
        }
    }

    fn from_spec(spec: &RouteSpec) -> Result<Self> {
        match spec.kind {
            RouteKindSpec::Playback { endpoint } => Ok(RouteKind::Playback { endpoint }),
            RouteKindSpec::Record { endpoint } => Ok(RouteKind::Record { endpoint }),
            RouteKindSpec::Voice { rx, tx } => Ok(RouteKind::Voice { rx, tx }),
            RouteKindSpec::Loopback { .. } => Err(RouteError::InvalidConfig(format!(
                "route '{}' is a loopback route; it belongs to the loopback gate",
                spec.name
            ))),
        }
    }
}

#[derive(Debug)]
struct RouteData {
    kind: RouteKind,
    state: RouteState,
    enabled: bool,
    volume: Option<u16>,
}

struct Route {
    id: RouteId,
    name: String,
    session: SessionId,
    op: Mutex<()>,
    data: Mutex<RouteData>,
}

impl Route {
    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.op.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn data(&self) -> MutexGuard<'_, RouteData> {
        self.data.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn status(&self) -> RouteStatus {
        let data = self.data();
        RouteStatus {
            id: self.id,
            name: self.name.clone(),
            kind: data.kind.name().to_string(),
            session: self.session,
            state: data.state,
            enabled: data.enabled,
            endpoints: data.kind.endpoints(),
            volume: data.volume,
        }
    }
}

pub struct RouteController {
    routes: BTreeMap<RouteId, Route>,
    registry: Arc<DeviceRegistry>,
    tracker: SessionTracker,
    hw: Arc<dyn AudioHardware>,
    bus: Arc<EventBus>,
}

impl RouteController {
    /// Build routes from configuration and bind their configured endpoints.
    pub fn new(
        specs: &[RouteSpec],
        registry: Arc<DeviceRegistry>,
        tracker: SessionTracker,
        hw: Arc<dyn AudioHardware>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let mut routes = BTreeMap::new();
        for spec in specs {
            let kind = RouteKind::from_spec(spec)?;
            for endpoint in kind.endpoints() {
                tracker.bind_stream(endpoint, kind.class(), spec.session)?;
            }
            let route = Route {
                id: spec.id,
                name: spec.name.clone(),
                session: spec.session,
                op: Mutex::new(()),
                data: Mutex::new(RouteData {
                    kind,
                    state: RouteState::Closed,
                    enabled: false,
                    volume: None,
                }),
            };
            if routes.insert(spec.id, route).is_some() {
                return Err(RouteError::InvalidConfig(format!(
                    "duplicate route id {}",
                    spec.id.0
                )));
            }
        }
        Ok(Self {
            routes,
            registry,
            tracker,
            hw,
            bus,
        })
    }

    /// Subscribe every route to the events that can change its readiness.
    pub fn register_listeners(self: &Arc<Self>) -> Result<()> {
        for route in self.routes.values() {
            let class = route.data().kind.class();
            let mut mask = EventMask::READINESS.with(EventKind::RouteChanged);
            if class == ClientClass::Decoder {
                mask = mask.with(EventKind::VolumeChanged);
            }
            self.bus.register(
                class,
                route.session,
                mask,
                Handler::Route {
                    controller: Arc::downgrade(self),
                    route: route.id,
                },
            )?;
        }
        Ok(())
    }

    pub fn unregister_listeners(&self) {
        for route in self.routes.values() {
            let class = route.data().kind.class();
            self.bus.unregister(class, route.session);
        }
    }

    fn route(&self, id: RouteId) -> Result<&Route> {
        self.routes
            .get(&id)
            .ok_or_else(|| RouteError::route_not_found(id))
    }

    pub fn ids(&self) -> Vec<RouteId> {
        self.routes.keys().copied().collect()
    }

    pub fn session(&self, id: RouteId) -> Result<SessionId> {
        Ok(self.route(id)?.session)
    }

    pub fn state(&self, id: RouteId) -> Result<RouteState> {
        Ok(self.route(id)?.data().state)
    }

    pub fn kind(&self, id: RouteId) -> Result<RouteKind> {
        Ok(self.route(id)?.data().kind)
    }

    /// Routes currently bound to `endpoint`.
    pub fn routes_for_endpoint(&self, endpoint: EndpointId) -> Vec<RouteId> {
        self.routes
            .values()
            .filter(|route| route.data().kind.contains(endpoint))
            .map(|route| route.id)
            .collect()
    }

    /// The single route bound to `endpoint`; more than one is an error.
    pub fn resolve_endpoint(&self, endpoint: EndpointId) -> Result<RouteId> {
        let candidates = self.routes_for_endpoint(endpoint);
        match candidates.as_slice() {
            [] => Err(RouteError::NotFound {
                what: "route for endpoint",
                id: u32::from(endpoint.0),
            }),
            [only] => Ok(*only),
            _ => Err(RouteError::AmbiguousRoute {
                endpoint,
                candidates,
            }),
        }
    }

    /// Enable a route. Already enabled is success.
    pub fn start(&self, id: RouteId) -> Result<()> {
        let route = self.route(id)?;
        let _op = route.serialize();
        {
            let mut data = route.data();
            if data.enabled {
                tracing::debug!(route = %id, state = ?data.state, "route already started");
                return Ok(());
            }
            data.enabled = true;
            data.state = RouteState::Opening;
        }
        tracing::info!(route = %id, name = %route.name, "route started");
        self.reconcile(route)
    }

    /// Disable a route from any state. Stopping a closed route is a no-op.
    pub fn stop(&self, id: RouteId) -> Result<()> {
        let route = self.route(id)?;
        let _op = route.serialize();
        let (kind, was_open) = {
            let mut data = route.data();
            if !data.enabled && data.state == RouteState::Closed {
                return Ok(());
            }
            data.enabled = false;
            (data.kind, data.state == RouteState::Open)
        };
        let result = if was_open {
            tracing::trace!(route = %id, state = ?RouteState::Closing, "route transition");
            self.disable_hw(route, &kind)
        } else {
            Ok(())
        };
        route.data().state = RouteState::Closed;
        tracing::info!(route = %id, name = %route.name, "route stopped");
        result
    }

    /// Stop every route; all are attempted and the first error is returned.
    pub fn stop_all(&self) -> Result<()> {
        let mut first_err = None;
        for id in self.ids() {
            if let Err(err) = self.stop(id) {
                tracing::warn!(route = %id, error = %err, "route stop failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Bind or unbind `endpoint` on a route.
    ///
    /// A running route is torn down first and re-evaluated with the new
    /// binding. Unbinding the last stream from an endpoint that no other route
    /// references closes it.
    pub fn set_route(&self, id: RouteId, endpoint: EndpointId, bound: bool) -> Result<()> {
        let route = self.route(id)?;
        let capability = self.registry.capability(endpoint)?;

        let event = {
            let _op = route.serialize();
            let (kind, state, enabled) = {
                let data = route.data();
                (data.kind, data.state, data.enabled)
            };
            let class = kind.class();

            let (slot, previous) = if bound {
                let slot = kind.slot_for(id, endpoint, capability)?;
                let previous = kind.slot(slot);
                if previous == Some(endpoint) {
                    return Ok(());
                }
                (slot, previous)
            } else {
                match kind.bound_slot(endpoint) {
                    Some(slot) => (slot, Some(endpoint)),
                    None => return Ok(()),
                }
            };

            let teardown = if state == RouteState::Open {
                self.disable_hw(route, &kind)
            } else {
                Ok(())
            };
            {
                let mut data = route.data();
                data.kind = kind.with_slot(slot, bound.then_some(endpoint));
                if enabled {
                    data.state = RouteState::Opening;
                }
            }
            if bound {
                self.tracker.bind_stream(endpoint, class, route.session)?;
            }
            if let Some(previous) = previous {
                self.release_binding(previous, class, route.session)?;
            }
            teardown?;
            tracing::info!(route = %id, endpoint = %endpoint, bound, "route binding changed");
            if enabled {
                self.reconcile(route)?;
            }

            match (class, bound) {
                (ClientClass::Voice, false) => Some(Event::voice_device_changed(endpoint)),
                (ClientClass::Voice, true) => None,
                _ => Some(Event::route_changed(endpoint)),
            }
        };

        if let Some(event) = event {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Store a stream volume for a decoder session and announce it.
    pub fn set_volume(&self, session: SessionId, level: u16) -> Result<()> {
        if level > MAX_VOLUME {
            return Err(RouteError::OutOfRange {
                what: "volume",
                value: u32::from(level),
                max: u32::from(MAX_VOLUME),
            });
        }
        let route = self
            .routes
            .values()
            .find(|route| {
                route.session == session && route.data().kind.class() == ClientClass::Decoder
            })
            .ok_or_else(|| RouteError::session_not_found(session))?;
        route.data().volume = Some(level);
        tracing::debug!(route = %route.id, session = %session, level, "volume set");
        self.bus.publish(Event::volume_changed(session, level));
        Ok(())
    }

    pub(crate) fn handle_event(&self, id: RouteId, event: &Event) {
        let Ok(route) = self.route(id) else {
            return;
        };
        match event.kind {
            EventKind::VolumeChanged => {
                if let EventPayload::Volume(level) = event.payload {
                    self.apply_volume(route, level);
                }
            }
            EventKind::DeviceReady | EventKind::DeviceReleased | EventKind::RouteChanged => {
                let Some(endpoint) = event.endpoint_id() else {
                    return;
                };
                let _op = route.serialize();
                if !route.data().kind.contains(endpoint) {
                    return;
                }
                if let Err(err) = self.reconcile(route) {
                    tracing::warn!(route = %id, endpoint = %endpoint, kind = ?event.kind, error = %err, "route update failed");
                }
            }
            EventKind::ReleasePending | EventKind::VoiceDeviceChanged => {}
        }
    }

    pub fn snapshot(&self) -> Vec<RouteStatus> {
        self.routes.values().map(Route::status).collect()
    }

    fn dependencies_ready(&self, kind: &RouteKind) -> bool {
        kind.is_complete()
            && kind
                .endpoints()
                .into_iter()
                .all(|ep| self.registry.is_ready(ep).unwrap_or(false))
    }

    /// Move an enabled route toward the state its dependencies allow.
    /// Caller holds the route's `op` lock.
    fn reconcile(&self, route: &Route) -> Result<()> {
        let (kind, state, enabled, volume) = {
            let data = route.data();
            (data.kind, data.state, data.enabled, data.volume)
        };
        if !enabled {
            return Ok(());
        }
        let ready = self.dependencies_ready(&kind);
        match (state, ready) {
            (RouteState::Opening, true) => {
                if let Err(err) = self.enable_hw(route, &kind, volume) {
                    let mut data = route.data();
                    data.state = RouteState::Closed;
                    data.enabled = false;
                    tracing::warn!(route = %route.id, error = %err, "route open failed; closed");
                    return Err(err);
                }
                route.data().state = RouteState::Open;
                tracing::info!(route = %route.id, name = %route.name, endpoints = ?kind.endpoints(), "route open");
            }
            (RouteState::Open, false) => {
                tracing::trace!(route = %route.id, state = ?RouteState::Closing, "route transition");
                let result = self.disable_hw(route, &kind);
                route.data().state = RouteState::Opening;
                tracing::info!(route = %route.id, name = %route.name, "dependency lost; route pending");
                result?;
            }
            _ => {}
        }
        Ok(())
    }

    fn enable_hw(&self, route: &Route, kind: &RouteKind, volume: Option<u16>) -> Result<()> {
        let class = kind.class();
        let mut acquired = Vec::new();
        if let Err(err) = self.acquire_endpoints(route, kind, &mut acquired) {
            self.rollback(route, class, &acquired, &[]);
            return Err(err);
        }

        let mut routed = Vec::with_capacity(acquired.len());
        for &endpoint in &acquired {
            if let Err(err) = self.hw.route_stream(class, route.session, endpoint, true) {
                self.rollback(route, class, &acquired, &routed);
                return Err(RouteError::hardware("route stream", err));
            }
            routed.push(endpoint);
        }

        if class == ClientClass::Decoder {
            if let Some(level) = volume {
                if let Err(err) = self.hw.set_stream_volume(route.session, level) {
                    tracing::warn!(route = %route.id, level, error = %err, "volume not applied");
                }
            }
        }
        Ok(())
    }

    fn acquire_endpoints(
        &self,
        route: &Route,
        kind: &RouteKind,
        acquired: &mut Vec<EndpointId>,
    ) -> Result<()> {
        let class = kind.class();
        let voice = class == ClientClass::Voice;
        for endpoint in kind.endpoints() {
            let rate = self.registry.preferred_rate(endpoint, voice)?;
            self.registry.acquire(endpoint, rate, route.id)?;
            acquired.push(endpoint);
            self.tracker.bind_stream(endpoint, class, route.session)?;
        }
        Ok(())
    }

    /// Undo a partial enable. Failures here are logged; the original error wins.
    fn rollback(
        &self,
        route: &Route,
        class: ClientClass,
        acquired: &[EndpointId],
        routed: &[EndpointId],
    ) {
        for &endpoint in routed {
            if let Err(err) = self.hw.route_stream(class, route.session, endpoint, false) {
                tracing::warn!(route = %route.id, endpoint = %endpoint, error = %err, "rollback failed");
            }
        }
        for &endpoint in acquired {
            if let Err(err) = self.registry.release(endpoint, route.id) {
                tracing::warn!(route = %route.id, endpoint = %endpoint, error = %err, "rollback release failed");
            }
        }
    }

    fn disable_hw(&self, route: &Route, kind: &RouteKind) -> Result<()> {
        let class = kind.class();
        let endpoints = kind.endpoints();
        let mut first_err = None;
        for &endpoint in &endpoints {
            if let Err(err) = self.hw.route_stream(class, route.session, endpoint, false) {
                tracing::warn!(route = %route.id, endpoint = %endpoint, error = %err, "route stream disable failed");
                first_err.get_or_insert(RouteError::hardware("route stream", err));
            }
        }
        for &endpoint in &endpoints {
            if let Err(err) = self.registry.release(endpoint, route.id) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Drop one stream slot after a route let go of `endpoint`.
    ///
    /// Routes of the same class still bound there keep their slots. The
    /// endpoint is closed only once no route references it and its mask is empty.
    fn release_binding(
        &self,
        endpoint: EndpointId,
        class: ClientClass,
        session: SessionId,
    ) -> Result<()> {
        let remaining = self.routes_for_endpoint(endpoint);
        let now_empty = self.tracker.unbind_stream(endpoint, class, session)?;
        for id in &remaining {
            let Some(other) = self.routes.get(id) else {
                continue;
            };
            if other.data().kind.class() == class {
                self.tracker.bind_stream(endpoint, class, other.session)?;
            }
        }
        if remaining.is_empty() && now_empty && self.registry.find(endpoint)?.open {
            self.registry.close(endpoint)?;
        }
        Ok(())
    }

    fn apply_volume(&self, route: &Route, level: u16) {
        let _op = route.serialize();
        if route.data().state != RouteState::Open {
            return;
        }
        if let Err(err) = self.hw.set_stream_volume(route.session, level) {
            tracing::warn!(route = %route.id, level, error = %err, "volume not applied");
        }
    }
}
