//! Readiness event bus.
//!
//! Listeners are keyed by `(ClientClass, SessionId)` and carry one of a closed
//! set of handler variants. Dispatch is synchronous: [`EventBus::publish`]
//! returns after every matching handler ran, in registration order, on the
//! publishing thread.
//!
//! Events about the same subject are dispatched one at a time (per-subject
//! dispatch lock), so a release followed by a ready for one endpoint is never
//! interleaved or reordered. [`EventBus::publish_with`] runs a state update
//! under that same lock, making the update and its dispatch one step.
//!
//! The listener table lock is dropped before handlers run; handlers may
//! register/unregister or call into the controllers. A handler publishing
//! about the subject it is handling is refused instead of deadlocking.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use audio_route_types::{ClientClass, EndpointId, EventKind, RouteId, SessionId};

use crate::error::{Result, RouteError};
use crate::loopback::LoopbackGate;
use crate::route::{MAX_VOLUME, RouteController};

/// What an event is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventSubject {
    Endpoint(EndpointId),
    Session(SessionId),
}

/// Extra data carried by an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EventPayload {
    #[default]
    None,
    /// Stream volume (0..=16383).
    Volume(u16),
    /// Opaque value from the hardware side.
    Raw(u32),
}

/// Immutable readiness notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub subject: EventSubject,
    pub payload: EventPayload,
}

impl Event {
    fn endpoint(kind: EventKind, endpoint: EndpointId) -> Self {
        Self {
            kind,
            subject: EventSubject::Endpoint(endpoint),
            payload: EventPayload::None,
        }
    }

    pub fn device_ready(endpoint: EndpointId) -> Self {
        Self::endpoint(EventKind::DeviceReady, endpoint)
    }

    pub fn device_released(endpoint: EndpointId) -> Self {
        Self::endpoint(EventKind::DeviceReleased, endpoint)
    }

    pub fn release_pending(endpoint: EndpointId) -> Self {
        Self::endpoint(EventKind::ReleasePending, endpoint)
    }

    pub fn route_changed(endpoint: EndpointId) -> Self {
        Self::endpoint(EventKind::RouteChanged, endpoint)
    }

    pub fn voice_device_changed(endpoint: EndpointId) -> Self {
        Self::endpoint(EventKind::VoiceDeviceChanged, endpoint)
    }

    pub fn volume_changed(session: SessionId, level: u16) -> Self {
        Self {
            kind: EventKind::VolumeChanged,
            subject: EventSubject::Session(session),
            payload: EventPayload::Volume(level),
        }
    }

    /// Decode a raw notification from the hardware side.
    ///
    /// `id` is a session id for volume events and an endpoint id otherwise.
    pub fn from_raw(kind: u32, id: u32, payload: u32) -> Result<Self> {
        let kind = EventKind::try_from(kind)
            .map_err(|raw| RouteError::InvalidState(format!("unknown event kind {raw:#x}")))?;
        let id = u16::try_from(id).map_err(|_| RouteError::OutOfRange {
            what: "event subject id",
            value: id,
            max: u32::from(u16::MAX),
        })?;
        let event = match kind {
            EventKind::VolumeChanged => {
                let level = u16::try_from(payload)
                    .ok()
                    .filter(|level| *level <= MAX_VOLUME)
                    .ok_or(RouteError::OutOfRange {
                        what: "volume",
                        value: payload,
                        max: u32::from(MAX_VOLUME),
                    })?;
                Event::volume_changed(SessionId(id), level)
            }
            other => Event {
                kind: other,
                subject: EventSubject::Endpoint(EndpointId(id)),
                payload: if payload == 0 {
                    EventPayload::None
                } else {
                    EventPayload::Raw(payload)
                },
            },
        };
        Ok(event)
    }

    pub fn endpoint_id(&self) -> Option<EndpointId> {
        match self.subject {
            EventSubject::Endpoint(id) => Some(id),
            EventSubject::Session(_) => None,
        }
    }
}

/// Set of event kinds a listener wants.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    pub const EMPTY: EventMask = EventMask(0);

    /// Readiness events every route listener needs.
    pub const READINESS: EventMask = EventMask(
        EventKind::DeviceReady as u32 | EventKind::DeviceReleased as u32,
    );

    pub fn of(kinds: &[EventKind]) -> Self {
        Self(kinds.iter().fold(0, |acc, k| acc | k.bit()))
    }

    /// Validate raw mask bits; unknown bits are rejected.
    pub fn from_bits(bits: u32) -> Result<Self> {
        let known = EventKind::ALL.iter().fold(0, |acc, k| acc | k.bit());
        if bits & !known != 0 {
            return Err(RouteError::InvalidState(format!(
                "event mask {bits:#x} has unknown bits {:#x}",
                bits & !known
            )));
        }
        Ok(Self(bits))
    }

    pub fn with(self, kind: EventKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|k| self.contains(*k))
            .collect();
        f.debug_tuple("EventMask").field(&kinds).finish()
    }
}

/// Callback type for observer listeners.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Wrap a closure as an [`EventCallback`].
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What runs when a listener matches.
///
/// Handlers run on the publishing thread with the subject's dispatch lock
/// held. Publishing about that same subject from inside a handler fails with
/// [`RouteError::InvalidState`].
#[derive(Clone)]
pub enum Handler {
    /// Re-evaluate one route of a controller.
    Route {
        controller: Weak<RouteController>,
        route: RouteId,
    },
    /// Feed the loopback gate.
    Loopback(Weak<LoopbackGate>),
    /// Arbitrary observer (logging, tests, UI).
    Observer(EventCallback),
}

impl Handler {
    fn invoke(&self, event: &Event) {
        match self {
            Handler::Route { controller, route } => match controller.upgrade() {
                Some(controller) => controller.handle_event(*route, event),
                None => tracing::debug!(route = %route, "route controller dropped; event skipped"),
            },
            Handler::Loopback(gate) => match gate.upgrade() {
                Some(gate) => gate.handle_event(event),
                None => tracing::debug!("loopback gate dropped; event skipped"),
            },
            Handler::Observer(callback) => callback(event),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Route { route, .. } => write!(f, "Route({route})"),
            Handler::Loopback(_) => f.write_str("Loopback"),
            Handler::Observer(_) => f.write_str("Observer"),
        }
    }
}

struct Listener {
    class: ClientClass,
    session: SessionId,
    mask: EventMask,
    handler: Handler,
}

thread_local! {
    static DISPATCHING: RefCell<Vec<EventSubject>> = const { RefCell::new(Vec::new()) };
}

/// Marks a subject as being dispatched on the current thread.
struct DispatchGuard(EventSubject);

impl DispatchGuard {
    fn enter(subject: EventSubject) -> Option<Self> {
        DISPATCHING.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains(&subject) {
                return None;
            }
            active.push(subject);
            Some(Self(subject))
        })
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|s| *s == self.0) {
                active.remove(pos);
            }
        });
    }
}

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
    dispatch_locks: Mutex<HashMap<EventSubject, Arc<Mutex<()>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `(class, session)`.
    ///
    /// An empty mask or a key that is already registered is rejected.
    pub fn register(
        &self,
        class: ClientClass,
        session: SessionId,
        mask: EventMask,
        handler: Handler,
    ) -> Result<()> {
        if mask.is_empty() {
            return Err(RouteError::InvalidState(format!(
                "{class} session {session} registered with an empty event mask"
            )));
        }
        let mut listeners = self.listeners.lock().unwrap_or_else(|err| err.into_inner());
        if listeners
            .iter()
            .any(|l| l.class == class && l.session == session)
        {
            return Err(RouteError::InvalidState(format!(
                "{class} session {session} already has a listener"
            )));
        }
        tracing::debug!(class = %class, session = %session, mask = ?mask, handler = ?handler, "listener registered");
        listeners.push(Listener {
            class,
            session,
            mask,
            handler,
        });
        Ok(())
    }

    /// Register from untyped values, as handed over by an ioctl-style caller.
    pub fn register_raw(
        &self,
        class: u8,
        session: u16,
        mask_bits: u32,
        handler: Handler,
    ) -> Result<()> {
        let class = ClientClass::try_from(class)
            .map_err(|raw| RouteError::InvalidState(format!("unknown client class {raw}")))?;
        let mask = EventMask::from_bits(mask_bits)?;
        self.register(class, SessionId(session), mask, handler)
    }

    /// Remove the listener for `(class, session)`. Returns `true` if one existed.
    pub fn unregister(&self, class: ClientClass, session: SessionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|err| err.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !(l.class == class && l.session == session));
        let removed = listeners.len() != before;
        if removed {
            tracing::debug!(class = %class, session = %session, "listener unregistered");
        }
        removed
    }

    pub fn is_registered(&self, class: ClientClass, session: SessionId) -> bool {
        self.listeners
            .lock()
            .map(|l| l.iter().any(|l| l.class == class && l.session == session))
            .unwrap_or(false)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn dispatch_lock(&self, subject: EventSubject) -> Arc<Mutex<()>> {
        let mut locks = self
            .dispatch_locks
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        locks.entry(subject).or_default().clone()
    }

    /// Deliver `event` to every matching listener. Returns the number of handlers run.
    ///
    /// Session-subject events only reach the listener registered for that
    /// session. A re-entrant publish about the subject being dispatched is
    /// dropped with an error log and reports zero handlers.
    pub fn publish(&self, event: Event) -> usize {
        match self.publish_with(event, || Ok(())) {
            Ok(handlers) => handlers,
            Err(err) => {
                tracing::error!(kind = ?event.kind, subject = ?event.subject, error = %err, "event not dispatched");
                0
            }
        }
    }

    /// Run `update`, then dispatch `event`, both under the subject's dispatch
    /// lock. An `update` error is returned and nothing is dispatched.
    pub fn publish_with(&self, event: Event, update: impl FnOnce() -> Result<()>) -> Result<usize> {
        let Some(_active) = DispatchGuard::enter(event.subject) else {
            return Err(RouteError::InvalidState(format!(
                "{:?} published while {:?} is being dispatched on this thread",
                event.kind, event.subject
            )));
        };
        let subject_lock = self.dispatch_lock(event.subject);
        let _serial = subject_lock.lock().unwrap_or_else(|err| err.into_inner());
        update()?;

        let handlers: Vec<Handler> = {
            let listeners = self.listeners.lock().unwrap_or_else(|err| err.into_inner());
            listeners
                .iter()
                .filter(|l| l.mask.contains(event.kind))
                .filter(|l| match event.subject {
                    EventSubject::Session(session) => l.session == session,
                    EventSubject::Endpoint(_) => true,
                })
                .map(|l| l.handler.clone())
                .collect()
        };

        tracing::trace!(kind = ?event.kind, subject = ?event.subject, handlers = handlers.len(), "dispatching event");
        for handler in &handlers {
            handler.invoke(&event);
        }
        Ok(handlers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<(u16, Event)>>>, impl Fn(u16) -> Handler) {
        let seen: Arc<Mutex<Vec<(u16, Event)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_for_handlers = seen.clone();
        let make = move |tag: u16| {
            let seen = seen_for_handlers.clone();
            Handler::Observer(event_callback(move |event| {
                seen.lock().expect("seen").push((tag, *event));
            }))
        };
        (seen, make)
    }

    #[test]
    fn dispatches_in_registration_order() {
        let bus = EventBus::new();
        let (seen, make) = recorder();
        bus.register(ClientClass::Decoder, SessionId(2), EventMask::READINESS, make(2))
            .expect("register 2");
        bus.register(ClientClass::Decoder, SessionId(1), EventMask::READINESS, make(1))
            .expect("register 1");

        let delivered = bus.publish(Event::device_ready(EndpointId(3)));
        assert_eq!(delivered, 2);
        let tags: Vec<u16> = seen.lock().expect("seen").iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![2, 1]);
    }

    #[test]
    fn mask_filters_kinds() {
        let bus = EventBus::new();
        let (seen, make) = recorder();
        bus.register(
            ClientClass::Voice,
            SessionId(1),
            EventMask::of(&[EventKind::VoiceDeviceChanged]),
            make(1),
        )
        .expect("register");

        assert_eq!(bus.publish(Event::device_ready(EndpointId(0))), 0);
        assert_eq!(bus.publish(Event::voice_device_changed(EndpointId(0))), 1);
        assert_eq!(seen.lock().expect("seen").len(), 1);
    }

    #[test]
    fn volume_events_only_reach_their_session() {
        let bus = EventBus::new();
        let (seen, make) = recorder();
        let mask = EventMask::of(&[EventKind::VolumeChanged]);
        bus.register(ClientClass::Decoder, SessionId(1), mask, make(1)).expect("1");
        bus.register(ClientClass::Decoder, SessionId(2), mask, make(2)).expect("2");

        bus.publish(Event::volume_changed(SessionId(2), 900));
        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 2);
        assert_eq!(seen[0].1.payload, EventPayload::Volume(900));
    }

    #[test]
    fn registration_is_validated() {
        let bus = EventBus::new();
        let (_seen, make) = recorder();
        assert!(bus.register_raw(9, 1, EventMask::READINESS.bits(), make(1)).is_err());
        assert!(bus.register_raw(1, 1, 0x10, make(1)).is_err());
        assert!(
            bus.register(ClientClass::Decoder, SessionId(1), EventMask::EMPTY, make(1))
                .is_err()
        );
        bus.register_raw(1, 1, EventMask::READINESS.bits(), make(1)).expect("valid");
        assert!(
            bus.register(ClientClass::Decoder, SessionId(1), EventMask::READINESS, make(1))
                .is_err()
        );
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn unregister_stops_delivery() {
        let bus = EventBus::new();
        let (seen, make) = recorder();
        bus.register(ClientClass::Encoder, SessionId(4), EventMask::READINESS, make(4))
            .expect("register");
        assert!(bus.is_registered(ClientClass::Encoder, SessionId(4)));
        assert!(bus.unregister(ClientClass::Encoder, SessionId(4)));
        assert!(!bus.unregister(ClientClass::Encoder, SessionId(4)));
        assert!(!bus.is_registered(ClientClass::Encoder, SessionId(4)));
        bus.publish(Event::device_released(EndpointId(1)));
        assert!(seen.lock().expect("seen").is_empty());
    }

    #[test]
    fn handlers_may_unregister_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let bus_for_handler = Arc::downgrade(&bus);
        let handler = Handler::Observer(event_callback(move |_| {
            if let Some(bus) = bus_for_handler.upgrade() {
                bus.unregister(ClientClass::Decoder, SessionId(1));
            }
        }));
        bus.register(ClientClass::Decoder, SessionId(1), EventMask::READINESS, handler)
            .expect("register");
        assert_eq!(bus.publish(Event::device_ready(EndpointId(0))), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn from_raw_rejects_unknown_kinds() {
        assert!(Event::from_raw(0x10, 1, 0).is_err());
        assert!(Event::from_raw(0x80, 1, 0).is_err());
        let event = Event::from_raw(EventKind::DeviceReady.bit(), 4, 0).expect("ready");
        assert_eq!(event, Event::device_ready(EndpointId(4)));
        let vol = Event::from_raw(EventKind::VolumeChanged.bit(), 10, 1200).expect("volume");
        assert_eq!(vol.subject, EventSubject::Session(SessionId(10)));
    }

    #[test]
    fn update_runs_before_handlers_and_can_veto_dispatch() {
        let bus = EventBus::new();
        let flag = Arc::new(Mutex::new(false));
        let flag_for_handler = flag.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        bus.register(
            ClientClass::Decoder,
            SessionId(1),
            EventMask::READINESS,
            Handler::Observer(event_callback(move |_| {
                let value = *flag_for_handler.lock().expect("flag");
                sink.lock().expect("sink").push(value);
            })),
        )
        .expect("register");

        let ran = bus
            .publish_with(Event::device_ready(EndpointId(0)), || {
                *flag.lock().expect("flag") = true;
                Ok(())
            })
            .expect("dispatch");
        assert_eq!(ran, 1);
        assert_eq!(*observed.lock().expect("observed"), vec![true]);

        let err = bus
            .publish_with(Event::device_released(EndpointId(0)), || {
                Err(RouteError::endpoint_not_found(EndpointId(0)))
            })
            .expect_err("update failed");
        assert!(matches!(err, RouteError::NotFound { .. }));
        assert_eq!(observed.lock().expect("observed").len(), 1);
    }

    #[test]
    fn same_subject_publish_from_handler_is_refused() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::new(Mutex::new(Vec::new()));
        let (weak, sink) = (Arc::downgrade(&bus), inner.clone());
        bus.register(
            ClientClass::Decoder,
            SessionId(1),
            EventMask::READINESS,
            Handler::Observer(event_callback(move |event| {
                if event.kind != EventKind::DeviceReady {
                    return;
                }
                if let Some(bus) = weak.upgrade() {
                    let same = bus.publish_with(Event::device_released(EndpointId(0)), || Ok(()));
                    let other = bus.publish(Event::device_released(EndpointId(1)));
                    sink.lock().expect("sink").push((same.is_err(), other));
                }
            })),
        )
        .expect("register");

        assert_eq!(bus.publish(Event::device_ready(EndpointId(0))), 1);
        assert_eq!(*inner.lock().expect("inner"), vec![(true, 1)]);
        assert_eq!(bus.publish(Event::device_released(EndpointId(0))), 1);
    }
}
