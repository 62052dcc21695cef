//! Session tracker: which client classes are bound to each endpoint.
//!
//! The mask is a plain bitwise OR, one 8-bit lane per [`ClientClass`]. Bit 0
//! of a lane marks the class as bound, bits 1..=7 mark individual stream
//! slots. Binding twice is a no-op. Routes unbind one stream slot at a time
//! and the class bit goes with the last slot of its lane; a plain class
//! unbind clears the whole lane.

use std::fmt;
use std::sync::Arc;

use audio_route_types::{ClientClass, EndpointId, SessionId};

use crate::error::Result;
use crate::registry::DeviceRegistry;

const LANE_MASK: u32 = 0xff;
const SLOT_BITS: u32 = 0xfe;
const MAX_STREAM_SLOT: u16 = 6;

/// Bitmask of client classes (and stream slots) bound to an endpoint.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SessionMask(u32);

impl SessionMask {
    pub const EMPTY: SessionMask = SessionMask(0);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn class_bit(class: ClientClass) -> u32 {
        1 << class.lane_shift()
    }

    /// Set the class bit alone. Returns `true` if it was not set before.
    pub fn insert_class(&mut self, class: ClientClass) -> bool {
        let before = self.0;
        self.0 |= Self::class_bit(class);
        before != self.0
    }

    /// Clear the whole lane of `class`. Returns `true` if anything was cleared.
    pub fn remove_class(&mut self, class: ClientClass) -> bool {
        let before = self.0;
        self.0 &= !(LANE_MASK << class.lane_shift());
        before != self.0
    }

    fn slot_bit(class: ClientClass, session: SessionId) -> u32 {
        if session.0 <= MAX_STREAM_SLOT {
            (1 << (session.0 + 1)) << class.lane_shift()
        } else {
            0
        }
    }

    /// Set the class bit plus the slot bit for `session` when it fits in the lane.
    pub fn insert_stream(&mut self, class: ClientClass, session: SessionId) -> bool {
        let before = self.0;
        self.0 |= Self::class_bit(class) | Self::slot_bit(class, session);
        before != self.0
    }

    /// Clear the slot bit of `session`, and the class bit once no slot of the
    /// lane is left. Returns `true` if anything was cleared.
    pub fn remove_stream(&mut self, class: ClientClass, session: SessionId) -> bool {
        let before = self.0;
        self.0 &= !Self::slot_bit(class, session);
        if self.0 & (SLOT_BITS << class.lane_shift()) == 0 {
            self.0 &= !Self::class_bit(class);
        }
        before != self.0
    }

    pub fn contains_class(self, class: ClientClass) -> bool {
        self.0 & (LANE_MASK << class.lane_shift()) != 0
    }

    pub fn classes(self) -> Vec<ClientClass> {
        ClientClass::ALL
            .into_iter()
            .filter(|class| self.contains_class(*class))
            .collect()
    }
}

impl fmt::Debug for SessionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionMask({:#08x})", self.0)
    }
}

/// Binds and unbinds client classes on registry-owned endpoints.
///
/// Mask updates happen under the endpoint's registry lock.
#[derive(Clone)]
pub struct SessionTracker {
    registry: Arc<DeviceRegistry>,
}

impl SessionTracker {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Mark `class` as bound to `endpoint` without a stream slot.
    pub fn bind(&self, endpoint: EndpointId, class: ClientClass) -> Result<()> {
        let newly = self
            .registry
            .with_endpoint(endpoint, |ep| ep.session_mask.insert_class(class))?;
        if newly {
            tracing::debug!(endpoint = %endpoint, class = %class, "session bound");
        }
        Ok(())
    }

    /// Drop every binding of `class` from `endpoint`.
    ///
    /// Returns `true` when nothing else remains bound, i.e. the caller was the
    /// last user and may power the endpoint down.
    pub fn unbind(&self, endpoint: EndpointId, class: ClientClass) -> Result<bool> {
        let (removed, now_empty) = self.registry.with_endpoint(endpoint, |ep| {
            let removed = ep.session_mask.remove_class(class);
            (removed, ep.session_mask.is_empty())
        })?;
        if removed {
            tracing::debug!(endpoint = %endpoint, class = %class, now_empty, "session unbound");
        }
        Ok(now_empty)
    }

    /// Bind `class` and the stream slot of `session`. Already bound is success.
    pub fn bind_stream(
        &self,
        endpoint: EndpointId,
        class: ClientClass,
        session: SessionId,
    ) -> Result<()> {
        let newly = self
            .registry
            .with_endpoint(endpoint, |ep| ep.session_mask.insert_stream(class, session))?;
        if newly {
            tracing::debug!(endpoint = %endpoint, class = %class, session = %session, "stream bound");
        }
        Ok(())
    }

    /// Drop the stream slot of `session` from `endpoint`.
    ///
    /// Returns `true` when nothing else remains bound.
    pub fn unbind_stream(
        &self,
        endpoint: EndpointId,
        class: ClientClass,
        session: SessionId,
    ) -> Result<bool> {
        let (removed, now_empty) = self.registry.with_endpoint(endpoint, |ep| {
            let removed = ep.session_mask.remove_stream(class, session);
            (removed, ep.session_mask.is_empty())
        })?;
        if removed {
            tracing::debug!(endpoint = %endpoint, class = %class, session = %session, now_empty, "stream unbound");
        }
        Ok(now_empty)
    }

    pub fn session_mask(&self, endpoint: EndpointId) -> Result<SessionMask> {
        self.registry.with_endpoint(endpoint, |ep| ep.session_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointSpec;
    use crate::hw::sim::SimulatedHardware;
    use audio_route_types::Capability;

    const EP: EndpointId = EndpointId(0);

    fn tracker() -> SessionTracker {
        let hw = Arc::new(SimulatedHardware::new(4));
        let registry = DeviceRegistry::new(
            &[EndpointSpec {
                id: EP,
                name: "handset".to_string(),
                capability: Capability::Duplex,
                sample_rate: 48_000,
            }],
            hw,
        )
        .expect("registry");
        SessionTracker::new(Arc::new(registry))
    }

    #[test]
    fn mask_layout_uses_one_lane_per_class() {
        let mut mask = SessionMask::EMPTY;
        assert!(mask.insert_stream(ClientClass::Voice, SessionId(0)));
        assert_eq!(mask.bits(), 0x3);
        assert!(mask.insert_stream(ClientClass::Decoder, SessionId(0)));
        assert_eq!(mask.bits(), 0x3 | (0x3 << 8));
        assert!(!mask.insert_stream(ClientClass::Decoder, SessionId(0)));
        assert_eq!(mask.classes(), vec![ClientClass::Voice, ClientClass::Decoder]);
    }

    #[test]
    fn large_session_ids_only_set_class_bit() {
        let mut mask = SessionMask::EMPTY;
        mask.insert_stream(ClientClass::Encoder, SessionId(10));
        assert_eq!(mask.bits(), 1 << 16);
        assert!(mask.remove_stream(ClientClass::Encoder, SessionId(10)));
        assert!(mask.is_empty());
    }

    #[test]
    fn removing_one_stream_keeps_its_siblings() {
        let mut mask = SessionMask::EMPTY;
        mask.insert_stream(ClientClass::Decoder, SessionId(1));
        mask.insert_stream(ClientClass::Decoder, SessionId(2));
        assert!(mask.remove_stream(ClientClass::Decoder, SessionId(2)));
        assert_eq!(mask.bits(), (0x1 | 0x4) << 8);
        assert!(!mask.remove_stream(ClientClass::Decoder, SessionId(2)));
        assert!(mask.remove_stream(ClientClass::Decoder, SessionId(1)));
        assert!(mask.is_empty());
    }

    #[test]
    fn bind_twice_is_success() {
        let t = tracker();
        t.bind_stream(EP, ClientClass::Decoder, SessionId(1)).expect("bind");
        t.bind_stream(EP, ClientClass::Decoder, SessionId(1)).expect("bind again");
        assert_eq!(t.session_mask(EP).expect("mask").bits(), 0x5 << 8);
    }

    #[test]
    fn unbind_reports_last_user_only() {
        let t = tracker();
        t.bind_stream(EP, ClientClass::Decoder, SessionId(1)).expect("dec");
        t.bind_stream(EP, ClientClass::Encoder, SessionId(1)).expect("enc");

        assert!(!t.unbind_stream(EP, ClientClass::Decoder, SessionId(1)).expect("unbind dec"));
        assert!(t.unbind_stream(EP, ClientClass::Encoder, SessionId(1)).expect("unbind enc"));
        assert!(t.session_mask(EP).expect("mask").is_empty());
    }

    #[test]
    fn class_unbind_clears_the_lane_and_reports_last_user() {
        let t = tracker();
        t.bind(EP, ClientClass::Decoder).expect("dec");
        t.bind(EP, ClientClass::Decoder).expect("dec again");
        t.bind_stream(EP, ClientClass::Decoder, SessionId(3)).expect("stream");
        t.bind(EP, ClientClass::Voice).expect("voice");
        assert_eq!(t.session_mask(EP).expect("mask").bits(), 0x1 | (0x11 << 8));

        assert!(!t.unbind(EP, ClientClass::Decoder).expect("unbind dec"));
        assert_eq!(t.session_mask(EP).expect("mask").bits(), 0x1);
        assert!(t.unbind(EP, ClientClass::Voice).expect("unbind voice"));
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let t = tracker();
        assert!(t.bind_stream(EndpointId(3), ClientClass::Voice, SessionId(0)).is_err());
    }
}
