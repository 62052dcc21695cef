//! Device registry: the single owner of endpoint state.
//!
//! The endpoint table is fixed at construction, so the map itself needs no
//! lock. Each endpoint has its own mutex, held across that endpoint's hardware
//! open/close so opens of unrelated endpoints never wait on each other.
//!
//! An endpoint is powered while device control has it pinned or at least one
//! route holds it. Routes take and drop their hold with [`DeviceRegistry::acquire`]
//! and [`DeviceRegistry::release`]; the last release powers the endpoint down.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use audio_route_types::{Capability, EndpointId, EndpointStatus, RouteId};

use crate::config::EndpointSpec;
use crate::error::{Result, RouteError};
use crate::hw::AudioHardware;
use crate::sessions::SessionMask;

/// State of one physical endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub capability: Capability,
    /// Default rate from the board table.
    pub sample_rate: u32,
    /// Rate agreed with the codec on the last successful open.
    pub negotiated_rate: Option<u32>,
    pub open: bool,
    /// Powered on by device control; only [`DeviceRegistry::close`] drops it.
    pub pinned: bool,
    /// Routes that opened the endpoint and have not released it.
    pub holders: BTreeSet<RouteId>,
    /// Last readiness notification seen for this endpoint.
    pub ready: bool,
    pub session_mask: SessionMask,
}

impl Endpoint {
    fn from_spec(spec: &EndpointSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name.clone(),
            capability: spec.capability,
            sample_rate: spec.sample_rate,
            negotiated_rate: None,
            open: false,
            pinned: false,
            holders: BTreeSet::new(),
            ready: false,
            session_mask: SessionMask::EMPTY,
        }
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            id: self.id,
            name: self.name.clone(),
            capability: self.capability,
            sample_rate: self.sample_rate,
            negotiated_rate: self.negotiated_rate,
            open: self.open,
            pinned: self.pinned,
            holders: self.holders.iter().copied().collect(),
            ready: self.ready,
            session_mask: self.session_mask.bits(),
        }
    }
}

pub struct DeviceRegistry {
    endpoints: BTreeMap<EndpointId, Mutex<Endpoint>>,
    hw: Arc<dyn AudioHardware>,
}

impl DeviceRegistry {
    /// Build the registry from the board table.
    ///
    /// Every id must be below the endpoint count reported by the device layer.
    pub fn new(specs: &[EndpointSpec], hw: Arc<dyn AudioHardware>) -> Result<Self> {
        let count = hw.endpoint_count();
        let mut endpoints = BTreeMap::new();
        for spec in specs {
            if usize::from(spec.id.0) >= count {
                return Err(RouteError::InvalidConfig(format!(
                    "endpoint {} is outside the {count} endpoints exposed by the device layer",
                    spec.id.0
                )));
            }
            if endpoints
                .insert(spec.id, Mutex::new(Endpoint::from_spec(spec)))
                .is_some()
            {
                return Err(RouteError::InvalidConfig(format!(
                    "duplicate endpoint id {}",
                    spec.id.0
                )));
            }
        }
        tracing::info!(endpoints = endpoints.len(), device_count = count, "device registry ready");
        Ok(Self { endpoints, hw })
    }

    fn lock(&self, id: EndpointId) -> Result<MutexGuard<'_, Endpoint>> {
        let slot = self
            .endpoints
            .get(&id)
            .ok_or_else(|| RouteError::endpoint_not_found(id))?;
        Ok(slot.lock().unwrap_or_else(|err| err.into_inner()))
    }

    /// Run `f` with the endpoint locked.
    pub(crate) fn with_endpoint<T>(
        &self,
        id: EndpointId,
        f: impl FnOnce(&mut Endpoint) -> T,
    ) -> Result<T> {
        let mut guard = self.lock(id)?;
        Ok(f(&mut guard))
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.endpoints.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        self.endpoints.keys().copied().collect()
    }

    /// Snapshot of one endpoint.
    pub fn find(&self, id: EndpointId) -> Result<Endpoint> {
        self.with_endpoint(id, |ep| ep.clone())
    }

    pub fn capability(&self, id: EndpointId) -> Result<Capability> {
        self.with_endpoint(id, |ep| ep.capability)
    }

    pub fn is_ready(&self, id: EndpointId) -> Result<bool> {
        self.with_endpoint(id, |ep| ep.ready)
    }

    /// Record a readiness change. Returns `true` when the flag actually changed.
    pub fn set_ready(&self, id: EndpointId, ready: bool) -> Result<bool> {
        self.with_endpoint(id, |ep| {
            let changed = ep.ready != ready;
            ep.ready = ready;
            changed
        })
    }

    /// Rate to request when opening `id`.
    ///
    /// Endpoints carrying a voice call follow the call frequency for their
    /// direction; a zero frequency falls back to the table default.
    pub fn preferred_rate(&self, id: EndpointId, voice: bool) -> Result<u32> {
        let (capability, default_rate) = self.with_endpoint(id, |ep| (ep.capability, ep.sample_rate))?;
        if !voice {
            return Ok(default_rate);
        }
        let (tx_hz, rx_hz) = self.hw.voice_frequencies();
        let rate = if capability.supports_rx() { rx_hz } else { tx_hz };
        Ok(if rate == 0 { default_rate } else { rate })
    }

    /// Power up `id` for device control and pin it.
    ///
    /// Already open endpoints return their current rate without touching hardware.
    pub fn open(&self, id: EndpointId, requested_rate: u32) -> Result<u32> {
        let mut ep = self.lock(id)?;
        let rate = self.power_up(&mut ep, requested_rate)?;
        ep.pinned = true;
        Ok(rate)
    }

    /// Power up `id` on behalf of `route` and record the hold.
    pub fn acquire(&self, id: EndpointId, requested_rate: u32, route: RouteId) -> Result<u32> {
        let mut ep = self.lock(id)?;
        let rate = self.power_up(&mut ep, requested_rate)?;
        if ep.holders.insert(route) {
            tracing::debug!(endpoint = %id, route = %route, holders = ep.holders.len(), "endpoint acquired");
        }
        Ok(rate)
    }

    /// Drop the hold `route` has on `id`.
    ///
    /// The last holder powers an unpinned endpoint down; session bits stay.
    /// Returns `true` when this call closed the endpoint.
    pub fn release(&self, id: EndpointId, route: RouteId) -> Result<bool> {
        let mut ep = self.lock(id)?;
        if !ep.holders.remove(&route) {
            return Ok(false);
        }
        if !ep.holders.is_empty() || ep.pinned || !ep.open {
            tracing::debug!(endpoint = %id, route = %route, holders = ep.holders.len(), pinned = ep.pinned, "endpoint released; still powered");
            return Ok(false);
        }
        self.power_down(&mut ep)?;
        Ok(true)
    }

    /// Power down `id` and drop every session bit, hold and pin on it.
    ///
    /// A hardware failure is reported, but the endpoint is considered closed
    /// afterwards either way.
    pub fn close(&self, id: EndpointId) -> Result<()> {
        let mut ep = self.lock(id)?;
        if !ep.session_mask.is_empty() || !ep.holders.is_empty() {
            tracing::debug!(
                endpoint = %id,
                mask = format_args!("{:#x}", ep.session_mask.bits()),
                holders = ?ep.holders,
                "closing endpoint still in use"
            );
        }
        ep.session_mask = SessionMask::EMPTY;
        ep.holders.clear();
        ep.pinned = false;
        self.power_down(&mut ep)
    }

    fn power_up(&self, ep: &mut Endpoint, requested_rate: u32) -> Result<u32> {
        if ep.open {
            return Ok(ep.negotiated_rate.unwrap_or(ep.sample_rate));
        }
        let rate = self
            .hw
            .open_endpoint(ep.id, requested_rate)
            .map_err(|e| RouteError::hardware("endpoint open", e))?;
        ep.open = true;
        ep.negotiated_rate = Some(rate);
        tracing::info!(endpoint = %ep.id, name = %ep.name, requested_rate, rate, "endpoint opened");
        Ok(rate)
    }

    fn power_down(&self, ep: &mut Endpoint) -> Result<()> {
        if !ep.open {
            return Ok(());
        }
        ep.open = false;
        ep.negotiated_rate = None;
        match self.hw.close_endpoint(ep.id) {
            Ok(()) => {
                tracing::info!(endpoint = %ep.id, name = %ep.name, "endpoint closed");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(endpoint = %ep.id, error = %e, "endpoint close failed; marked closed");
                Err(RouteError::hardware("endpoint close", e))
            }
        }
    }

    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        self.endpoints
            .values()
            .map(|slot| slot.lock().unwrap_or_else(|err| err.into_inner()).status())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimulatedHardware;
    use audio_route_types::{ClientClass, SessionId};

    fn spec(id: u16, capability: Capability) -> EndpointSpec {
        EndpointSpec {
            id: EndpointId(id),
            name: format!("dev{id}"),
            capability,
            sample_rate: 48_000,
        }
    }

    fn registry() -> (Arc<SimulatedHardware>, DeviceRegistry) {
        let hw = Arc::new(SimulatedHardware::new(8));
        let reg = DeviceRegistry::new(
            &[spec(0, Capability::Rx), spec(1, Capability::Tx)],
            hw.clone(),
        )
        .expect("registry");
        (hw, reg)
    }

    #[test]
    fn new_rejects_ids_beyond_device_count() {
        let hw = Arc::new(SimulatedHardware::new(2));
        let err = DeviceRegistry::new(&[spec(2, Capability::Rx)], hw).err().expect("error");
        assert!(matches!(err, RouteError::InvalidConfig(_)));
    }

    #[test]
    fn find_unknown_endpoint_is_not_found() {
        let (_hw, reg) = registry();
        let err = reg.find(EndpointId(7)).expect_err("missing");
        assert!(matches!(err, RouteError::NotFound { what: "endpoint", id: 7 }));
    }

    #[test]
    fn open_is_idempotent() {
        let (hw, reg) = registry();
        hw.cap_rate(EndpointId(0), 44_100);
        assert_eq!(reg.open(EndpointId(0), 48_000).expect("open"), 44_100);
        assert_eq!(reg.open(EndpointId(0), 8_000).expect("reopen"), 44_100);
        assert_eq!(hw.open_count(EndpointId(0)), 1);
        assert!(reg.find(EndpointId(0)).expect("find").open);
    }

    #[test]
    fn failed_open_leaves_endpoint_closed() {
        let (hw, reg) = registry();
        hw.fail_open(EndpointId(1), true);
        let err = reg.open(EndpointId(1), 48_000).expect_err("open fails");
        assert!(matches!(err, RouteError::HardwareFailure { .. }));
        assert!(!reg.find(EndpointId(1)).expect("find").open);
    }

    #[test]
    fn close_clears_session_mask_even_when_bound() {
        let (hw, reg) = registry();
        reg.open(EndpointId(0), 48_000).expect("open");
        reg.with_endpoint(EndpointId(0), |ep| {
            ep.session_mask.insert_stream(ClientClass::Decoder, SessionId(1))
        })
        .expect("bind");
        reg.close(EndpointId(0)).expect("close");
        let ep = reg.find(EndpointId(0)).expect("find");
        assert!(!ep.open);
        assert!(!ep.pinned);
        assert!(ep.session_mask.is_empty());
        assert_eq!(hw.close_count(EndpointId(0)), 1);

        reg.close(EndpointId(0)).expect("close again");
        assert_eq!(hw.close_count(EndpointId(0)), 1);
    }

    #[test]
    fn close_failure_still_marks_closed() {
        let (hw, reg) = registry();
        reg.open(EndpointId(0), 48_000).expect("open");
        hw.fail_close(EndpointId(0), true);
        assert!(reg.close(EndpointId(0)).is_err());
        assert!(!reg.find(EndpointId(0)).expect("find").open);
    }

    #[test]
    fn preferred_rate_follows_voice_frequency() {
        let (hw, reg) = registry();
        assert_eq!(reg.preferred_rate(EndpointId(0), true).expect("rate"), 48_000);
        hw.set_voice_frequencies(16_000, 8_000);
        assert_eq!(reg.preferred_rate(EndpointId(0), true).expect("rx"), 8_000);
        assert_eq!(reg.preferred_rate(EndpointId(1), true).expect("tx"), 16_000);
        assert_eq!(reg.preferred_rate(EndpointId(1), false).expect("default"), 48_000);
    }

    #[test]
    fn set_ready_reports_changes_only() {
        let (_hw, reg) = registry();
        assert!(reg.set_ready(EndpointId(0), true).expect("ready"));
        assert!(!reg.set_ready(EndpointId(0), true).expect("ready again"));
        assert!(reg.set_ready(EndpointId(0), false).expect("released"));
    }

    #[test]
    fn last_release_powers_down_unpinned_endpoint() {
        let (hw, reg) = registry();
        let ep = EndpointId(0);
        reg.acquire(ep, 48_000, RouteId(1)).expect("first");
        reg.acquire(ep, 48_000, RouteId(2)).expect("second");
        assert_eq!(hw.open_count(ep), 1);

        assert!(!reg.release(ep, RouteId(1)).expect("one left"));
        assert!(reg.find(ep).expect("find").open);
        assert!(!reg.release(ep, RouteId(1)).expect("not a holder"));
        assert!(reg.release(ep, RouteId(2)).expect("last"));
        assert!(!reg.find(ep).expect("find").open);
        assert_eq!(hw.close_count(ep), 1);
    }

    #[test]
    fn pinned_endpoint_survives_route_release() {
        let (hw, reg) = registry();
        let ep = EndpointId(1);
        reg.open(ep, 48_000).expect("device on");
        reg.acquire(ep, 8_000, RouteId(3)).expect("route");
        assert!(!reg.release(ep, RouteId(3)).expect("release"));
        assert_eq!(hw.close_count(ep), 0);

        reg.close(ep).expect("device off");
        let status = reg.find(ep).expect("find").status();
        assert!(!status.open && !status.pinned && status.holders.is_empty());
    }
}
