//! Error types for the routing core.
//!
//! `AlreadyOpen`/`AlreadyBound` situations are not errors: the operations that
//! can hit them are idempotent and return success.

use audio_route_types::{EndpointId, RouteId, SessionId};

use crate::hw::HwError;

/// Errors surfaced by registry, controller and context operations.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Unknown endpoint, route or session id.
    #[error("{what} not found: {id}")]
    NotFound {
        /// Kind of object that was looked up.
        what: &'static str,
        /// Raw id that was requested.
        id: u32,
    },

    /// Endpoint direction does not fit the requested use.
    #[error("endpoint {endpoint} cannot be used as {required}")]
    CapabilityMismatch {
        endpoint: EndpointId,
        /// `rx` or `tx`.
        required: &'static str,
    },

    /// A device id resolves to more than one compatible route or slot.
    #[error("endpoint {endpoint} matches more than one route: {candidates:?}")]
    AmbiguousRoute {
        endpoint: EndpointId,
        candidates: Vec<RouteId>,
    },

    /// The hardware collaborator rejected an open/close/loopback call.
    #[error("hardware failure during {op}: {source}")]
    HardwareFailure {
        op: &'static str,
        #[source]
        source: HwError,
    },

    /// The operation is not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A numeric argument is outside its accepted range.
    #[error("{what} out of range: {value} (max {max})")]
    OutOfRange {
        what: &'static str,
        value: u32,
        max: u32,
    },

    /// The board description is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RouteError {
    pub fn endpoint_not_found(id: EndpointId) -> Self {
        Self::NotFound {
            what: "endpoint",
            id: u32::from(id.0),
        }
    }

    pub fn route_not_found(id: RouteId) -> Self {
        Self::NotFound {
            what: "route",
            id: u32::from(id.0),
        }
    }

    pub fn session_not_found(id: SessionId) -> Self {
        Self::NotFound {
            what: "session",
            id: u32::from(id.0),
        }
    }

    pub fn hardware(op: &'static str, source: HwError) -> Self {
        Self::HardwareFailure { op, source }
    }

    /// `true` for errors the caller should treat as "bad request" rather than
    /// a device problem.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::CapabilityMismatch { .. }
                | Self::AmbiguousRoute { .. }
                | Self::OutOfRange { .. }
        )
    }
}

pub type Result<T, E = RouteError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_names_the_object() {
        let err = RouteError::endpoint_not_found(EndpointId(9));
        assert_eq!(err.to_string(), "endpoint not found: 9");
        assert!(err.is_caller_error());
    }

    #[test]
    fn hardware_failure_keeps_source() {
        let err = RouteError::hardware("open", HwError::new("clock did not lock"));
        assert_eq!(
            err.to_string(),
            "hardware failure during open: clock did not lock"
        );
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_caller_error());
    }
}
