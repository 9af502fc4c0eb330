//! Error types for portal negotiation.

use thiserror::Error;

use crate::portal::NegotiationState;

/// Convenience alias used across the crate.
pub type Result<T, E = PortalError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PortalError {
    /// The method call could not be dispatched or returned a D-Bus error.
    #[error("remote call {method} failed: {source}")]
    RemoteCall {
        method: &'static str,
        #[source]
        source: zbus::Error,
    },
    /// A signal subscription could not be installed.
    #[error("failed to subscribe to {what}: {source}")]
    Subscription {
        what: String,
        #[source]
        source: zbus::Error,
    },
    /// The portal answered a request with a non-zero status.
    #[error("{method} was rejected with status {status}")]
    ResponseFailed { method: &'static str, status: u32 },
    #[error("Start response did not contain any stream")]
    MissingStream,
    #[error("session was closed before negotiation completed")]
    SessionClosedEarly,
    #[error("CreateSession response did not contain a session handle")]
    MissingSessionHandle,
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: NegotiationState,
        to: NegotiationState,
    },
    #[error("invalid object path '{path}': {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: zbus::zvariant::Error,
    },
    #[error("malformed {what} in portal response: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: zbus::zvariant::Error,
    },
    #[error("the signal router is gone")]
    RouterStopped,
    /// The session's `Closed` subscription ended without the signal.
    #[error("lost the bus connection while watching the session")]
    BusDisconnected,
    #[error("failed to launch pipeline: {0}")]
    Pipeline(#[from] std::io::Error),
}

impl PortalError {
    /// Process exit code for this failure.
    ///
    /// A rejected request exits with the portal's status, an early close is a
    /// normal shutdown, anything else is `1`.
    pub fn exit_code(&self) -> u8 {
        match self {
            PortalError::ResponseFailed { status, .. } => {
                u8::try_from(*status).unwrap_or(u8::MAX).max(1)
            }
            PortalError::SessionClosedEarly => 0,
            _ => 1,
        }
    }

    /// Failures after which the session must be torn down.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            PortalError::ResponseFailed { .. }
                | PortalError::Subscription { .. }
                | PortalError::MissingStream
                | PortalError::RouterStopped
        )
    }
}
