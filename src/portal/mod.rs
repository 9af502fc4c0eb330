//! Client side of the `org.freedesktop.portal.ScreenCast` negotiation.
//!
//! Every portal method returns a request handle right away and delivers its
//! actual result later as a `Response` signal on that handle. This module
//! holds the shared wire types and the [`PortalBus`] seam; the submodules
//! build the request correlation and the session state machine on top.

mod dispatch;
mod request;
mod session;
mod stream;
mod token;

use std::collections::HashMap;
use std::future::Future;

use futures::stream::BoxStream;
use zbus::zvariant::{OwnedFd, OwnedObjectPath, OwnedValue, Str};

use crate::error::Result;

pub use dispatch::{DispatchLoop, LoopExit, StopHandle};
pub use request::{
    predict_request_handle, sanitize_unique_name, PendingRequests, PendingResponse,
    RequestCorrelator,
};
pub use session::{NegotiationOptions, NegotiationState, Negotiator, SessionEnd};
pub use stream::{parse_streams, StreamDescriptor};
pub use token::{Token, TokenGenerator, TOKEN_LEN};

/// Well-known name of the frontend portal service.
pub const PORTAL_SERVICE: &str = "org.freedesktop.portal.Desktop";
/// D-Bus object path of the portal desktop object.
pub const DESKTOP_PATH: &str = "/org/freedesktop/portal/desktop";
/// Namespace under which the portal exports request objects.
pub const REQUEST_PATH_PREFIX: &str = "/org/freedesktop/portal/desktop/request";

pub const SCREENCAST_INTERFACE: &str = "org.freedesktop.portal.ScreenCast";
pub const REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";
pub const SESSION_INTERFACE: &str = "org.freedesktop.portal.Session";

// Source type bitmask values per XDG Desktop Portal spec.
pub const SOURCE_TYPE_MONITOR: u32 = 1;
pub const SOURCE_TYPE_WINDOW: u32 = 2;
pub const SOURCE_TYPE_VIRTUAL: u32 = 4;

// Cursor mode bitmask values per XDG Desktop Portal spec.
pub const CURSOR_MODE_HIDDEN: u32 = 1;
pub const CURSOR_MODE_EMBEDDED: u32 = 2;
pub const CURSOR_MODE_METADATA: u32 = 4;

/// `a{sv}` options passed to portal methods.
pub type Options = HashMap<String, OwnedValue>;
/// `a{sv}` results delivered by `Response` and `Closed`.
pub type Results = HashMap<String, OwnedValue>;

/// Stream of signals matching one subscription.
pub type SignalStream = BoxStream<'static, PortalSignal>;

/// The remote operations that answer through a request object.
#[derive(Debug)]
pub enum PortalCall {
    CreateSession {
        options: Options,
    },
    SelectSources {
        session: OwnedObjectPath,
        options: Options,
    },
    Start {
        session: OwnedObjectPath,
        parent_window: String,
        options: Options,
    },
}

impl PortalCall {
    /// D-Bus member name of the call.
    pub fn method(&self) -> &'static str {
        match self {
            PortalCall::CreateSession { .. } => "CreateSession",
            PortalCall::SelectSources { .. } => "SelectSources",
            PortalCall::Start { .. } => "Start",
        }
    }

    /// Option key the portal reads the client token from.
    pub fn token_key(&self) -> &'static str {
        match self {
            PortalCall::CreateSession { .. } => "session_handle_token",
            _ => "handle_token",
        }
    }

    pub fn options(&self) -> &Options {
        match self {
            PortalCall::CreateSession { options }
            | PortalCall::SelectSources { options, .. }
            | PortalCall::Start { options, .. } => options,
        }
    }

    fn options_mut(&mut self) -> &mut Options {
        match self {
            PortalCall::CreateSession { options }
            | PortalCall::SelectSources { options, .. }
            | PortalCall::Start { options, .. } => options,
        }
    }

    /// Stores `token` under the key this method expects.
    pub fn insert_token(&mut self, token: &Token) {
        let key = self.token_key();
        self.options_mut().insert(
            key.to_string(),
            OwnedValue::from(Str::from(token.as_str().to_owned())),
        );
    }
}

/// Outcome codes carried by `org.freedesktop.portal.Request::Response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Cancelled,
    Other(u32),
}

impl From<u32> for ResponseStatus {
    fn from(code: u32) -> Self {
        match code {
            0 => ResponseStatus::Success,
            1 => ResponseStatus::Cancelled,
            other => ResponseStatus::Other(other),
        }
    }
}

/// Payload of a `Response` signal.
#[derive(Debug, PartialEq)]
pub struct Response {
    pub status: u32,
    pub results: Results,
}

impl Response {
    pub fn new(status: u32, results: Results) -> Self {
        Self { status, results }
    }

    pub fn kind(&self) -> ResponseStatus {
        ResponseStatus::from(self.status)
    }
}

/// Signals the negotiation listens to.
#[derive(Debug)]
pub enum PortalSignal {
    /// `org.freedesktop.portal.Request::Response` emitted on `handle`.
    Response {
        handle: OwnedObjectPath,
        response: Response,
    },
    /// `org.freedesktop.portal.Session::Closed` emitted on `session`.
    Closed {
        session: OwnedObjectPath,
        details: Results,
    },
}

impl PortalSignal {
    /// Object path the signal was emitted on.
    pub fn path(&self) -> &OwnedObjectPath {
        match self {
            PortalSignal::Response { handle, .. } => handle,
            PortalSignal::Closed { session, .. } => session,
        }
    }
}

/// Which signals a subscription delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalFilter {
    /// Every `Response` emitted on an object below `namespace`.
    Responses { namespace: OwnedObjectPath },
    /// `Closed` emitted on the given session object.
    Closed { session: OwnedObjectPath },
}

impl SignalFilter {
    /// Filter for all request objects the portal may create.
    pub fn all_requests() -> Self {
        SignalFilter::Responses {
            namespace: OwnedObjectPath::try_from(REQUEST_PATH_PREFIX)
                .expect("request prefix is a valid object path"),
        }
    }

    pub fn matches(&self, signal: &PortalSignal) -> bool {
        match (self, signal) {
            (SignalFilter::Responses { namespace }, PortalSignal::Response { handle, .. }) => {
                handle
                    .as_str()
                    .strip_prefix(namespace.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
            }
            (SignalFilter::Closed { session }, PortalSignal::Closed { session: path, .. }) => {
                session == path
            }
            _ => false,
        }
    }
}

/// The bus operations the negotiation needs.
///
/// Implemented over zbus by [`crate::desktop_client::DesktopClient`].
pub trait PortalBus: Send + Sync {
    /// Unique name of this connection, e.g. `:1.42`.
    fn unique_name(&self) -> Option<String>;

    /// Invokes `call` and returns the request handle from the method reply.
    fn invoke(&self, call: &PortalCall) -> impl Future<Output = Result<OwnedObjectPath>> + Send;

    /// Calls `Close` on a session object.
    fn close_session(&self, session: &OwnedObjectPath) -> impl Future<Output = Result<()>> + Send;

    /// Asks the portal for a PipeWire remote restricted to the session's streams.
    fn open_pipewire_remote(
        &self,
        session: &OwnedObjectPath,
    ) -> impl Future<Output = Result<OwnedFd>> + Send;

    /// Installs a subscription. Signals are queued from the moment this returns.
    fn subscribe(&self, filter: SignalFilter) -> impl Future<Output = Result<SignalStream>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(p).unwrap()
    }

    #[test]
    fn token_key_depends_on_method() {
        let create = PortalCall::CreateSession {
            options: Options::new(),
        };
        let start = PortalCall::Start {
            session: path("/org/freedesktop/portal/desktop/session/1_42/s"),
            parent_window: String::new(),
            options: Options::new(),
        };
        assert_eq!(create.token_key(), "session_handle_token");
        assert_eq!(start.token_key(), "handle_token");
    }

    #[test]
    fn insert_token_touches_a_single_key() {
        let mut call = PortalCall::SelectSources {
            session: path("/org/freedesktop/portal/desktop/session/1_42/s"),
            options: Options::new(),
        };
        call.insert_token(&Token::from("abcdefgh"));

        let options = call.options();
        assert_eq!(options.len(), 1);
        let value = String::try_from(options["handle_token"].try_clone().unwrap()).unwrap();
        assert_eq!(value, "abcdefgh");
    }

    #[test]
    fn response_filter_requires_a_child_path() {
        let filter = SignalFilter::all_requests();
        let inside = PortalSignal::Response {
            handle: path("/org/freedesktop/portal/desktop/request/1_42/abc"),
            response: Response::new(0, Results::new()),
        };
        let sibling = PortalSignal::Response {
            handle: path("/org/freedesktop/portal/desktop/requests"),
            response: Response::new(0, Results::new()),
        };
        assert!(filter.matches(&inside));
        assert!(!filter.matches(&sibling));
    }
}
