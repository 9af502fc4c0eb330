//! ScreenCast D-Bus client for the desktop portal frontend.
//!
//! This module speaks to `org.freedesktop.portal.ScreenCast` and turns the
//! `Request::Response` and `Session::Closed` signals into [`PortalSignal`]s.

use std::collections::HashMap;

use futures::{future, StreamExt};
use tracing::{debug, warn};
use zbus::message::Type as MessageType;
use zbus::zvariant::{ObjectPath, OwnedFd, OwnedObjectPath, OwnedValue};
use zbus::{MatchRule, Message, MessageStream, OwnedMatchRule, Result};

use crate::desktop_client::DesktopClient;
use crate::error::PortalError;
use crate::portal::{
    PortalBus, PortalCall, PortalSignal, Response, Results, SignalFilter, SignalStream,
    REQUEST_INTERFACE, SESSION_INTERFACE,
};

/// Signals buffered per subscription before the oldest ones are dropped.
const SIGNAL_QUEUE_LEN: usize = 64;

/// D-Bus proxy for `org.freedesktop.portal.ScreenCast`.
#[zbus::proxy(
    interface = "org.freedesktop.portal.ScreenCast",
    default_service = "org.freedesktop.portal.Desktop",
    default_path = "/org/freedesktop/portal/desktop"
)]
trait ScreenCast {
    /// Creates a screencast session; the session handle arrives in the response.
    async fn create_session(
        &self,
        options: &HashMap<String, OwnedValue>,
    ) -> Result<OwnedObjectPath>;

    /// Configures which kinds of sources the user may pick.
    async fn select_sources(
        &self,
        session_handle: &ObjectPath<'_>,
        options: &HashMap<String, OwnedValue>,
    ) -> Result<OwnedObjectPath>;

    /// Shows the selection dialog and starts the chosen streams.
    async fn start(
        &self,
        session_handle: &ObjectPath<'_>,
        parent_window: &str,
        options: &HashMap<String, OwnedValue>,
    ) -> Result<OwnedObjectPath>;

    /// Opens a PipeWire remote limited to the session's streams.
    async fn open_pipe_wire_remote(
        &self,
        session_handle: &ObjectPath<'_>,
        options: &HashMap<String, OwnedValue>,
    ) -> Result<OwnedFd>;

    #[zbus(property)]
    fn available_source_types(&self) -> Result<u32>;

    #[zbus(property)]
    fn available_cursor_modes(&self) -> Result<u32>;

    #[zbus(property)]
    fn version(&self) -> Result<u32>;
}

/// D-Bus proxy for `org.freedesktop.portal.Session`.
#[zbus::proxy(
    interface = "org.freedesktop.portal.Session",
    default_service = "org.freedesktop.portal.Desktop"
)]
trait Session {
    /// Closes the session.
    async fn close(&self) -> Result<()>;
}

/// Properties advertised by the ScreenCast interface.
#[derive(Debug, Clone, Copy)]
pub struct ScreenCastCapabilities {
    pub version: u32,
    pub source_types: u32,
    pub cursor_modes: u32,
}

impl DesktopClient {
    /// Reads the ScreenCast interface properties.
    pub async fn screencast_capabilities(&self) -> Result<ScreenCastCapabilities> {
        let proxy = ScreenCastProxy::new(&self.connection).await?;
        Ok(ScreenCastCapabilities {
            version: proxy.version().await?,
            source_types: proxy.available_source_types().await?,
            cursor_modes: proxy.available_cursor_modes().await?,
        })
    }
}

impl PortalBus for DesktopClient {
    fn unique_name(&self) -> Option<String> {
        self.connection.unique_name().map(|name| name.to_string())
    }

    async fn invoke(&self, call: &PortalCall) -> crate::error::Result<OwnedObjectPath> {
        let method = call.method();
        let remote_err = |source: zbus::Error| PortalError::RemoteCall { method, source };

        let proxy = ScreenCastProxy::new(&self.connection)
            .await
            .map_err(remote_err)?;

        debug!(method, options = ?call.options(), "Calling ScreenCast method");
        let handle = match call {
            PortalCall::CreateSession { options } => proxy.create_session(options).await,
            PortalCall::SelectSources { session, options } => {
                proxy.select_sources(session, options).await
            }
            PortalCall::Start {
                session,
                parent_window,
                options,
            } => proxy.start(session, parent_window, options).await,
        }
        .map_err(remote_err)?;

        debug!(method, request = %handle, "Portal accepted request");
        Ok(handle)
    }

    async fn close_session(&self, session: &OwnedObjectPath) -> crate::error::Result<()> {
        let remote_err = |source: zbus::Error| PortalError::RemoteCall {
            method: "Close",
            source,
        };

        let proxy = SessionProxy::builder(&self.connection)
            .path(session)
            .map_err(remote_err)?
            .build()
            .await
            .map_err(remote_err)?;

        debug!(%session, "Closing portal session");
        proxy.close().await.map_err(remote_err)
    }

    async fn open_pipewire_remote(
        &self,
        session: &OwnedObjectPath,
    ) -> crate::error::Result<OwnedFd> {
        let remote_err = |source: zbus::Error| PortalError::RemoteCall {
            method: "OpenPipeWireRemote",
            source,
        };

        let proxy = ScreenCastProxy::new(&self.connection)
            .await
            .map_err(remote_err)?;

        let fd = proxy
            .open_pipe_wire_remote(session, &HashMap::new())
            .await
            .map_err(remote_err)?;
        debug!(%session, "Received PipeWire remote FD");
        Ok(fd)
    }

    async fn subscribe(&self, filter: SignalFilter) -> crate::error::Result<SignalStream> {
        let subscription_err = |source: zbus::Error| PortalError::Subscription {
            what: format!("{filter:?}"),
            source,
        };

        let rule = match_rule(&filter).map_err(subscription_err)?;
        let messages =
            MessageStream::for_match_rule(rule, &self.connection, Some(SIGNAL_QUEUE_LEN))
                .await
                .map_err(subscription_err)?;

        debug!(?filter, "Signal subscription installed");
        Ok(messages
            .filter_map(move |message| future::ready(decode_signal(&filter, message)))
            .boxed())
    }
}

fn match_rule(filter: &SignalFilter) -> Result<OwnedMatchRule> {
    let builder = MatchRule::builder().msg_type(MessageType::Signal);
    let rule = match filter {
        SignalFilter::Responses { namespace } => builder
            .interface(REQUEST_INTERFACE)?
            .member("Response")?
            .path_namespace(namespace.as_str())?
            .build(),
        SignalFilter::Closed { session } => builder
            .interface(SESSION_INTERFACE)?
            .member("Closed")?
            .path(session.as_str())?
            .build(),
    };
    Ok(rule.into())
}

fn decode_signal(filter: &SignalFilter, message: Result<Message>) -> Option<PortalSignal> {
    let message = match message {
        Ok(message) => message,
        Err(err) => {
            warn!(?err, "Dropping unreadable message");
            return None;
        }
    };

    let header = message.header();
    let path = OwnedObjectPath::from(header.path()?.clone());
    let body = message.body();

    let signal = match filter {
        SignalFilter::Responses { .. } => match body.deserialize::<(u32, Results)>() {
            Ok((status, results)) => PortalSignal::Response {
                handle: path,
                response: Response::new(status, results),
            },
            Err(err) => {
                warn!(request = %path, ?err, "Malformed Response signal");
                return None;
            }
        },
        SignalFilter::Closed { .. } => PortalSignal::Closed {
            details: body.deserialize::<Results>().unwrap_or_default(),
            session: path,
        },
    };

    filter.matches(&signal).then_some(signal)
}
