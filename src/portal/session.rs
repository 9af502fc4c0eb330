//! ScreenCast session negotiation.
//!
//! `Idle → SessionCreated → SourcesSelected → Started`, with `Closed`
//! reachable from every state. Each step is a single portal request; a
//! failed step tears the session down and the negotiation does not retry.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use zbus::zvariant::{OwnedFd, OwnedObjectPath, OwnedValue, Value};

use crate::error::{PortalError, Result};
use crate::portal::{
    parse_streams, DispatchLoop, LoopExit, Options, PortalBus, PortalCall, PortalSignal,
    RequestCorrelator, Results, SignalFilter, StopHandle, StreamDescriptor, SOURCE_TYPE_WINDOW,
};

/// Negotiation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    SessionCreated,
    SourcesSelected,
    Started,
    Closed,
}

/// How a watched session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The portal emitted `Closed`.
    Closed,
    /// The subscription ended first.
    Disconnected,
}

/// Caller-tunable parts of the negotiation.
#[derive(Debug, Clone, Default)]
pub struct NegotiationOptions {
    /// Window identifier the portal dialog is parented to.
    pub parent_window: String,
    /// Forwarded as `cursor_mode` to `SelectSources` when set.
    pub cursor_mode: Option<u32>,
}

/// Drives one ScreenCast session from creation to close.
pub struct Negotiator<B> {
    correlator: RequestCorrelator<B>,
    options: NegotiationOptions,
    state: NegotiationState,
    session: Option<OwnedObjectPath>,
    closed_tx: watch::Sender<Option<SessionEnd>>,
    closed_rx: watch::Receiver<Option<SessionEnd>>,
    closed_listener: Option<StopHandle>,
}

impl<B: PortalBus> Negotiator<B> {
    pub async fn new(bus: Arc<B>, options: NegotiationOptions) -> Result<Self> {
        let correlator = RequestCorrelator::new(bus).await?;
        let (closed_tx, closed_rx) = watch::channel(None);

        Ok(Self {
            correlator,
            options,
            state: NegotiationState::Idle,
            session: None,
            closed_tx,
            closed_rx,
            closed_listener: None,
        })
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Object path of the live session, if any.
    pub fn session(&self) -> Option<&OwnedObjectPath> {
        self.session.as_ref()
    }

    pub fn correlator(&self) -> &RequestCorrelator<B> {
        &self.correlator
    }

    /// Runs the full negotiation and returns the first negotiated stream.
    pub async fn negotiate(&mut self) -> Result<StreamDescriptor> {
        self.create_session().await?;
        self.select_sources().await?;
        self.start().await
    }

    pub async fn create_session(&mut self) -> Result<()> {
        self.expect_state(NegotiationState::Idle, NegotiationState::SessionCreated)?;

        let results = self
            .request(PortalCall::CreateSession {
                options: Options::new(),
            })
            .await?;

        let session = match session_handle(&results) {
            Ok(session) => session,
            Err(err) => {
                self.state = NegotiationState::Closed;
                return Err(err);
            }
        };
        info!(session = %session, "Session created");

        if let Err(err) = self.watch_closed(&session).await {
            warn!(session = %session, ?err, "Cannot observe session, closing it");
            self.session = Some(session);
            self.close().await;
            return Err(err);
        }

        self.session = Some(session);
        self.state = NegotiationState::SessionCreated;
        Ok(())
    }

    /// Restricts the session to window sources.
    pub async fn select_sources(&mut self) -> Result<()> {
        self.expect_state(
            NegotiationState::SessionCreated,
            NegotiationState::SourcesSelected,
        )?;
        let session = self.current_session()?;

        let mut options = Options::new();
        options.insert("types".to_string(), OwnedValue::from(SOURCE_TYPE_WINDOW));
        options.insert("multiple".to_string(), OwnedValue::from(false));
        if let Some(cursor_mode) = self.options.cursor_mode {
            options.insert("cursor_mode".to_string(), OwnedValue::from(cursor_mode));
        }

        self.request(PortalCall::SelectSources { session, options })
            .await?;

        self.state = NegotiationState::SourcesSelected;
        Ok(())
    }

    /// Starts the session and returns its first stream.
    pub async fn start(&mut self) -> Result<StreamDescriptor> {
        self.expect_state(NegotiationState::SourcesSelected, NegotiationState::Started)?;
        let session = self.current_session()?;

        let results = self
            .request(PortalCall::Start {
                session,
                parent_window: self.options.parent_window.clone(),
                options: Options::new(),
            })
            .await?;

        let descriptor = match parse_streams(&results).map(|streams| streams.into_iter().next()) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return Err(self.abort(PortalError::MissingStream).await),
            Err(err) => return Err(self.abort(err).await),
        };

        info!(node_id = descriptor.node_id, "Session started");
        self.state = NegotiationState::Started;
        Ok(descriptor)
    }

    /// Requests a PipeWire remote for the started session.
    pub async fn open_pipewire_remote(&self) -> Result<OwnedFd> {
        let session = self.current_session()?;
        self.correlator.bus().open_pipewire_remote(&session).await
    }

    /// Closes the session. Does nothing when there is none.
    pub async fn close(&mut self) {
        if let Some(listener) = self.closed_listener.take() {
            listener.stop();
        }
        self.state = NegotiationState::Closed;

        let Some(session) = self.session.take() else {
            return;
        };

        info!(session = %session, "Closing session");
        if let Err(err) = self.correlator.bus().close_session(&session).await {
            warn!(session = %session, ?err, "Failed to close session (may already be closed)");
        }
    }

    /// Waits until the portal closes the session.
    ///
    /// Returns immediately when no session is active, and fails with
    /// [`PortalError::BusDisconnected`] when the session can no longer be
    /// observed.
    pub async fn wait_closed(&mut self) -> Result<()> {
        let end = match self.session {
            Some(_) => self.next_end().await,
            None => SessionEnd::Closed,
        };
        self.mark_closed();

        match end {
            SessionEnd::Closed => Ok(()),
            SessionEnd::Disconnected => Err(PortalError::BusDisconnected),
        }
    }

    async fn next_end(&self) -> SessionEnd {
        let mut closed = self.closed_rx.clone();
        let end = closed.wait_for(Option::is_some).await.ok().and_then(|end| *end);
        end.unwrap_or(SessionEnd::Disconnected)
    }

    async fn request(&mut self, call: PortalCall) -> Result<Results> {
        let outcome = tokio::select! {
            result = self.correlator.request(call) => Ok(result),
            end = self.next_end() => Err(end),
        };

        match outcome {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(err)) if err.closes_session() => Err(self.abort(err).await),
            Ok(Err(err)) => Err(err),
            Err(SessionEnd::Closed) => {
                warn!("Session closed by the portal during negotiation");
                self.mark_closed();
                Err(PortalError::SessionClosedEarly)
            }
            Err(SessionEnd::Disconnected) => {
                warn!("Lost the bus during negotiation");
                self.mark_closed();
                Err(PortalError::BusDisconnected)
            }
        }
    }

    async fn abort(&mut self, err: PortalError) -> PortalError {
        warn!(%err, "Negotiation failed");
        self.close().await;
        err
    }

    fn mark_closed(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(session = %session, "Session cleared");
        }
        if let Some(listener) = self.closed_listener.take() {
            listener.stop();
        }
        self.state = NegotiationState::Closed;
    }

    async fn watch_closed(&mut self, session: &OwnedObjectPath) -> Result<()> {
        let signals = self
            .correlator
            .bus()
            .subscribe(SignalFilter::Closed {
                session: session.clone(),
            })
            .await?;

        let dispatch = DispatchLoop::new(signals);
        self.closed_listener = Some(dispatch.stop_handle());
        let closed_tx = self.closed_tx.clone();
        tokio::spawn(async move {
            let exit = dispatch
                .run(|signal| match signal {
                    PortalSignal::Closed { session, details } => {
                        info!(session = %session, ?details, "Session closed by the portal");
                        closed_tx.send_replace(Some(SessionEnd::Closed));
                        ControlFlow::Break(())
                    }
                    PortalSignal::Response { .. } => ControlFlow::Continue(()),
                })
                .await;

            if exit == LoopExit::Disconnected {
                warn!("Closed subscription ended, the bus connection is gone");
                closed_tx.send_replace(Some(SessionEnd::Disconnected));
            }
        });
        Ok(())
    }

    fn expect_state(&self, expected: NegotiationState, to: NegotiationState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PortalError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    fn current_session(&self) -> Result<OwnedObjectPath> {
        self.session
            .clone()
            .ok_or(PortalError::SessionClosedEarly)
    }
}

/// Reads `session_handle` from a `CreateSession` response.
fn session_handle(results: &Results) -> Result<OwnedObjectPath> {
    let value = results
        .get("session_handle")
        .ok_or(PortalError::MissingSessionHandle)?;

    // The frontend sends a string, some implementations an object path.
    match &**value {
        Value::ObjectPath(path) => Ok(OwnedObjectPath::from(path.clone())),
        Value::Str(path) => OwnedObjectPath::try_from(path.as_str()).map_err(|source| {
            PortalError::InvalidPath {
                path: path.to_string(),
                source,
            }
        }),
        _ => Err(PortalError::Decode {
            what: "session_handle",
            source: zbus::zvariant::Error::IncorrectType,
        }),
    }
}
