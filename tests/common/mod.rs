//! In-memory portal used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use futures::channel::mpsc;
use futures::StreamExt;
use zbus::zvariant::{OwnedFd, OwnedObjectPath, OwnedValue, Str, Value};

use portal_screencast::portal::{
    predict_request_handle, PortalBus, PortalCall, PortalSignal, Response, Results,
    SignalFilter, SignalStream, Token,
};
use portal_screencast::{PortalError, Result};

pub const UNIQUE_NAME: &str = ":1.42";
pub const SESSION_PATH: &str = "/org/freedesktop/portal/desktop/session/1_42/portal";

/// How the fake answers the next method call.
pub enum Reply {
    /// Emit a `Response` with this status and payload.
    Respond { status: u32, results: Results },
    /// Accept the call and never answer.
    Silent,
    /// Accept the call, then close the session instead of answering.
    CloseSession,
    /// Fail the method call itself.
    Fail,
}

#[derive(Debug)]
pub struct RecordedCall {
    pub method: &'static str,
    pub token_key: &'static str,
    pub token: String,
    pub handle: OwnedObjectPath,
    pub session: Option<OwnedObjectPath>,
    pub types: Option<u32>,
    pub option_count: usize,
}

#[derive(Default)]
struct State {
    replies: VecDeque<Reply>,
    subscribers: Vec<(SignalFilter, mpsc::UnboundedSender<PortalSignal>)>,
    calls: Vec<RecordedCall>,
    closed_sessions: Vec<OwnedObjectPath>,
    remotes_opened: usize,
    fail_closed_subscription: bool,
    end_closed_subscription: bool,
    foreign_handles: bool,
}

pub struct FakePortal {
    state: Mutex<State>,
}

impl FakePortal {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            state: Mutex::new(State {
                replies: replies.into(),
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Answer with request handles that do not follow the token convention.
    pub fn with_foreign_handles(self) -> Self {
        self.lock().foreign_handles = true;
        self
    }

    pub fn failing_closed_subscription(self) -> Self {
        self.lock().fail_closed_subscription = true;
        self
    }

    /// `Closed` subscriptions end at once, as when the connection drops.
    pub fn ending_closed_subscription(self) -> Self {
        self.lock().end_closed_subscription = true;
        self
    }

    /// Delivers `signal` to the first live subscription matching it.
    pub fn emit(&self, signal: PortalSignal) {
        let mut state = self.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        if let Some((_, tx)) = state
            .subscribers
            .iter()
            .find(|(filter, _)| filter.matches(&signal))
        {
            let _ = tx.unbounded_send(signal);
        }
    }

    pub fn close_from_portal(&self) {
        self.emit(PortalSignal::Closed {
            session: path(SESSION_PATH),
            details: Results::new(),
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.method.to_string()).collect()
    }

    pub fn with_calls<R>(&self, f: impl FnOnce(&[RecordedCall]) -> R) -> R {
        f(&self.lock().calls)
    }

    pub fn closed_sessions(&self) -> Vec<OwnedObjectPath> {
        self.lock().closed_sessions.clone()
    }

    pub fn remotes_opened(&self) -> usize {
        self.lock().remotes_opened
    }
}

impl PortalBus for FakePortal {
    fn unique_name(&self) -> Option<String> {
        Some(UNIQUE_NAME.to_string())
    }

    async fn invoke(&self, call: &PortalCall) -> Result<OwnedObjectPath> {
        let reply = self.lock().replies.pop_front().unwrap_or(Reply::Silent);
        if let Reply::Fail = reply {
            return Err(PortalError::RemoteCall {
                method: call.method(),
                source: zbus::Error::Failure("no such method".to_string()),
            });
        }

        let token = String::try_from(
            call.options()
                .get(call.token_key())
                .expect("token injected")
                .try_clone()
                .unwrap(),
        )
        .unwrap();

        let handle = if self.lock().foreign_handles {
            path(&format!("/org/freedesktop/portal/desktop/request/elsewhere/{token}"))
        } else {
            predict_request_handle(UNIQUE_NAME, &Token::from(token.as_str())).unwrap()
        };

        let (session, types) = match call {
            PortalCall::CreateSession { .. } => (None, None),
            PortalCall::SelectSources { session, options } => (
                Some(session.clone()),
                options.get("types").and_then(|v| u32::try_from(v).ok()),
            ),
            PortalCall::Start { session, .. } => (Some(session.clone()), None),
        };

        self.lock().calls.push(RecordedCall {
            method: call.method(),
            token_key: call.token_key(),
            token,
            handle: handle.clone(),
            session,
            types,
            option_count: call.options().len(),
        });

        match reply {
            Reply::Respond { status, results } => self.emit(PortalSignal::Response {
                handle: handle.clone(),
                response: Response::new(status, results),
            }),
            Reply::CloseSession => self.close_from_portal(),
            Reply::Silent | Reply::Fail => {}
        }

        Ok(handle)
    }

    async fn close_session(&self, session: &OwnedObjectPath) -> Result<()> {
        self.lock().closed_sessions.push(session.clone());
        Ok(())
    }

    async fn open_pipewire_remote(&self, _session: &OwnedObjectPath) -> Result<OwnedFd> {
        self.lock().remotes_opened += 1;
        let file = std::fs::File::open("/dev/null")?;
        Ok(OwnedFd::from(std::os::fd::OwnedFd::from(file)))
    }

    async fn subscribe(&self, filter: SignalFilter) -> Result<SignalStream> {
        let mut state = self.lock();
        if state.fail_closed_subscription && matches!(filter, SignalFilter::Closed { .. }) {
            return Err(PortalError::Subscription {
                what: format!("{filter:?}"),
                source: zbus::Error::Failure("match rule rejected".to_string()),
            });
        }

        if state.end_closed_subscription && matches!(filter, SignalFilter::Closed { .. }) {
            return Ok(futures::stream::empty().boxed());
        }

        let (tx, rx) = mpsc::unbounded();
        state.subscribers.push((filter, tx));
        Ok(rx.boxed())
    }
}

pub fn path(value: &str) -> OwnedObjectPath {
    OwnedObjectPath::try_from(value).unwrap()
}

pub fn string(value: &str) -> OwnedValue {
    OwnedValue::from(Str::from(value.to_string()))
}

pub fn ok(results: Results) -> Reply {
    Reply::Respond { status: 0, results }
}

pub fn rejected(status: u32) -> Reply {
    Reply::Respond {
        status,
        results: Results::new(),
    }
}

/// `CreateSession` response carrying [`SESSION_PATH`].
pub fn session_created() -> Reply {
    let mut results = Results::new();
    results.insert("session_handle".to_string(), string(SESSION_PATH));
    ok(results)
}

/// `Start` response carrying the given `(node_id, properties)` streams.
pub fn started(streams: Vec<(u32, HashMap<String, OwnedValue>)>) -> Reply {
    let mut results = Results::new();
    results.insert(
        "streams".to_string(),
        OwnedValue::try_from(Value::new(streams)).unwrap(),
    );
    ok(results)
}
