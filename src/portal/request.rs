//! Correlation of portal method calls with their `Response` signals.
//!
//! A single router subscription receives every `Response` below
//! [`REQUEST_PATH_PREFIX`](crate::portal::REQUEST_PATH_PREFIX). It is
//! installed before the first call, so a response can never slip past
//! between the method reply and the caller starting to wait. Each call
//! registers a one-shot channel under the handle the portal returned and
//! awaits only that channel.

use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use zbus::zvariant::OwnedObjectPath;

use crate::error::{PortalError, Result};
use crate::portal::{
    DispatchLoop, PortalBus, PortalCall, PortalSignal, Response, Results, SignalFilter,
    StopHandle, Token, TokenGenerator, REQUEST_PATH_PREFIX,
};

/// Turns a unique bus name into an object path segment.
///
/// The leading `:` is dropped and every other `.` or `:` becomes `_`.
pub fn sanitize_unique_name(unique_name: &str) -> String {
    unique_name
        .strip_prefix(':')
        .unwrap_or(unique_name)
        .chars()
        .map(|ch| if ch == '.' || ch == ':' { '_' } else { ch })
        .collect()
}

/// Request handle the portal is expected to use for `token`.
pub fn predict_request_handle(unique_name: &str, token: &Token) -> Result<OwnedObjectPath> {
    let path = format!(
        "{REQUEST_PATH_PREFIX}/{}/{token}",
        sanitize_unique_name(unique_name)
    );
    OwnedObjectPath::try_from(path.as_str()).map_err(|source| PortalError::InvalidPath {
        path,
        source,
    })
}

/// Finished handles remembered to drop late duplicates.
const COMPLETED_LIMIT: usize = 64;
/// Responses kept for handles nobody has registered yet.
const UNCLAIMED_LIMIT: usize = 16;

#[derive(Default)]
struct Table {
    waiting: HashMap<OwnedObjectPath, oneshot::Sender<Response>>,
    /// Responses that arrived before their handle was registered, oldest first.
    unclaimed: VecDeque<(OwnedObjectPath, Response)>,
    completed: VecDeque<OwnedObjectPath>,
    shut_down: bool,
}

impl Table {
    fn complete(&mut self, handle: OwnedObjectPath) {
        if self.completed.len() == COMPLETED_LIMIT {
            self.completed.pop_front();
        }
        self.completed.push_back(handle);
    }

    fn take_unclaimed(&mut self, handle: &OwnedObjectPath) -> Option<Response> {
        let index = self.unclaimed.iter().position(|(h, _)| h == handle)?;
        self.unclaimed.remove(index).map(|(_, response)| response)
    }

    fn buffer(&mut self, handle: OwnedObjectPath, response: Response) {
        if self.unclaimed.len() == UNCLAIMED_LIMIT {
            if let Some((dropped, _)) = self.unclaimed.pop_front() {
                warn!(request = %dropped, "Discarding unclaimed response");
            }
        }
        self.unclaimed.push_back((handle, response));
    }
}

/// Handle → completion channel map shared with the router.
#[derive(Clone, Default)]
pub struct PendingRequests {
    table: Arc<Mutex<Table>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `handle` and returns the slot its response will arrive in.
    ///
    /// Dropping the slot before the response arrives unregisters the handle.
    pub fn register(&self, handle: &OwnedObjectPath) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let slot = PendingResponse {
            rx,
            handle: handle.clone(),
            pending: self.clone(),
        };

        let mut table = self.lock();
        if table.shut_down {
            return slot;
        }
        match table.take_unclaimed(handle) {
            Some(response) => {
                debug!(request = %handle, "Response arrived before registration");
                let _ = tx.send(response);
                table.complete(handle.clone());
            }
            None => {
                table.waiting.insert(handle.clone(), tx);
            }
        }
        slot
    }

    /// Completes the request waiting on `handle`.
    ///
    /// The entry is removed, so each registered request consumes at most one
    /// response.
    pub fn resolve(&self, handle: OwnedObjectPath, response: Response) {
        let mut table = self.lock();
        match table.waiting.remove(&handle) {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!(request = %handle, "Requester stopped waiting");
                }
                table.complete(handle);
            }
            None if table.completed.contains(&handle) => {
                warn!(request = %handle, "Dropping duplicate response");
            }
            None => {
                debug!(request = %handle, "Buffering response for unregistered request");
                table.buffer(handle, response);
            }
        }
    }

    /// Fails every waiting request and refuses new registrations.
    pub fn shut_down(&self) {
        let mut table = self.lock();
        table.shut_down = true;
        table.waiting.clear();
        table.unclaimed.clear();
    }

    /// Drops the registration for `handle`, if any.
    ///
    /// A response arriving later for an abandoned handle is discarded.
    pub fn forget(&self, handle: &OwnedObjectPath) {
        let mut table = self.lock();
        if table.waiting.remove(handle).is_some() {
            debug!(request = %handle, "Request abandoned");
            table.complete(handle.clone());
        }
        if table.take_unclaimed(handle).is_some() {
            table.complete(handle.clone());
        }
    }

    pub fn is_waiting(&self, handle: &OwnedObjectPath) -> bool {
        self.lock().waiting.contains_key(handle)
    }

    pub fn waiting_count(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn unclaimed_count(&self) -> usize {
        self.lock().unclaimed.len()
    }
}

/// Registration for one request handle.
pub struct PendingResponse {
    rx: oneshot::Receiver<Response>,
    handle: OwnedObjectPath,
    pending: PendingRequests,
}

impl PendingResponse {
    /// Waits for the response routed to this handle.
    pub async fn recv(mut self) -> Result<Response> {
        (&mut self.rx).await.map_err(|_| PortalError::RouterStopped)
    }

    /// Takes the response if it has already been routed.
    pub fn try_recv(&mut self) -> Result<Option<Response>> {
        match self.rx.try_recv() {
            Ok(response) => Ok(Some(response)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(PortalError::RouterStopped),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.pending.forget(&self.handle);
    }
}

/// Issues portal calls and waits for their responses.
pub struct RequestCorrelator<B> {
    bus: Arc<B>,
    tokens: TokenGenerator,
    pending: PendingRequests,
    router: StopHandle,
}

impl<B: PortalBus> RequestCorrelator<B> {
    /// Subscribes to request responses and spawns the router task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(bus: Arc<B>) -> Result<Self> {
        let signals = bus.subscribe(SignalFilter::all_requests()).await?;
        let pending = PendingRequests::default();

        let dispatch = DispatchLoop::new(signals);
        let router = dispatch.stop_handle();
        let table = pending.clone();
        tokio::spawn(async move {
            dispatch
                .run(|signal| {
                    if let PortalSignal::Response { handle, response } = signal {
                        debug!(request = %handle, status = response.status, "Routing response");
                        table.resolve(handle, response);
                    }
                    ControlFlow::Continue(())
                })
                .await;
            table.shut_down();
        });

        Ok(Self {
            bus,
            tokens: TokenGenerator::new(),
            pending,
            router,
        })
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Invokes `call` and waits for its `Response`.
    ///
    /// Returns the result payload when the status is `0`; any other status is
    /// reported as [`PortalError::ResponseFailed`]. There is no timeout: the
    /// portal may be waiting on the user.
    pub async fn request(&self, mut call: PortalCall) -> Result<Results> {
        let method = call.method();
        let token = self.tokens.next();
        call.insert_token(&token);

        let predicted = match self.bus.unique_name() {
            Some(name) => Some(predict_request_handle(&name, &token)?),
            None => None,
        };

        debug!(method, %token, "Invoking portal method");
        let handle = self.bus.invoke(&call).await?;

        match &predicted {
            Some(predicted) if *predicted != handle => {
                warn!(
                    method,
                    predicted = %predicted,
                    actual = %handle,
                    "Portal returned an unexpected request handle"
                );
            }
            None => warn!(method, "Bus identity unknown, cannot verify request handle"),
            _ => {}
        }

        let response = self.pending.register(&handle).recv().await?;
        if response.status != 0 {
            warn!(method, request = %handle, status = ?response.kind(), "Request rejected");
            return Err(PortalError::ResponseFailed {
                method,
                status: response.status,
            });
        }

        info!(method, request = %handle, "Request completed");
        Ok(response.results)
    }

}

impl<B> Drop for RequestCorrelator<B> {
    fn drop(&mut self) {
        self.router.stop();
    }
}
