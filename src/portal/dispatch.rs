//! Cooperative loop delivering subscribed signals to a handler.

use std::ops::ControlFlow;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::debug;

use crate::portal::{PortalSignal, SignalStream};

/// Why [`DispatchLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// [`StopHandle::stop`] was called.
    Stopped,
    /// The handler asked to stop.
    Handled,
    /// The subscription ended, usually because the connection went away.
    Disconnected,
}

/// Cloneable handle that stops a running [`DispatchLoop`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests the loop to stop. Safe to call more than once.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Delivers every signal of one subscription to a handler until stopped.
pub struct DispatchLoop {
    signals: SignalStream,
    stop: StopHandle,
}

impl DispatchLoop {
    pub fn new(signals: SignalStream) -> Self {
        Self {
            signals,
            stop: StopHandle::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs until stopped, until `handler` breaks, or until the stream ends.
    pub async fn run<F>(mut self, mut handler: F) -> LoopExit
    where
        F: FnMut(PortalSignal) -> ControlFlow<()>,
    {
        let mut stopped = self.stop.tx.subscribe();

        let exit = loop {
            if *stopped.borrow_and_update() {
                break LoopExit::Stopped;
            }

            tokio::select! {
                biased;
                _ = stopped.changed() => {}
                signal = self.signals.next() => match signal {
                    Some(signal) => {
                        if handler(signal).is_break() {
                            self.stop.stop();
                            break LoopExit::Handled;
                        }
                    }
                    None => break LoopExit::Disconnected,
                },
            }
        };

        debug!(?exit, "Dispatch loop finished");
        exit
    }
}
