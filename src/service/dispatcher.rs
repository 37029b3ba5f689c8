// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::type_name;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::runtime::{self, TaskSet};
use super::AppResult;

const DISPATCH_THREAD_NAME: &str = "cdtp-dispatch";

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete frame arrived.
    Recv(Bytes),
    /// A client was accepted (server side).
    Connect,
    /// A client went away or was removed (server side).
    Disconnect,
    /// The connection to the server is gone (client side).
    Disconnected,
}

/// Receiver of connection events; the application's callbacks sit behind it.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: Event);
}

/// Runs event handlers inline or on a per-connection dispatch thread,
/// depending on `event_blocking`.
#[derive(Debug)]
pub(crate) struct EventDispatcher {
    event_blocking: bool,
}

impl EventDispatcher {
    pub fn new(event_blocking: bool) -> Self {
        EventDispatcher { event_blocking }
    }

    /// Opens the dispatch scope of one connection. `on_drained` runs once the
    /// scope is closed and its last event has been handled.
    ///
    /// Queued scopes own an OS thread for the life of the connection; the only
    /// failure is the OS refusing to start it.
    pub fn scope<F>(
        &self,
        handler: Arc<dyn EventHandler>,
        tasks: &TaskSet,
        on_drained: F,
    ) -> AppResult<DispatchScope>
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        if self.event_blocking {
            return Ok(DispatchScope::Inline {
                handler,
                on_drained: Some(Box::new(on_drained)),
            });
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        tasks.spawn_thread(DISPATCH_THREAD_NAME, move || {
            while let Some(event) = rx.blocking_recv() {
                invoke(handler.as_ref(), event);
            }
            debug!("event dispatcher drained");
            on_drained();
        })?;
        Ok(DispatchScope::Queued { tx })
    }
}

pub(crate) enum DispatchScope {
    Inline {
        handler: Arc<dyn EventHandler>,
        on_drained: Option<Box<dyn FnOnce() + Send + Sync>>,
    },
    Queued {
        tx: mpsc::UnboundedSender<Event>,
    },
}

impl DispatchScope {
    /// Delivers `event`. Inline scopes block the caller until the handler
    /// returns; queued scopes return immediately. Never fails.
    pub fn dispatch(&self, event: Event) {
        match self {
            DispatchScope::Inline { handler, .. } => {
                let handler = handler.clone();
                runtime::in_place(move || invoke(handler.as_ref(), event));
            }
            DispatchScope::Queued { tx } => {
                if tx.send(event).is_err() {
                    debug!("event dispatcher already gone, event dropped");
                }
            }
        }
    }

    pub fn close(self) {
        match self {
            DispatchScope::Inline { on_drained, .. } => {
                if let Some(on_drained) = on_drained {
                    on_drained();
                }
            }
            DispatchScope::Queued { tx } => drop(tx),
        }
    }
}

fn get_type_name<T>(_: &T) -> &'static str {
    type_name::<T>()
}

fn invoke(handler: &dyn EventHandler, event: Event) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("event handler panicked with message: {}", message);
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("event handler panicked with message: {}", message);
        } else {
            error!(
                "event handler panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}
