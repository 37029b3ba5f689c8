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

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{error, warn};

use super::{AppError, ErrorKind};

/// Error callback, invoked with the error kind and the underlying OS error code.
pub type ErrorCallback = Arc<dyn Fn(ErrorKind, i32) + Send + Sync>;

static GLOBAL_REPORTER: OnceLock<Arc<ErrorReporter>> = OnceLock::new();

#[derive(Default)]
struct ErrorState {
    last: Option<ErrorKind>,
    underlying: i32,
    callback: Option<ErrorCallback>,
}

/// Last-error state shared by the accept, receive and send paths, plus an
/// optional error callback.
///
/// Reporting replaces the previous error. The callback runs after the state
/// has been updated and outside the lock, so it may query the reporter.
#[derive(Default)]
pub struct ErrorReporter {
    state: Mutex<ErrorState>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide reporter used by servers and clients that were not
    /// given one of their own.
    pub fn global() -> Arc<ErrorReporter> {
        GLOBAL_REPORTER
            .get_or_init(|| Arc::new(ErrorReporter::new()))
            .clone()
    }

    pub fn report(&self, kind: ErrorKind, underlying: i32) {
        let callback = {
            let mut state = self.state.lock();
            state.last = Some(kind);
            state.underlying = underlying;
            state.callback.clone()
        };
        warn!(code = kind.code(), underlying, "{}", kind);

        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(kind, underlying))).is_err() {
                error!("error callback panicked while handling {}", kind);
            }
        }
    }

    pub fn report_error(&self, err: &AppError) {
        self.report(err.kind(), err.underlying());
    }

    /// Most recently reported error kind, `None` before any error or after `clear`.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.state.lock().last
    }

    pub fn last_underlying_error(&self) -> i32 {
        self.state.lock().underlying
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().last.is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.last = None;
        state.underlying = 0;
    }

    /// Registers the error callback, replacing any previous one.
    pub fn register<F>(&self, callback: F)
    where
        F: Fn(ErrorKind, i32) + Send + Sync + 'static,
    {
        self.state.lock().callback = Some(Arc::new(callback));
    }

    pub fn clear_registration(&self) {
        self.state.lock().callback = None;
    }
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ErrorReporter")
            .field("last", &state.last)
            .field("underlying", &state.underlying)
            .field("callback", &state.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn report_overwrites_last_error() {
        let reporter = ErrorReporter::new();
        assert_eq!(reporter.last_error(), None);
        assert_eq!(reporter.last_underlying_error(), 0);

        reporter.report(ErrorKind::BindFailed, 98);
        reporter.report(ErrorKind::TableFull, 0);
        assert_eq!(reporter.last_error(), Some(ErrorKind::TableFull));
        assert_eq!(reporter.last_underlying_error(), 0);

        reporter.clear();
        assert!(!reporter.has_error());
    }

    #[test]
    fn callback_is_replaced_and_cleared() {
        let reporter = ErrorReporter::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        reporter.register(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        reporter.report(ErrorKind::SendFailed, 32);

        let counter = second.clone();
        reporter.register(move |kind, underlying| {
            assert_eq!(kind, ErrorKind::RecvFailed);
            assert_eq!(underlying, 104);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        reporter.report(ErrorKind::RecvFailed, 104);

        reporter.clear_registration();
        reporter.report(ErrorKind::RecvFailed, 104);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_query_reporter() {
        let reporter = Arc::new(ErrorReporter::new());
        let seen = Arc::new(Mutex::new(None));

        let inner = reporter.clone();
        let slot = seen.clone();
        reporter.register(move |_, _| {
            *slot.lock() = inner.last_error();
        });
        reporter.report(ErrorKind::AcceptFailed, 24);

        assert_eq!(*seen.lock(), Some(ErrorKind::AcceptFailed));
        reporter.clear_registration();
    }

    #[test]
    fn concurrent_reports() {
        let reporter = Arc::new(ErrorReporter::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        reporter.register(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let reporter = reporter.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        reporter.report(ErrorKind::SendFailed, i);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 800);
        assert_eq!(reporter.last_error(), Some(ErrorKind::SendFailed));
        assert!((0..8).contains(&reporter.last_underlying_error()));
    }
}
