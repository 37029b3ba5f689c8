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

//! Process-wide I/O runtime and the task bookkeeping built on it.
//!
//! Every server and client shares one multi-threaded tokio runtime, created on
//! first use. Receive loops and the accept loop are tokio tasks; queued
//! callbacks run on dedicated OS threads, one per connection, so they never
//! compete with `block_in_place` for the runtime's blocking pool.
//! The public API is synchronous, so async work is driven through
//! [`block_on`], which is safe to call from plain threads, from dispatch
//! threads, and from inside inline callbacks running on a worker.

use std::any::{type_name, Any};
use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;

use parking_lot::{const_mutex, Mutex};
use tokio::runtime::{self, Runtime};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error};

use super::{AppError, AppResult, ErrorKind};

static IO_RUNTIME: OnceLock<Runtime> = OnceLock::new();
static IO_RUNTIME_INIT: Mutex<()> = const_mutex(());

static NEXT_TASK_KEY: AtomicU64 = AtomicU64::new(1);

pub(crate) type TaskKey = u64;

tokio::task_local! {
    static ASYNC_TASK: TaskKey;
}

thread_local! {
    static BLOCKING_TASK: Cell<Option<TaskKey>> = const { Cell::new(None) };
}

/// Returns the shared runtime, building it on first call.
///
/// Concurrent first calls race safely: exactly one runtime is built.
pub(crate) fn io_runtime() -> AppResult<&'static Runtime> {
    if let Some(rt) = IO_RUNTIME.get() {
        return Ok(rt);
    }
    let _init = IO_RUNTIME_INIT.lock();
    if let Some(rt) = IO_RUNTIME.get() {
        return Ok(rt);
    }
    debug!("starting cdtp io runtime");
    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().max(2))
        .thread_name("cdtp-io")
        .build()
        .map_err(|err| AppError::io(ErrorKind::InitFailed, err))?;
    Ok(IO_RUNTIME.get_or_init(|| rt))
}

/// Runs `fut` to completion from synchronous code.
pub(crate) fn block_on<F: Future>(rt: &Runtime, fut: F) -> F::Output {
    tokio::task::block_in_place(|| rt.block_on(fut))
}

/// Runs blocking code `f` from wherever the caller is, including a runtime
/// worker, without stalling other tasks.
pub(crate) fn in_place<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    tokio::task::block_in_place(f)
}

/// The tracked task the calling code is running in, if any.
pub(crate) fn current_task() -> Option<TaskKey> {
    ASYNC_TASK
        .try_with(|key| *key)
        .ok()
        .or_else(|| BLOCKING_TASK.with(Cell::get))
}

struct BlockingTaskGuard;

impl BlockingTaskGuard {
    fn enter(key: TaskKey) -> Self {
        BLOCKING_TASK.with(|current| current.set(Some(key)));
        BlockingTaskGuard
    }
}

impl Drop for BlockingTaskGuard {
    fn drop(&mut self) {
        BLOCKING_TASK.with(|current| current.set(None));
    }
}

#[derive(Debug)]
enum TaskHandle {
    Async(JoinHandle<()>),
    Thread(thread::JoinHandle<()>),
}

impl TaskHandle {
    fn is_finished(&self) -> bool {
        match self {
            TaskHandle::Async(handle) => handle.is_finished(),
            TaskHandle::Thread(handle) => handle.is_finished(),
        }
    }
}

/// Tasks and threads spawned on behalf of one server or client.
///
/// Daemon sets detach what they spawn; other sets keep the handles so that
/// [`TaskSet::join_all`] can wait for them on shutdown.
#[derive(Debug)]
pub(crate) struct TaskSet {
    daemon: bool,
    handles: Mutex<Vec<(TaskKey, TaskHandle)>>,
}

impl TaskSet {
    pub fn new(daemon: bool) -> Self {
        TaskSet {
            daemon,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn<F>(&self, rt: &Runtime, fut: F) -> TaskKey
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = NEXT_TASK_KEY.fetch_add(1, Ordering::Relaxed);
        let handle = rt.spawn(ASYNC_TASK.scope(key, fut));
        self.track(key, TaskHandle::Async(handle));
        key
    }

    /// Runs `f` on a new OS thread named `name`.
    pub fn spawn_thread<F>(&self, name: &str, f: F) -> AppResult<TaskKey>
    where
        F: FnOnce() + Send + 'static,
    {
        let key = NEXT_TASK_KEY.fetch_add(1, Ordering::Relaxed);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", name, key))
            .spawn(move || {
                let _current = BlockingTaskGuard::enter(key);
                f();
            })
            .map_err(|err| AppError::io(ErrorKind::InitFailed, err))?;
        self.track(key, TaskHandle::Thread(handle));
        Ok(key)
    }

    fn track(&self, key: TaskKey, handle: TaskHandle) {
        if self.daemon {
            return;
        }
        let mut handles = self.handles.lock();
        handles.retain(|(_, handle)| !handle.is_finished());
        handles.push((key, handle));
    }

    /// Waits for every tracked task, including ones spawned while waiting.
    ///
    /// The task the caller runs in is skipped: a callback that stops its own
    /// server cannot wait for itself.
    pub fn join_all(&self, rt: &Runtime) {
        let current = current_task();
        loop {
            let pending: Vec<_> = self.handles.lock().drain(..).collect();
            if pending.is_empty() {
                break;
            }
            for (key, handle) in pending {
                if Some(key) == current {
                    continue;
                }
                match handle {
                    TaskHandle::Async(handle) => {
                        if let Err(err) = block_on(rt, handle) {
                            log_join_error(key, err);
                        }
                    }
                    TaskHandle::Thread(handle) => {
                        if let Err(payload) = in_place(|| handle.join()) {
                            log_panic(key, payload);
                        }
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

fn get_type_name<T>(_: &T) -> &'static str {
    type_name::<T>()
}

fn log_join_error(key: TaskKey, err: JoinError) {
    if !err.is_panic() {
        error!("task {} failed to complete: {}", key, err);
        return;
    }
    log_panic(key, err.into_panic());
}

fn log_panic(key: TaskKey, payload: Box<dyn Any + Send>) {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("task {} panicked with message: {}", key, message);
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("task {} panicked with message: {}", key, message);
    } else {
        error!(
            "task {} panicked with an unknown type: {}",
            key,
            get_type_name(&payload)
        );
    }
}
