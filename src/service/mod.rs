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

//! Server and client engines plus the ambient pieces they share: errors,
//! configuration, logging and the I/O runtime.

pub use app_error::{AppError, AppResult, ErrorKind};
pub use client::{
    Client, ClientDisconnectedCallback, ClientHandlers, ClientRecvCallback, ClientState,
};
pub use self::config::{
    ClientConfig, ServerConfig, TransportConfig, DEFAULT_CLIENT_HOST, DEFAULT_PORT,
    DEFAULT_SERVER_HOST,
};
pub use dispatcher::{Event, EventHandler};
pub use error_reporter::{ErrorCallback, ErrorReporter};
pub use server::{Server, ServerClientCallback, ServerHandlers, ServerRecvCallback, ServerState};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod client;
mod config;
mod dispatcher;
mod error_reporter;
pub(crate) mod runtime;
mod server;
mod shutdown;
mod tracing_config;
