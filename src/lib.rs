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

//! Message-oriented TCP transport with symmetric server and client engines.
//!
//! Every message travels as a 4-byte big-endian length followed by the
//! payload. Applications supply callbacks through [`ServerHandlers`] and
//! [`ClientHandlers`]; all public operations are synchronous.

mod network;
mod service;

pub use network::{ClientId, FrameCodec, Frames, LEN_SIZE};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, ClientConfig,
    ClientDisconnectedCallback, ClientHandlers, ClientRecvCallback, ClientState, ErrorCallback,
    ErrorKind, ErrorReporter, Event, EventHandler, Server, ServerClientCallback, ServerConfig,
    ServerHandlers, ServerRecvCallback, ServerState, TransportConfig, DEFAULT_CLIENT_HOST,
    DEFAULT_PORT, DEFAULT_SERVER_HOST,
};
