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

#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cdtp::{
    setup_local_tracing, Client, ClientConfig, ClientHandlers, ClientId, ErrorReporter, Server,
    ServerConfig, ServerHandlers,
};
use rstest::fixture;

pub const TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait before concluding that an event did not happen.
pub const QUIET: Duration = Duration::from_millis(200);

/// Installs console logging once per test binary. `false` if a subscriber
/// was already installed.
#[fixture]
#[once]
pub fn logging() -> bool {
    setup_local_tracing().is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connect(ClientId),
    Recv(ClientId, Vec<u8>),
    Disconnect(ClientId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Recv(Vec<u8>),
    Disconnected,
}

pub fn server_handlers(tx: Sender<ServerEvent>) -> ServerHandlers {
    let on_recv = tx.clone();
    let on_connect = tx.clone();
    ServerHandlers::new()
        .on_recv(move |client_id, data| {
            let _ = on_recv.send(ServerEvent::Recv(client_id, data.to_vec()));
        })
        .on_connect(move |client_id| {
            let _ = on_connect.send(ServerEvent::Connect(client_id));
        })
        .on_disconnect(move |client_id| {
            let _ = tx.send(ServerEvent::Disconnect(client_id));
        })
}

pub fn client_handlers(tx: Sender<ClientEvent>) -> ClientHandlers {
    let on_recv = tx.clone();
    ClientHandlers::new()
        .on_recv(move |data| {
            let _ = on_recv.send(ClientEvent::Recv(data.to_vec()));
        })
        .on_disconnected(move || {
            let _ = tx.send(ClientEvent::Disconnected);
        })
}

/// A server listening on an ephemeral loopback port, with its own reporter.
pub struct TestServer {
    pub server: Arc<Server>,
    pub events: Receiver<ServerEvent>,
    pub errors: Arc<ErrorReporter>,
}

impl TestServer {
    pub fn start(config: ServerConfig) -> TestServer {
        let (tx, events) = mpsc::channel();
        let errors = Arc::new(ErrorReporter::new());
        let server = Server::with_reporter(config, server_handlers(tx), errors.clone())
            .expect("create server");
        server.start("127.0.0.1", 0).expect("start server");
        TestServer {
            server: Arc::new(server),
            events,
            errors,
        }
    }

    pub fn port(&self) -> u16 {
        self.server.port().expect("server is bound")
    }

    pub fn next_event(&self) -> ServerEvent {
        self.events
            .recv_timeout(TIMEOUT)
            .expect("server event within timeout")
    }

    pub fn assert_quiet(&self) {
        if let Ok(event) = self.events.recv_timeout(QUIET) {
            panic!("unexpected server event: {:?}", event);
        }
    }
}

pub struct TestClient {
    pub client: Client,
    pub events: Receiver<ClientEvent>,
    pub errors: Arc<ErrorReporter>,
}

impl TestClient {
    pub fn new(config: ClientConfig) -> TestClient {
        let (tx, events) = mpsc::channel();
        let errors = Arc::new(ErrorReporter::new());
        let client = Client::with_reporter(config, client_handlers(tx), errors.clone())
            .expect("create client");
        TestClient {
            client,
            events,
            errors,
        }
    }

    pub fn connect(config: ClientConfig, port: u16) -> TestClient {
        let test_client = TestClient::new(config);
        test_client
            .client
            .connect("127.0.0.1", port)
            .expect("connect client");
        test_client
    }

    pub fn next_event(&self) -> ClientEvent {
        self.events
            .recv_timeout(TIMEOUT)
            .expect("client event within timeout")
    }

    pub fn assert_quiet(&self) {
        if let Ok(event) = self.events.recv_timeout(QUIET) {
            panic!("unexpected client event: {:?}", event);
        }
    }
}

/// Polls `condition` until it holds or `TIMEOUT` elapses.
pub fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Encodes `payload` the way it travels on the wire.
pub fn wire_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}
