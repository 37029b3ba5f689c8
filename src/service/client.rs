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

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::network::{Connection, ConnectionHandle, FrameCodec};

use super::config::{DEFAULT_CLIENT_HOST, DEFAULT_PORT};
use super::dispatcher::{DispatchScope, Event, EventDispatcher, EventHandler};
use super::runtime::{self, TaskSet};
use super::{AppError, AppResult, ClientConfig, ErrorKind, ErrorReporter, Shutdown};

pub type ClientRecvCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type ClientDisconnectedCallback = Arc<dyn Fn() + Send + Sync>;

/// Application callbacks of a client.
#[derive(Clone, Default)]
pub struct ClientHandlers {
    on_recv: Option<ClientRecvCallback>,
    on_disconnected: Option<ClientDisconnectedCallback>,
}

impl ClientHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_recv<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.on_recv = Some(Arc::new(callback));
        self
    }

    /// Called exactly once when the connection ends, whichever side ended it.
    pub fn on_disconnected<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnected = Some(Arc::new(callback));
        self
    }
}

impl EventHandler for ClientHandlers {
    fn handle(&self, event: Event) {
        match event {
            Event::Recv(data) => {
                if let Some(on_recv) = &self.on_recv {
                    on_recv(&data);
                }
            }
            Event::Disconnected => {
                if let Some(on_disconnected) = &self.on_disconnected {
                    on_disconnected();
                }
            }
            Event::Connect | Event::Disconnect => {}
        }
    }
}

impl fmt::Debug for ClientHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandlers")
            .field("on_recv", &self.on_recv.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    NotConnected,
    Connected,
    /// Terminal: a client connects at most once.
    Disconnected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "NotConnected"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

#[derive(Default)]
struct Link {
    handle: Option<Arc<ConnectionHandle>>,
    server_addr: Option<SocketAddrV4>,
    local_addr: Option<SocketAddr>,
}

struct Established {
    connection: Connection,
    handle: Arc<ConnectionHandle>,
    scope: DispatchScope,
    local_addr: Option<SocketAddr>,
}

struct ClientShared {
    config: ClientConfig,
    state: Mutex<ClientState>,
    /// Set while a connect is in flight; the state lock is not held meanwhile.
    connecting: AtomicBool,
    link: Mutex<Link>,
    handlers: Arc<ClientHandlers>,
    errors: Arc<ErrorReporter>,
    tasks: TaskSet,
    dispatcher: EventDispatcher,
    runtime: &'static Runtime,
}

/// A TCP client exchanging length-prefixed messages with one server.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub fn new(config: ClientConfig, handlers: ClientHandlers) -> AppResult<Client> {
        Self::with_reporter(config, handlers, ErrorReporter::global())
    }

    pub fn with_reporter(
        config: ClientConfig,
        handlers: ClientHandlers,
        errors: Arc<ErrorReporter>,
    ) -> AppResult<Client> {
        let runtime = runtime::io_runtime().inspect_err(|err| errors.report_error(err))?;
        let shared = ClientShared {
            state: Mutex::new(ClientState::NotConnected),
            connecting: AtomicBool::new(false),
            link: Mutex::new(Link::default()),
            handlers: Arc::new(handlers),
            errors,
            tasks: TaskSet::new(config.daemon),
            dispatcher: EventDispatcher::new(config.event_blocking),
            runtime,
            config,
        };
        Ok(Client {
            shared: Arc::new(shared),
        })
    }

    pub fn connect(&self, host: &str, port: u16) -> AppResult<()> {
        let host = host
            .parse::<Ipv4Addr>()
            .map_err(|err| AppError::with_source(ErrorKind::InvalidAddress, err))
            .or_else(|err| self.shared.fail(err))?;
        self.connect_host(host, port)
    }

    pub fn connect_host(&self, host: Ipv4Addr, port: u16) -> AppResult<()> {
        self.shared.clone().connect(SocketAddrV4::new(host, port))
    }

    pub fn connect_default_host(&self, port: u16) -> AppResult<()> {
        self.connect_host(DEFAULT_CLIENT_HOST, port)
    }

    pub fn connect_default_port(&self, host: &str) -> AppResult<()> {
        self.connect(host, DEFAULT_PORT)
    }

    pub fn connect_host_default_port(&self, host: Ipv4Addr) -> AppResult<()> {
        self.connect_host(host, DEFAULT_PORT)
    }

    pub fn connect_default(&self) -> AppResult<()> {
        self.connect_host(DEFAULT_CLIENT_HOST, DEFAULT_PORT)
    }

    /// Closes the connection and waits for the receive loop unless it is a
    /// daemon. `on_disconnected` fires once the loop has stopped.
    pub fn disconnect(&self) -> AppResult<()> {
        self.shared.disconnect()
    }

    pub fn send(&self, data: &[u8]) -> AppResult<()> {
        self.shared.send(data)
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    pub fn connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Address of the server this client connected to.
    pub fn server_addr(&self) -> Option<SocketAddrV4> {
        self.shared.link.lock().server_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.link.lock().local_addr
    }

    pub fn host(&self) -> Option<String> {
        self.server_addr().map(|addr| addr.ip().to_string())
    }

    pub fn port(&self) -> Option<u16> {
        self.server_addr().map(|addr| addr.port())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn errors(&self) -> &Arc<ErrorReporter> {
        &self.shared.errors
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.shared.errors.last_error()
    }

    pub fn last_underlying_error(&self) -> i32 {
        self.shared.errors.last_underlying_error()
    }

    /// Replaces the error callback of this instance's reporter.
    pub fn register_error_callback<F>(&self, callback: F)
    where
        F: Fn(ErrorKind, i32) + Send + Sync + 'static,
    {
        self.shared.errors.register(callback);
    }

    pub fn clear_error_callback(&self) {
        self.shared.errors.clear_registration();
    }
}

impl ClientShared {
    fn fail<T>(&self, err: AppError) -> AppResult<T> {
        self.errors.report_error(&err);
        Err(err)
    }

    fn connect(self: Arc<Self>, addr: SocketAddrV4) -> AppResult<()> {
        let admitted = match *self.state.lock() {
            ClientState::Connected => Err(ErrorKind::AlreadyConnected),
            ClientState::Disconnected => Err(ErrorKind::CannotReconnect),
            ClientState::NotConnected if self.connecting.swap(true, Ordering::AcqRel) => {
                Err(ErrorKind::AlreadyConnected)
            }
            ClientState::NotConnected => Ok(()),
        };
        // errors are reported with the state lock released: the error
        // callback may query the client
        admitted.map_err(AppError::from).or_else(|err| self.fail(err))?;

        let Established {
            connection,
            handle,
            scope,
            local_addr,
        } = match self.establish(addr) {
            Ok(established) => established,
            Err(err) => {
                self.connecting.store(false, Ordering::Release);
                return self.fail(err);
            }
        };
        {
            let mut state = self.state.lock();
            let mut link = self.link.lock();
            link.handle = Some(handle.clone());
            link.server_addr = Some(addr);
            link.local_addr = local_addr;
            *state = ClientState::Connected;
            self.connecting.store(false, Ordering::Release);
        }
        info!("connected to {}", addr);

        let rt = self.runtime;
        if self.config.blocking {
            runtime::block_on(rt, self.receive(connection, handle, scope));
        } else {
            let shared = self.clone();
            self.tasks
                .spawn(rt, shared.receive(connection, handle, scope));
        }
        Ok(())
    }

    /// Opens the socket and the dispatch scope of a new connection.
    fn establish(&self, addr: SocketAddrV4) -> AppResult<Established> {
        let socket = runtime::block_on(self.runtime, Self::open(addr))?;
        let local_addr = socket.local_addr().ok();
        let peer_addr = socket.peer_addr().unwrap_or(SocketAddr::V4(addr));
        let (reader, writer) = socket.into_split();
        let handle = Arc::new(ConnectionHandle::new(peer_addr, writer, Shutdown::new()));
        let scope = self
            .dispatcher
            .scope(self.handlers.clone(), &self.tasks, || {})?;
        let connection = Connection::new(
            reader,
            self.config.max_frame_size,
            self.config.read_buffer_size,
        );
        Ok(Established {
            connection,
            handle,
            scope,
            local_addr,
        })
    }

    async fn open(addr: SocketAddrV4) -> AppResult<TcpStream> {
        let socket =
            TcpSocket::new_v4().map_err(|err| AppError::io(ErrorKind::SockInitFailed, err))?;
        socket
            .connect(SocketAddr::V4(addr))
            .await
            .map_err(|err| AppError::io(ErrorKind::ConnectFailed, err))
    }

    /// Receive loop. Whatever ends it, `Disconnected` is dispatched exactly
    /// once, here.
    async fn receive(
        self: Arc<Self>,
        mut connection: Connection,
        handle: Arc<ConnectionHandle>,
        scope: DispatchScope,
    ) {
        let shutdown = handle.shutdown().clone();
        loop {
            let maybe_frame = tokio::select! {
                res = connection.read_frame() => res,
                _ = shutdown.recv() => {
                    debug!("client receive loop closed locally");
                    break;
                }
            };
            match maybe_frame {
                Ok(Some(frame)) => scope.dispatch(Event::Recv(frame)),
                Ok(None) => {
                    debug!("server closed the connection");
                    break;
                }
                Err(err) if err.is_disconnect() => {
                    debug!("connection dropped by server: {}", err);
                    break;
                }
                Err(err) => {
                    self.errors.report_error(&err);
                    break;
                }
            }
        }
        drop(connection);
        // a send still waiting on the server gives up before the write half closes
        handle.shutdown().trigger();
        handle.shutdown_write().await;
        drop(handle);

        {
            let mut state = self.state.lock();
            *state = ClientState::Disconnected;
            self.link.lock().handle = None;
        }
        scope.dispatch(Event::Disconnected);
        scope.close();
    }

    fn send(&self, data: &[u8]) -> AppResult<()> {
        let handle = self
            .link
            .lock()
            .handle
            .clone()
            .ok_or(AppError::new(ErrorKind::NotConnected))
            .or_else(|err| self.fail(err))?;
        let frame = FrameCodec::encode(data).or_else(|err| self.fail(err))?;
        runtime::block_on(self.runtime, handle.write_frame(&frame))
            .or_else(|err| self.fail(AppError::io(ErrorKind::SendFailed, err)))
    }

    fn disconnect(&self) -> AppResult<()> {
        let handle = {
            let mut state = self.state.lock();
            if *state == ClientState::Connected {
                *state = ClientState::Disconnected;
                Ok(self.link.lock().handle.take())
            } else {
                Err(AppError::new(ErrorKind::NotConnected))
            }
        };
        if let Some(handle) = handle.or_else(|err| self.fail(err))? {
            handle.close(true);
        }
        self.tasks.join_all(self.runtime);
        info!("disconnected from server");
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("server_addr", &self.server_addr())
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.connected() {
            let _ = self.shared.disconnect();
        }
        debug!("tcp client dropped");
    }
}
