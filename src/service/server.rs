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
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Runtime;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::network::{ClientId, Connection, ConnectionHandle, ConnectionTable, FrameCodec};

use super::config::{DEFAULT_PORT, DEFAULT_SERVER_HOST};
use super::dispatcher::{DispatchScope, Event, EventDispatcher, EventHandler};
use super::runtime::{self, TaskSet};
use super::{AppError, AppResult, ErrorKind, ErrorReporter, ServerConfig, Shutdown};

const MAX_ACCEPT_BACKOFF_MS: u64 = 1000;

pub type ServerRecvCallback = Arc<dyn Fn(ClientId, &[u8]) + Send + Sync>;
pub type ServerClientCallback = Arc<dyn Fn(ClientId) + Send + Sync>;

/// Application callbacks of a server. State the callbacks need is captured by
/// the closures.
#[derive(Clone, Default)]
pub struct ServerHandlers {
    on_recv: Option<ServerRecvCallback>,
    on_connect: Option<ServerClientCallback>,
    on_disconnect: Option<ServerClientCallback>,
}

impl ServerHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per complete message. The payload is borrowed for the
    /// duration of the call.
    pub fn on_recv<F>(mut self, callback: F) -> Self
    where
        F: Fn(ClientId, &[u8]) + Send + Sync + 'static,
    {
        self.on_recv = Some(Arc::new(callback));
        self
    }

    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(ClientId) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(ClientId) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ServerHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandlers")
            .field("on_recv", &self.on_recv.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// Binds the server callbacks to one client id.
struct ClientEvents {
    client_id: ClientId,
    handlers: Arc<ServerHandlers>,
}

impl EventHandler for ClientEvents {
    fn handle(&self, event: Event) {
        match event {
            Event::Recv(data) => {
                if let Some(on_recv) = &self.handlers.on_recv {
                    on_recv(self.client_id, &data);
                }
            }
            Event::Connect => {
                if let Some(on_connect) = &self.handlers.on_connect {
                    on_connect(self.client_id);
                }
            }
            Event::Disconnect => {
                if let Some(on_disconnect) = &self.handlers.on_disconnect {
                    on_disconnect(self.client_id);
                }
            }
            Event::Disconnected => {}
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Serving,
    /// Terminal: a stopped server cannot serve again.
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::Serving => write!(f, "Serving"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

enum ConnectionExit {
    Closed,
    Cancelled,
    Failed,
}

struct ServerShared {
    config: ServerConfig,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddrV4>>,
    table: ConnectionTable<Arc<ConnectionHandle>>,
    handlers: Arc<ServerHandlers>,
    errors: Arc<ErrorReporter>,
    shutdown: Shutdown,
    tasks: TaskSet,
    dispatcher: EventDispatcher,
    runtime: &'static Runtime,
}

/// A TCP server exchanging length-prefixed messages with up to `max_clients`
/// clients at a time.
///
/// All methods are synchronous and may be called from any thread, including
/// from inside the server's own callbacks. With `blocking` set, `start` runs
/// the accept loop on the calling thread, so the server is usually shared
/// through an `Arc` and stopped from elsewhere.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(config: ServerConfig, handlers: ServerHandlers) -> AppResult<Server> {
        Self::with_reporter(config, handlers, ErrorReporter::global())
    }

    /// Creates a server that records its errors in `errors` instead of the
    /// process-wide reporter.
    pub fn with_reporter(
        config: ServerConfig,
        handlers: ServerHandlers,
        errors: Arc<ErrorReporter>,
    ) -> AppResult<Server> {
        let runtime = runtime::io_runtime().inspect_err(|err| errors.report_error(err))?;
        let shared = ServerShared {
            state: Mutex::new(ServerState::NotStarted),
            local_addr: Mutex::new(None),
            table: ConnectionTable::new(config.max_clients),
            handlers: Arc::new(handlers),
            errors,
            shutdown: Shutdown::new(),
            tasks: TaskSet::new(config.daemon),
            dispatcher: EventDispatcher::new(config.event_blocking),
            runtime,
            config,
        };
        Ok(Server {
            shared: Arc::new(shared),
        })
    }

    pub fn start(&self, host: &str, port: u16) -> AppResult<()> {
        let host = host
            .parse::<Ipv4Addr>()
            .map_err(|err| AppError::with_source(ErrorKind::InvalidAddress, err))
            .or_else(|err| self.shared.fail(err))?;
        self.start_host(host, port)
    }

    pub fn start_host(&self, host: Ipv4Addr, port: u16) -> AppResult<()> {
        self.shared.clone().start(SocketAddrV4::new(host, port))
    }

    pub fn start_default_host(&self, port: u16) -> AppResult<()> {
        self.start_host(DEFAULT_SERVER_HOST, port)
    }

    pub fn start_default_port(&self, host: &str) -> AppResult<()> {
        self.start(host, DEFAULT_PORT)
    }

    pub fn start_host_default_port(&self, host: Ipv4Addr) -> AppResult<()> {
        self.start_host(host, DEFAULT_PORT)
    }

    pub fn start_default(&self) -> AppResult<()> {
        self.start_host(DEFAULT_SERVER_HOST, DEFAULT_PORT)
    }

    /// Stops serving: closes every client and the listening socket, then waits
    /// for the server's tasks unless they are daemons. The server cannot be
    /// started again afterwards.
    pub fn stop(&self) -> AppResult<()> {
        self.shared.stop()
    }

    pub fn send(&self, client_id: ClientId, data: &[u8]) -> AppResult<()> {
        self.shared.send(client_id, data)
    }

    /// Sends `data` to every connected client, returning the first failure
    /// after trying them all.
    pub fn broadcast(&self, data: &[u8]) -> AppResult<()> {
        let frame = FrameCodec::encode(data).or_else(|err| self.shared.fail(err))?;
        let mut first_err = None;
        self.shared.table.for_each(|client_id, handle| {
            if let Err(err) = self.shared.write(client_id, handle, &frame) {
                first_err.get_or_insert(err);
            }
        });
        first_err.map_or(Ok(()), Err)
    }

    /// Disconnects one client. Its `on_disconnect` callback fires once the
    /// receive loop has wound down.
    pub fn remove_client(&self, client_id: ClientId) -> AppResult<()> {
        let handle = self
            .shared
            .table
            .release(client_id)
            .or_else(|err| self.shared.fail(err))?;
        handle.close(true);
        debug!(client_id, peer = %handle.peer_addr(), "client removed");
        Ok(())
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.lock()
    }

    pub fn serving(&self) -> bool {
        self.state() == ServerState::Serving
    }

    /// Address the server is bound to, with the real port if port 0 was asked
    /// for. `None` until the server has started.
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        *self.shared.local_addr.lock()
    }

    pub fn host(&self) -> Option<String> {
        self.local_addr().map(|addr| addr.ip().to_string())
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    pub fn client_count(&self) -> usize {
        self.shared.table.count()
    }

    pub fn client_addr(&self, client_id: ClientId) -> AppResult<SocketAddr> {
        self.shared
            .table
            .get(client_id)
            .map(|handle| handle.peer_addr())
            .or_else(|err| self.shared.fail(err))
    }

    pub fn config(&self) -> &ServerConfig {
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

impl ServerShared {
    fn fail<T>(&self, err: AppError) -> AppResult<T> {
        self.errors.report_error(&err);
        Err(err)
    }

    fn start(self: Arc<Self>, addr: SocketAddrV4) -> AppResult<()> {
        let started: AppResult<(TcpListener, SocketAddrV4)> = {
            let mut state = self.state.lock();
            match *state {
                ServerState::Serving => Err(ErrorKind::AlreadyServing.into()),
                ServerState::Stopped => Err(ErrorKind::CannotRestart.into()),
                ServerState::NotStarted => self.listen(addr).map(|listener| {
                    let bound = match listener.local_addr() {
                        Ok(SocketAddr::V4(bound)) => bound,
                        _ => addr,
                    };
                    *self.local_addr.lock() = Some(bound);
                    *state = ServerState::Serving;
                    (listener, bound)
                }),
            }
        };
        // reported with the state lock released: the error callback may query
        // the server
        let (listener, bound) = started.or_else(|err| self.fail(err))?;
        info!("tcp server listening on {}", bound);

        let rt = self.runtime;
        if self.config.blocking {
            runtime::block_on(rt, self.serve(listener));
        } else {
            let shared = self.clone();
            self.tasks.spawn(rt, shared.serve(listener));
        }
        Ok(())
    }

    fn listen(&self, addr: SocketAddrV4) -> AppResult<TcpListener> {
        // registering the listener needs the runtime's reactor
        let _enter = self.runtime.enter();
        let socket =
            TcpSocket::new_v4().map_err(|err| AppError::io(ErrorKind::SockInitFailed, err))?;
        socket
            .set_reuseaddr(true)
            .map_err(|err| AppError::io(ErrorKind::SetsockoptFailed, err))?;
        socket
            .bind(SocketAddr::V4(addr))
            .map_err(|err| AppError::io(ErrorKind::BindFailed, err))?;
        socket
            .listen(self.config.listen_backlog)
            .map_err(|err| AppError::io(ErrorKind::ListenFailed, err))
    }

    /// Accept loop. Runs until the server's shutdown signal fires; the
    /// listening socket is closed when it returns.
    async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut backoff = 1;
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = self.shutdown.recv() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    backoff = 1;
                    self.register(socket, peer_addr);
                }
                Err(err) => {
                    self.errors
                        .report_error(&AppError::io(ErrorKind::AcceptFailed, err));
                    tokio::select! {
                        _ = time::sleep(Duration::from_millis(backoff)) => {}
                        _ = self.shutdown.recv() => break,
                    }
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF_MS);
                }
            }
        }
        debug!("accept loop exited");
    }

    fn register(self: &Arc<Self>, socket: TcpStream, peer_addr: SocketAddr) {
        let (reader, writer) = socket.into_split();
        let handle = Arc::new(ConnectionHandle::new(
            peer_addr,
            writer,
            self.shutdown.child(),
        ));
        let client_id = match self.table.allocate(handle.clone()) {
            Ok(client_id) => client_id,
            Err(err) => {
                // dropping the halves closes the rejected socket
                warn!(peer = %peer_addr, "rejecting connection: {}", err);
                self.errors.report_error(&err);
                return;
            }
        };
        if self.shutdown.is_shutdown() {
            // stop has begun: this client is never announced
            debug!(client_id, peer = %peer_addr, "dropping connection accepted during stop");
            self.discard(client_id, &handle);
            return;
        }
        debug!(client_id, peer = %peer_addr, "client connected");

        let events = Arc::new(ClientEvents {
            client_id,
            handlers: self.handlers.clone(),
        });
        let shared = self.clone();
        let scope = match self.dispatcher.scope(events, &self.tasks, move || {
            shared.table.vacate(client_id);
        }) {
            Ok(scope) => scope,
            Err(err) => {
                warn!(client_id, peer = %peer_addr, "no dispatcher for connection: {}", err);
                self.discard(client_id, &handle);
                self.errors.report_error(&err);
                return;
            }
        };
        scope.dispatch(Event::Connect);

        let connection = Connection::new(
            reader,
            self.config.max_frame_size,
            self.config.read_buffer_size,
        );
        let shared = self.clone();
        self.tasks.spawn(
            self.runtime,
            shared.handle_connection(client_id, connection, handle, scope),
        );
    }

    /// Frees the slot of a connection that was never announced.
    fn discard(&self, client_id: ClientId, handle: &ConnectionHandle) {
        // stop may have released the slot already
        let _ = self.table.release(client_id);
        self.table.vacate(client_id);
        handle.close(false);
    }

    /// Receive loop of one client.
    async fn handle_connection(
        self: Arc<Self>,
        client_id: ClientId,
        mut connection: Connection,
        handle: Arc<ConnectionHandle>,
        scope: DispatchScope,
    ) {
        let shutdown = handle.shutdown().clone();
        let exit = loop {
            let maybe_frame = tokio::select! {
                res = connection.read_frame() => res,
                _ = shutdown.recv() => break ConnectionExit::Cancelled,
            };
            match maybe_frame {
                Ok(Some(frame)) => scope.dispatch(Event::Recv(frame)),
                Ok(None) => break ConnectionExit::Closed,
                Err(err) if err.is_disconnect() => {
                    debug!(client_id, "connection dropped by peer: {}", err);
                    break ConnectionExit::Closed;
                }
                Err(err) => {
                    self.errors.report_error(&err);
                    break ConnectionExit::Failed;
                }
            }
        };
        drop(connection);

        let notify = match (exit, self.table.release(client_id)) {
            // nobody else released the slot: the peer left or the read failed,
            // unless the whole server is going down
            (_, Ok(_)) => !self.shutdown.is_shutdown(),
            // released by remove_client or stop, which always close afterwards
            (ConnectionExit::Cancelled, Err(_)) => handle.notify_requested(),
            (_, Err(_)) => {
                shutdown.recv().await;
                handle.notify_requested()
            }
        };
        // a send still waiting on the peer gives up before the write half closes
        handle.shutdown().trigger();
        handle.shutdown_write().await;
        drop(handle);
        debug!(client_id, notify, "connection handler exit read loop");

        if notify {
            scope.dispatch(Event::Disconnect);
        }
        scope.close();
    }

    fn send(&self, client_id: ClientId, data: &[u8]) -> AppResult<()> {
        let handle = self.table.get(client_id).or_else(|err| self.fail(err))?;
        let frame = FrameCodec::encode(data).or_else(|err| self.fail(err))?;
        self.write(client_id, &handle, &frame)
    }

    fn write(&self, client_id: ClientId, handle: &ConnectionHandle, frame: &[u8]) -> AppResult<()> {
        runtime::block_on(self.runtime, handle.write_frame(frame)).or_else(|err| {
            debug!(client_id, "send failed: {}", err);
            self.fail(AppError::io(ErrorKind::SendFailed, err))
        })
    }

    fn stop(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            if *state == ServerState::Stopped {
                return Ok(());
            }
            *state = ServerState::Stopped;
        }

        // ends the accept loop and every receive loop
        self.shutdown.trigger();
        for (client_id, handle) in self.table.release_all() {
            debug!(client_id, "closing client on stop");
            handle.close(false);
        }
        self.tasks.join_all(self.runtime);
        info!("tcp server stopped");
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("clients", &self.client_count())
            .field("capacity", &self.shared.table.capacity())
            .finish()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.serving() {
            let _ = self.shared.stop();
        }
        debug!("tcp server dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncReadExt;

    use super::*;

    fn accepted_pair(rt: &Runtime) -> (TcpStream, SocketAddr, TcpStream) {
        runtime::block_on(rt, async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let peer = TcpStream::connect(listener.local_addr().unwrap())
                .await
                .unwrap();
            let (socket, peer_addr) = listener.accept().await.unwrap();
            (socket, peer_addr, peer)
        })
    }

    #[test]
    fn connection_accepted_during_stop_is_not_announced() {
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        let handlers = ServerHandlers::new().on_connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let server = Server::with_reporter(
            ServerConfig::new(1).daemon(false),
            handlers,
            Arc::new(ErrorReporter::new()),
        )
        .unwrap();
        let shared = server.shared.clone();
        let rt = shared.runtime;

        let (socket, peer_addr, mut peer) = accepted_pair(rt);
        server.stop().unwrap();
        shared.register(socket, peer_addr);

        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert_eq!(server.client_count(), 0);
        let mut buf = [0u8; 8];
        let read = runtime::block_on(rt, peer.read(&mut buf)).unwrap();
        assert_eq!(read, 0);

        // the slot went straight back to vacant
        let (socket, peer_addr, _peer) = accepted_pair(rt);
        let (_, writer) = socket.into_split();
        let handle = Arc::new(ConnectionHandle::new(peer_addr, writer, Shutdown::new()));
        assert_eq!(shared.table.allocate(handle).unwrap(), 0);
    }
}
