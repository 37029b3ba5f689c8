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

use std::io::{self, ErrorKind as IoErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::network::FrameCodec;
use crate::service::{AppError, AppResult, ErrorKind, Shutdown};

/// Read side of a connection: the socket's read half and the buffer frames are
/// assembled in. Owned by the connection's receive loop.
#[derive(Debug)]
pub struct Connection {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Connection {
    pub fn new(reader: OwnedReadHalf, max_frame_size: usize, buffer_size: usize) -> Connection {
        Connection {
            reader,
            buffer: BytesMut::with_capacity(buffer_size),
            max_frame_size,
        }
    }

    /// Reads until one complete frame is buffered and returns its payload.
    ///
    /// Returns `None` when the peer closed the connection between frames, and an
    /// error if it closed in the middle of one or announced a payload larger
    /// than `max_frame_size`. Cancel-safe: bytes already read stay in the buffer.
    pub async fn read_frame(&mut self) -> AppResult<Option<Bytes>> {
        loop {
            if let Some(body_size) = FrameCodec::declared_len(&self.buffer) {
                if body_size > self.max_frame_size {
                    return Err(AppError::new(ErrorKind::FrameTooLarge));
                }
            }
            if let Some(frame) = FrameCodec::parse(&mut self.buffer) {
                return Ok(Some(frame));
            }
            let read = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|err| AppError::io(ErrorKind::RecvFailed, err))?;
            if read == 0 {
                return if self.buffer.is_empty() {
                    // peer has closed the connection gracefully
                    Ok(None)
                } else {
                    // peer closed the connection while sending a frame
                    Err(AppError::io(
                        ErrorKind::RecvFailed,
                        io::Error::new(IoErrorKind::ConnectionReset, "connection reset by peer"),
                    ))
                };
            }
        }
    }
}

/// Shared side of a connection: the write half, the peer address and the
/// signal that closes the connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    peer_addr: SocketAddr,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    shutdown: Shutdown,
    notify_disconnect: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(peer_addr: SocketAddr, writer: OwnedWriteHalf, shutdown: Shutdown) -> Self {
        ConnectionHandle {
            peer_addr,
            writer: Mutex::new(BufWriter::new(writer)),
            shutdown,
            notify_disconnect: AtomicBool::new(false),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Writes a whole encoded frame. Frames from concurrent senders never
    /// interleave. Fails with `BrokenPipe` once the connection is closed, also
    /// when the close happens while the write is waiting on the peer.
    pub async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        tokio::select! {
            biased;
            _ = self.shutdown.recv() => Err(closed()),
            res = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(frame).await?;
                writer.flush().await
            } => res,
        }
    }

    /// Sends FIN to the peer. Called by the receive loop once it is done, after
    /// any pending write has given up.
    pub async fn shutdown_write(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.get_mut().shutdown().await {
            debug!("shutdown write half of {} failed: {}", self.peer_addr, err);
        }
    }

    /// Closes the connection. `notify` tells the receive loop whether the
    /// disconnect should still be reported to the application.
    pub fn close(&self, notify: bool) {
        self.notify_disconnect.store(notify, Ordering::Release);
        self.shutdown.trigger();
    }

    pub fn notify_requested(&self) -> bool {
        self.notify_disconnect.load(Ordering::Acquire)
    }
}

fn closed() -> io::Error {
    io::Error::new(IoErrorKind::BrokenPipe, "connection closed")
}
