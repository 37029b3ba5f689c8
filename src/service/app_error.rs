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

use std::io;

pub type AppResult<T> = Result<T, AppError>;

/// Kind of a transport failure.
///
/// Every kind carries a stable numeric code, which is what the error callback
/// receives together with the underlying OS error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    /// initialization errors
    #[error("runtime initialization failed")]
    InitFailed = 1,

    #[error("socket initialization failed")]
    SockInitFailed = 2,

    #[error("setting socket options failed")]
    SetsockoptFailed = 3,

    #[error("invalid address")]
    InvalidAddress = 4,

    /// server errors
    #[error("server is already serving")]
    AlreadyServing = 5,

    #[error("bind failed")]
    BindFailed = 6,

    #[error("listen failed")]
    ListenFailed = 7,

    #[error("server cannot be restarted")]
    CannotRestart = 8,

    #[error("accept failed")]
    AcceptFailed = 9,

    #[error("connection table is full")]
    TableFull = 10,

    #[error("client does not exist")]
    ClientDoesNotExist = 11,

    /// data path errors
    #[error("send failed")]
    SendFailed = 12,

    #[error("receive failed")]
    RecvFailed = 13,

    #[error("frame too large")]
    FrameTooLarge = 14,

    /// client errors
    #[error("client is already connected")]
    AlreadyConnected = 15,

    #[error("client is not connected")]
    NotConnected = 16,

    #[error("connect failed")]
    ConnectFailed = 17,

    #[error("client cannot reconnect")]
    CannotReconnect = 18,

    #[error("configuration error")]
    ConfigFailed = 19,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// A failed transport operation: what failed, plus the OS error code behind it
/// (0 when there is none).
#[derive(Debug, thiserror::Error)]
#[error("{kind} (underlying error {underlying})")]
pub struct AppError {
    kind: ErrorKind,
    underlying: i32,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    pub fn new(kind: ErrorKind) -> Self {
        AppError {
            kind,
            underlying: 0,
            source: None,
        }
    }

    pub fn io(kind: ErrorKind, err: io::Error) -> Self {
        AppError {
            kind,
            underlying: err.raw_os_error().unwrap_or(0),
            source: Some(Box::new(err)),
        }
    }

    pub fn with_source<E>(kind: ErrorKind, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        AppError {
            kind,
            underlying: 0,
            source: Some(Box::new(err)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn underlying(&self) -> i32 {
        self.underlying
    }

    /// Whether this error means the peer went away rather than that something
    /// broke. Such errors end a receive loop quietly.
    pub fn is_disconnect(&self) -> bool {
        let Some(io_err) = self
            .source
            .as_ref()
            .and_then(|source| source.downcast_ref::<io::Error>())
        else {
            return false;
        };
        matches!(
            io_err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        )
    }
}

impl From<ErrorKind> for AppError {
    fn from(kind: ErrorKind) -> Self {
        AppError::new(kind)
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::with_source(ErrorKind::ConfigFailed, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_os_code() {
        let err = AppError::io(ErrorKind::BindFailed, io::Error::from_raw_os_error(98));
        assert_eq!(err.kind(), ErrorKind::BindFailed);
        assert_eq!(err.underlying(), 98);
        assert!(err.to_string().starts_with("bind failed"));
    }

    #[test]
    fn peer_resets_are_disconnects() {
        let reset = AppError::io(
            ErrorKind::RecvFailed,
            io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
        );
        assert!(reset.is_disconnect());

        let other = AppError::io(
            ErrorKind::RecvFailed,
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(!other.is_disconnect());
        assert!(!AppError::new(ErrorKind::TableFull).is_disconnect());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::InitFailed.code(), 1);
        assert_eq!(ErrorKind::ClientDoesNotExist.code(), 11);
        assert_eq!(ErrorKind::CannotRestart.code(), 8);
    }
}
