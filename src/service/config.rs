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

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult, ErrorKind};

/// Port used by the `*_default_port` variants of start/connect.
pub const DEFAULT_PORT: u16 = 29275;
/// Address a server binds to when no host is given (INADDR_ANY).
pub const DEFAULT_SERVER_HOST: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
/// Address a client connects to when no host is given.
pub const DEFAULT_CLIENT_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

const DEFAULT_MAX_CLIENTS: usize = 16;
const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024;
const DEFAULT_LISTEN_BACKLOG: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of slots in the connection table.
    pub max_clients: usize,
    /// `start` runs the accept loop on the calling thread until `stop`.
    pub blocking: bool,
    /// Callbacks run inline on the receive path instead of on a per-connection
    /// dispatch thread.
    pub event_blocking: bool,
    /// Spawned tasks are detached and never joined by `stop`.
    pub daemon: bool,
    /// Largest payload accepted from a peer.
    pub max_frame_size: usize,
    pub read_buffer_size: usize,
    pub listen_backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_clients: DEFAULT_MAX_CLIENTS,
            blocking: false,
            event_blocking: false,
            daemon: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

impl ServerConfig {
    pub fn new(max_clients: usize) -> Self {
        ServerConfig {
            max_clients,
            ..Default::default()
        }
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn event_blocking(mut self, event_blocking: bool) -> Self {
        self.event_blocking = event_blocking;
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `connect` runs the receive loop on the calling thread until disconnected.
    pub blocking: bool,
    pub event_blocking: bool,
    pub daemon: bool,
    pub max_frame_size: usize,
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            blocking: false,
            event_blocking: false,
            daemon: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn event_blocking(mut self, event_blocking: bool) -> Self {
        self.event_blocking = event_blocking;
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

/// Server and client settings as read from a config file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl TransportConfig {
    /// Loads the file at `path` (format picked by extension), then applies
    /// `CDTP_SERVER__*` / `CDTP_CLIENT__*` environment overrides.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TransportConfig> {
        let path = path.as_ref();
        if path.to_str().is_none() {
            return Err(AppError::new(ErrorKind::ConfigFailed));
        }
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("CDTP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let transport_config: TransportConfig = config.try_deserialize()?;
        Ok(transport_config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_default_constructors() {
        let server = ServerConfig::default();
        assert_eq!(server.max_clients, 16);
        assert!(!server.blocking);
        assert!(!server.event_blocking);
        assert!(server.daemon);
        assert_eq!(server.listen_backlog, 3);

        let client = ClientConfig::default();
        assert!(!client.blocking);
        assert!(client.daemon);
        assert_eq!(client.read_buffer_size, 4 * 1024);
    }

    #[test]
    fn setters_chain() {
        let server = ServerConfig::new(2)
            .blocking(true)
            .event_blocking(true)
            .daemon(false)
            .max_frame_size(128);
        assert_eq!(server.max_clients, 2);
        assert!(server.blocking && server.event_blocking && !server.daemon);
        assert_eq!(server.max_frame_size, 128);
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("create temp config");
        writeln!(
            file,
            "[server]\nmax_clients = 4\nevent_blocking = true\n\n[client]\ndaemon = false\n"
        )
        .unwrap();

        let config = TransportConfig::set_up_config(file.path()).expect("load config");
        assert_eq!(config.server.max_clients, 4);
        assert!(config.server.event_blocking);
        assert_eq!(config.server.listen_backlog, 3);
        assert!(!config.client.daemon);
        assert!(!config.client.blocking);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = TransportConfig::set_up_config("/nonexistent/cdtp.toml").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigFailed);
    }
}
