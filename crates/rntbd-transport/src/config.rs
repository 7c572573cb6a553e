//! Connection configuration.

use crate::error::{Result, TransportError};
use rntbd_core::{MAX_FRAME_LENGTH, PROTOCOL_VERSION, RESPONSE_STATUS_LENGTH};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Per-connection settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// User agent sent in the context request
    pub user_agent: String,

    /// Client version sent in the context request
    pub client_version: String,

    /// Protocol version requested during negotiation
    pub protocol_version: u32,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds (0 disables)
    pub request_timeout_ms: u64,

    /// Maximum requests awaiting a response
    pub max_pending_requests: usize,

    /// Largest inbound frame accepted
    pub max_frame_length: u32,

    /// Initial capacity of the receive buffer
    pub read_buffer_capacity: usize,

    /// Pre-computed credential sent in the context request
    #[serde(skip)]
    pub credential: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("rntbd-rs/", env!("CARGO_PKG_VERSION")).to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 0,
            max_pending_requests: 30_000,
            max_frame_length: MAX_FRAME_LENGTH,
            read_buffer_capacity: 64 * 1024, // 64 KiB
            credential: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("user_agent", &self.user_agent)
            .field("client_version", &self.client_version)
            .field("protocol_version", &self.protocol_version)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("max_pending_requests", &self.max_pending_requests)
            .field("max_frame_length", &self.max_frame_length)
            .field("read_buffer_capacity", &self.read_buffer_capacity)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    connection: ConnectionConfig,
}

impl ConnectionConfig {
    /// Parse a TOML document with a `[connection]` table
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] if the document cannot be
    /// parsed.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)
            .map_err(|e| TransportError::InvalidConfig(e.to_string().into()))?;
        Ok(file.connection)
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Attach a credential
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout, if enabled
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.user_agent.is_empty() {
            return Err(TransportError::invalid_config("user agent must not be empty"));
        }
        if self.user_agent.len() > usize::from(u8::MAX) {
            return Err(TransportError::invalid_config(
                "user agent must fit a short string header (255 bytes)",
            ));
        }
        if self.client_version.len() > usize::from(u8::MAX) {
            return Err(TransportError::invalid_config(
                "client version must fit a short string header (255 bytes)",
            ));
        }
        if self.max_pending_requests == 0 {
            return Err(TransportError::invalid_config(
                "max pending requests must be at least 1",
            ));
        }
        if (self.max_frame_length as usize) < RESPONSE_STATUS_LENGTH
            || self.max_frame_length > MAX_FRAME_LENGTH
        {
            return Err(TransportError::InvalidConfig(
                format!(
                    "max frame length must be between {} and {}",
                    RESPONSE_STATUS_LENGTH, MAX_FRAME_LENGTH
                )
                .into(),
            ));
        }
        if self.read_buffer_capacity == 0 {
            return Err(TransportError::invalid_config(
                "read buffer capacity must be non-zero",
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(TransportError::invalid_config(
                "connect timeout must be non-zero",
            ));
        }
        Ok(())
    }
}
