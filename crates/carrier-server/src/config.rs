//! Server configuration.

use std::time::Duration;

use carrier_core::{ConnConfig, Role};
use carrier_crypto::Security;

use crate::error::ServerError;

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Settings applied to every accepted connection
    pub conn: ConnConfig,
    /// Whether connections run the session handshake
    pub security: Security,
    /// Limit for completing the session handshake
    pub handshake_timeout: Duration,
    /// Connections served at once
    pub max_conns: usize,
    /// How long a new connection may wait for a free slot before it is
    /// dropped
    pub max_conn_wait: Duration,
    /// Pause after a transient accept error
    pub accept_backoff: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            conn: ConnConfig::default(),
            security: Security::Encrypted,
            handshake_timeout: Duration::from_secs(3),
            max_conns: 1024,
            max_conn_wait: Duration::from_secs(3),
            accept_backoff: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    /// Check the settings before serving.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] if `max_conns` is zero or the connection
    /// sequence config is invalid for an acceptor.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_conns == 0 {
            return Err(ServerError::Config("max_conns must be at least 1".into()));
        }
        self.conn.sequence_for(Role::Acceptor).map_err(|e| ServerError::Config(e.to_string()))?;
        Ok(())
    }
}
