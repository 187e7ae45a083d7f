//! Client configuration.

use std::time::Duration;

use carrier_core::ConnConfig;
use carrier_crypto::Security;

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Settings for each dialed connection
    pub conn: ConnConfig,
    /// Whether connections run the session handshake
    pub security: Security,
    /// Limit for completing the session handshake
    pub handshake_timeout: Duration,
    /// Limit for opening the stream
    pub dial_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            conn: ConnConfig::default(),
            security: Security::Encrypted,
            handshake_timeout: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(3),
        }
    }
}
