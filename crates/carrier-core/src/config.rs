//! Connection configuration.

use std::time::Duration;

use carrier_proto::{RecordConfig, Role};

use crate::error::ConnError;

/// How a connection numbers the requests it issues.
///
/// The first request uses `offset`, each later one adds `delta` (wrapping,
/// skipping `0`). With an even `delta` every sequence keeps the parity of
/// `offset`, so giving initiators odd and acceptors even offsets keeps the
/// two peers' sequence spaces disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceConfig {
    /// First sequence issued
    pub offset: u32,
    /// Step between consecutive sequences
    pub delta: u32,
}

impl SequenceConfig {
    /// Defaults for `role`: `1, 3, 5, ...` for initiators, `2, 4, 6, ...` for
    /// acceptors.
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Initiator => Self { offset: 1, delta: 2 },
            Role::Acceptor => Self { offset: 2, delta: 2 },
        }
    }

    /// Check the pair can be used by `role` without colliding with the peer.
    ///
    /// # Errors
    ///
    /// [`ConnError::Config`] if either value is zero, `delta` is odd, or the
    /// parity of `offset` does not match `role`.
    pub fn validate(&self, role: Role) -> Result<(), ConnError> {
        if self.offset == 0 || self.delta == 0 {
            return Err(ConnError::Config("sequence offset and delta must be nonzero".into()));
        }
        if self.delta % 2 != 0 {
            return Err(ConnError::Config(format!("sequence delta {} must be even", self.delta)));
        }
        let want_odd = role == Role::Initiator;
        if (self.offset % 2 == 1) != want_odd {
            return Err(ConnError::Config(format!(
                "sequence offset {} has the wrong parity for {role:?}",
                self.offset
            )));
        }
        Ok(())
    }

    /// Whether `seq` lies in the space this config issues from.
    pub fn is_own(&self, seq: u32) -> bool {
        seq != 0 && seq % 2 == self.offset % 2
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnConfig {
    /// Record buffering and size limits
    pub record: RecordConfig,
    /// Default deadline for [`Conn::request`](crate::Conn::request)
    pub request_timeout: Duration,
    /// Longest wait for the next inbound record before the connection is
    /// torn down; zero disables it
    pub read_timeout: Duration,
    /// Deadline for writing and flushing one batch; zero disables it
    pub write_timeout: Duration,
    /// Sequence numbering; `None` uses [`SequenceConfig::for_role`]
    pub sequence: Option<SequenceConfig>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            record: RecordConfig::default(),
            request_timeout: Duration::from_secs(3),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::from_secs(3),
            sequence: None,
        }
    }
}

impl ConnConfig {
    /// Sequence config for `role`, validated.
    ///
    /// # Errors
    ///
    /// [`ConnError::Config`] if an explicit sequence config is invalid for
    /// `role`.
    pub fn sequence_for(&self, role: Role) -> Result<SequenceConfig, ConnError> {
        let seq = self.sequence.unwrap_or_else(|| SequenceConfig::for_role(role));
        seq.validate(role)?;
        Ok(seq)
    }
}
