//! Which end of a connection we are.

/// Side of a connection.
///
/// The role fixes two things on the wire: who speaks first during the
/// session handshake, and the parity of self-issued sequence numbers so both
/// peers can issue requests on one connection without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialled the connection (client). Writes its key first, odd sequences.
    Initiator,
    /// Accepted the connection (server). Reads the peer key first, even
    /// sequences.
    Acceptor,
}

impl Role {
    /// The opposite role.
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Acceptor,
            Self::Acceptor => Self::Initiator,
        }
    }
}
