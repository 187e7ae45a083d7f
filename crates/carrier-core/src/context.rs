//! Per-message context handed to handlers.

use carrier_proto::FRAME_HEADER_SIZE;

use crate::{conn::Conn, error::ConnError, pool::Recycle};

/// One inbound message, as seen by a [`Handler`](crate::Handler).
///
/// Contexts are pooled; the reader fills one per uncorrelated or peer-issued
/// message and recycles it once the handler returns.
#[derive(Debug, Default)]
pub struct Context {
    conn: Option<Conn>,
    seq: u32,
    frame: Vec<u8>,
}

impl Context {
    /// Swap `frame` in as this context's message.
    pub(crate) fn load(&mut self, conn: &Conn, seq: u32, frame: &mut Vec<u8>) {
        self.conn = Some(conn.clone());
        self.seq = seq;
        std::mem::swap(&mut self.frame, frame);
    }

    /// Swap the message buffer back out.
    pub(crate) fn unload(&mut self, frame: &mut Vec<u8>) {
        std::mem::swap(&mut self.frame, frame);
    }

    /// Sequence of the inbound frame; `0` if uncorrelated.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Whether the peer expects a reply.
    pub fn is_request(&self) -> bool {
        self.seq != 0
    }

    /// Message payload, without the frame header.
    pub fn body(&self) -> &[u8] {
        self.frame.get(FRAME_HEADER_SIZE..).unwrap_or_default()
    }

    /// Connection the message arrived on.
    pub fn conn(&self) -> Option<&Conn> {
        self.conn.as_ref()
    }

    /// Queue `payload` as the reply to this message.
    ///
    /// Does not wait for the write.
    ///
    /// # Errors
    ///
    /// [`ConnError::Closed`] if the connection is shutting down.
    pub fn reply(&self, payload: &[u8]) -> Result<(), ConnError> {
        let conn = self.conn.as_ref().ok_or(ConnError::Closed)?;
        conn.enqueue(self.seq, payload)
    }
}

impl Recycle for Context {
    fn recycle(&mut self) {
        self.conn = None;
        self.seq = 0;
        self.frame.clear();
    }
}
