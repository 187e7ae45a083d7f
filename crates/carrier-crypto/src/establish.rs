//! Turn a freshly connected stream into record halves.

use carrier_proto::{RecordConfig, RecordRead, RecordWrite, Role, split_plain};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::HandshakeError, session::Session};

/// Type-erased record source handed to the connection engine.
pub type BoxedRecordReader = Box<dyn RecordRead>;

/// Type-erased record sink handed to the connection engine.
pub type BoxedRecordWriter = Box<dyn RecordWrite>;

/// Whether records are sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// Records travel as-is. No handshake.
    Plaintext,
    /// Ephemeral key exchange, then AES-256-GCM on every record.
    #[default]
    Encrypted,
}

/// Run the handshake (if any) for `role` and split `stream` into halves.
///
/// The handshake talks to the raw stream; buffering is only added once the
/// keys are in place.
///
/// # Errors
///
/// Any [`HandshakeError`] from the key exchange. Plaintext never fails.
pub async fn establish<S>(
    mut stream: S,
    role: Role,
    security: Security,
    config: &RecordConfig,
) -> Result<(BoxedRecordReader, BoxedRecordWriter), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match security {
        Security::Plaintext => {
            let (reader, writer) = split_plain(stream, config);
            Ok((Box::new(reader), Box::new(writer)))
        },
        Security::Encrypted => {
            let session = Session::new();
            let keys = match role {
                Role::Initiator => session.initiate(&mut stream).await?,
                Role::Acceptor => session.accept(&mut stream).await?,
            };
            let (read, write) = tokio::io::split(stream);
            Ok((Box::new(keys.reader(read, config)), Box::new(keys.writer(write, config))))
        },
    }
}
