//! Ephemeral key exchange.
//!
//! A [`Session`] holds one side's ephemeral key pair. Running the handshake
//! consumes it and yields [`SessionKeys`]: the derived key plus a ready
//! cipher, from which the per-direction record halves are built.

use aes_gcm::{Aes256Gcm, KeyInit};
use carrier_proto::{ProtocolError, RecordConfig, read_record, write_record};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::{
    error::HandshakeError,
    stream::{SessionReader, SessionWriter},
};

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// One side of a key exchange, before the peer key is known.
pub struct Session {
    secret: Zeroizing<[u8; 32]>,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl Session {
    /// Generate a fresh ephemeral key pair.
    pub fn new() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(&signing)
    }

    /// Build a session from an existing Ed25519 key.
    ///
    /// The key is converted to its X25519 (Montgomery) form.
    pub fn from_signing_key(signing: &SigningKey) -> Self {
        Self {
            secret: Zeroizing::new(signing.to_scalar_bytes()),
            public: signing.verifying_key().to_montgomery().to_bytes(),
        }
    }

    /// Our X25519 public key, as sent to the peer.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Run the handshake as the initiator: send our key, then read the
    /// peer's.
    ///
    /// # Errors
    ///
    /// Any [`HandshakeError`]. The stream should be dropped on failure.
    pub async fn initiate<S>(self, stream: &mut S) -> Result<SessionKeys, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        self.send_key(stream).await?;
        let peer = recv_key(stream).await?;
        self.derive(&peer)
    }

    /// Run the handshake as the acceptor: read the peer's key, then send
    /// ours.
    ///
    /// # Errors
    ///
    /// Any [`HandshakeError`]. The stream should be dropped on failure.
    pub async fn accept<S>(self, stream: &mut S) -> Result<SessionKeys, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let peer = recv_key(stream).await?;
        self.send_key(stream).await?;
        self.derive(&peer)
    }

    /// Derive session keys from the peer's public key.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::InvalidPeerKey`] if `peer` is not 32 bytes
    /// - [`HandshakeError::WeakSharedSecret`] if the shared secret is all
    ///   zeros
    pub fn derive(self, peer: &[u8]) -> Result<SessionKeys, HandshakeError> {
        let peer: [u8; PUBLIC_KEY_SIZE] =
            peer.try_into().map_err(|_| HandshakeError::InvalidPeerKey { len: peer.len() })?;

        let shared = Zeroizing::new(x25519_dalek::x25519(*self.secret, peer));
        if shared.iter().all(|&b| b == 0) {
            return Err(HandshakeError::WeakSharedSecret);
        }

        let key: [u8; 32] = Sha256::digest(shared.as_slice()).into();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| HandshakeError::Cipher)?;

        tracing::debug!("session key derived");
        Ok(SessionKeys { shared_key: Zeroizing::new(key), cipher })
    }

    async fn send_key<S>(&self, stream: &mut S) -> Result<(), HandshakeError>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        write_record(stream, &self.public).await?;
        stream.flush().await.map_err(ProtocolError::from)?;
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("public", &self.public).finish_non_exhaustive()
    }
}

async fn recv_key<S>(stream: &mut S) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut peer = Vec::with_capacity(PUBLIC_KEY_SIZE);
    match read_record(stream, &mut peer, PUBLIC_KEY_SIZE).await {
        Ok(()) => Ok(peer),
        Err(ProtocolError::RecordTooLarge { size, .. }) => {
            Err(HandshakeError::InvalidPeerKey { len: size })
        },
        Err(e) => Err(e.into()),
    }
}

/// Result of a completed handshake.
pub struct SessionKeys {
    shared_key: Zeroizing<[u8; 32]>,
    cipher: Aes256Gcm,
}

impl SessionKeys {
    /// The derived symmetric key. Both peers hold the same value.
    pub fn shared_key(&self) -> &[u8; 32] {
        &self.shared_key
    }

    /// Decrypting half over `inner`, nonce counter at zero.
    pub fn reader<R: AsyncRead + Unpin>(&self, inner: R, config: &RecordConfig) -> SessionReader<R> {
        SessionReader::new(inner, self.cipher.clone(), config)
    }

    /// Encrypting half over `inner`, nonce counter at zero.
    pub fn writer<W: AsyncWrite + Unpin>(&self, inner: W, config: &RecordConfig) -> SessionWriter<W> {
        SessionWriter::new(inner, self.cipher.clone(), config)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}
