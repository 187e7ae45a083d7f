//! Sealed record halves.
//!
//! Each direction owns its own cipher instance and nonce counter, so the
//! reader and writer can run on different tasks without sharing state.
//! Record framing is unchanged: the length prefix covers the ciphertext
//! plus the 16-byte tag.

use aes_gcm::{Aes256Gcm, Nonce, aead::AeadInPlace};
use async_trait::async_trait;
use carrier_proto::{ProtocolError, RecordConfig, RecordRead, RecordWrite, read_record, write_record};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

fn nonce_for(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Reads sealed records and opens them.
pub struct SessionReader<R> {
    inner: BufReader<R>,
    cipher: Aes256Gcm,
    counter: u64,
    max_record_size: usize,
}

impl<R: AsyncRead + Unpin> SessionReader<R> {
    pub(crate) fn new(inner: R, cipher: Aes256Gcm, config: &RecordConfig) -> Self {
        Self {
            inner: BufReader::with_capacity(config.read_buffer_size, inner),
            cipher,
            counter: 0,
            max_record_size: config.max_record_size,
        }
    }

    /// Number of records opened so far.
    pub fn records_read(&self) -> u64 {
        self.counter
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> RecordRead for SessionReader<R> {
    /// # Errors
    ///
    /// [`ProtocolError::Authentication`] if the record fails to open. The
    /// stream is unusable afterwards.
    async fn read_record(&mut self, dst: &mut Vec<u8>) -> carrier_proto::Result<()> {
        read_record(&mut self.inner, dst, self.max_record_size + TAG_SIZE).await?;

        let nonce = nonce_for(self.counter);
        self.counter = self.counter.wrapping_add(1);
        self.cipher
            .decrypt_in_place(Nonce::from_slice(&nonce), b"", dst)
            .map_err(|_| ProtocolError::Authentication)
    }
}

/// Seals records and writes them.
pub struct SessionWriter<W> {
    inner: BufWriter<W>,
    cipher: Aes256Gcm,
    counter: u64,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> SessionWriter<W> {
    pub(crate) fn new(inner: W, cipher: Aes256Gcm, config: &RecordConfig) -> Self {
        Self {
            inner: BufWriter::with_capacity(config.write_buffer_size, inner),
            cipher,
            counter: 0,
            scratch: Vec::new(),
        }
    }

    /// Number of records sealed so far.
    pub fn records_written(&self) -> u64 {
        self.counter
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordWrite for SessionWriter<W> {
    async fn write_record(&mut self, record: &[u8]) -> carrier_proto::Result<()> {
        self.scratch.clear();
        self.scratch.reserve(record.len() + TAG_SIZE);
        self.scratch.extend_from_slice(record);

        let nonce = nonce_for(self.counter);
        self.counter = self.counter.wrapping_add(1);
        self.cipher.encrypt_in_place(Nonce::from_slice(&nonce), b"", &mut self.scratch).map_err(
            |_| ProtocolError::RecordTooLarge { size: record.len(), max: u32::MAX as usize },
        )?;

        write_record(&mut self.inner, &self.scratch).await
    }

    async fn flush(&mut self) -> carrier_proto::Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> carrier_proto::Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::session::Session;

    async fn keyed_pair() -> (crate::SessionKeys, crate::SessionKeys) {
        let (mut client, mut server) = tokio::io::duplex(256);
        let acceptor = tokio::spawn(async move { Session::new().accept(&mut server).await });
        let client_keys = Session::new().initiate(&mut client).await.unwrap();
        (client_keys, acceptor.await.unwrap().unwrap())
    }

    #[test]
    fn nonce_counter_fills_leading_bytes() {
        assert_eq!(nonce_for(0), [0u8; 12]);
        assert_eq!(nonce_for(1), [0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(nonce_for(0x0102), [0, 0, 0, 0, 0, 0, 1, 2, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn sealed_records_round_trip() {
        let (client_keys, server_keys) = keyed_pair().await;
        let config = RecordConfig::default();
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut writer = client_keys.writer(a, &config);
        let mut reader = server_keys.reader(b, &config);

        let messages: Vec<Vec<u8>> = (0..64u8).map(|i| vec![i; usize::from(i) * 3]).collect();
        let expected = messages.clone();
        let send = tokio::spawn(async move {
            for m in &messages {
                writer.write_record(m).await.unwrap();
            }
            writer.flush().await.unwrap();
            writer
        });

        let mut buf = Vec::new();
        for m in &expected {
            reader.read_record(&mut buf).await.unwrap();
            assert_eq!(&buf, m);
        }
        assert_eq!(reader.records_read(), 64);
        assert_eq!(send.await.unwrap().records_written(), 64);
    }

    #[tokio::test]
    async fn ciphertext_differs_from_plaintext() {
        let (client_keys, _) = keyed_pair().await;
        let mut writer = client_keys.writer(Vec::new(), &RecordConfig::default());
        writer.write_record(b"attack at dawn").await.unwrap();
        writer.flush().await.unwrap();

        let wire = writer.inner.into_inner();
        assert_eq!(wire.len(), 4 + 14 + TAG_SIZE);
        assert!(!wire.windows(14).any(|w| w == b"attack at dawn"));
    }

    #[tokio::test]
    async fn tampered_record_fails_authentication() {
        let (client_keys, server_keys) = keyed_pair().await;
        let config = RecordConfig::default();

        let mut writer = client_keys.writer(Vec::new(), &config);
        writer.write_record(b"hello").await.unwrap();
        writer.flush().await.unwrap();
        let mut wire = writer.inner.into_inner();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let mut reader = server_keys.reader(wire.as_slice(), &config);
        let mut buf = Vec::new();
        let err = reader.read_record(&mut buf).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Authentication));
    }

    #[tokio::test]
    async fn replayed_record_fails_authentication() {
        let (client_keys, server_keys) = keyed_pair().await;
        let config = RecordConfig::default();

        let mut writer = client_keys.writer(Vec::new(), &config);
        writer.write_record(b"once").await.unwrap();
        writer.flush().await.unwrap();
        let once = writer.inner.into_inner();
        let twice = [once.clone(), once].concat();

        let mut reader = server_keys.reader(twice.as_slice(), &config);
        let mut buf = Vec::new();
        reader.read_record(&mut buf).await.unwrap();
        assert_eq!(buf, b"once");
        let err = reader.read_record(&mut buf).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Authentication));
    }

    #[tokio::test]
    async fn wrong_key_fails_authentication() {
        let (client_keys, _) = keyed_pair().await;
        let (_, stranger) = keyed_pair().await;
        let config = RecordConfig::default();

        let mut writer = client_keys.writer(Vec::new(), &config);
        writer.write_record(b"hello").await.unwrap();
        writer.flush().await.unwrap();
        let wire = writer.inner.into_inner();

        let mut reader = stranger.reader(wire.as_slice(), &config);
        let mut buf = Vec::new();
        assert!(matches!(
            reader.read_record(&mut buf).await,
            Err(ProtocolError::Authentication)
        ));
    }

    proptest! {
        #[test]
        fn any_payload_opens_to_itself(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (client_keys, server_keys) = keyed_pair().await;
                let config = RecordConfig::default();

                let mut writer = client_keys.writer(Vec::new(), &config);
                writer.write_record(&payload).await.unwrap();
                writer.flush().await.unwrap();
                let wire = writer.inner.into_inner();

                let mut reader = server_keys.reader(wire.as_slice(), &config);
                let mut buf = Vec::new();
                reader.read_record(&mut buf).await.unwrap();
                prop_assert_eq!(buf, payload.clone());
                Ok(())
            })?;
        }
    }
}
