//! Length-prefixed record I/O.
//!
//! Wire format: `[4-byte length as u32 big-endian] + [record bytes]`.
//!
//! The connection engine never touches raw streams directly. It reads and
//! writes whole records through [`RecordRead`] and [`RecordWrite`], which lets
//! the same engine run over plaintext streams ([`RecordReader`] /
//! [`RecordWriter`]) and encrypted sessions.

use async_trait::async_trait;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};

use crate::errors::{ProtocolError, Result, from_read};

/// Size of the record length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Buffering and size limits for record streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordConfig {
    /// Capacity of the read-side buffer
    pub read_buffer_size: usize,
    /// Capacity of the write-side buffer
    pub write_buffer_size: usize,
    /// Largest record accepted from the peer
    pub max_record_size: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self { read_buffer_size: 4096, write_buffer_size: 4096, max_record_size: 16 * 1024 * 1024 }
    }
}

/// Write one record: length prefix followed by `record`.
///
/// Does not flush.
pub async fn write_record<W>(writer: &mut W, record: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(record.len()).map_err(|_| ProtocolError::RecordTooLarge {
        size: record.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(record).await?;
    Ok(())
}

/// Read one record into `dst`, replacing its contents.
///
/// # Errors
///
/// - [`ProtocolError::RecordTooLarge`] if the prefix announces more than `max`
/// - [`ProtocolError::UnexpectedEof`] if the stream ends mid-record
pub async fn read_record<R>(reader: &mut R, dst: &mut Vec<u8>, max: usize) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await.map_err(from_read)?;

    let prefix = u32::from_be_bytes(len_buf);
    let len = prefix as usize;
    if len > max {
        return Err(ProtocolError::RecordTooLarge { size: len, max });
    }

    // Grow with the bytes that actually arrive, not with the prefix.
    dst.clear();
    let read =
        (&mut *reader).take(u64::from(prefix)).read_to_end(dst).await.map_err(from_read)?;
    if read < len {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(())
}

/// Source of whole records.
#[async_trait]
pub trait RecordRead: Send {
    /// Read the next record into `dst`, replacing its contents.
    async fn read_record(&mut self, dst: &mut Vec<u8>) -> Result<()>;
}

/// Sink of whole records.
///
/// Writes may be buffered; nothing is guaranteed to reach the peer until
/// [`RecordWrite::flush`] returns.
#[async_trait]
pub trait RecordWrite: Send {
    /// Queue one record for transmission.
    async fn write_record(&mut self, record: &[u8]) -> Result<()>;

    /// Push buffered records to the stream.
    async fn flush(&mut self) -> Result<()>;

    /// Flush and close the write side of the stream.
    async fn shutdown(&mut self) -> Result<()>;
}

#[async_trait]
impl<T: RecordRead + ?Sized> RecordRead for Box<T> {
    async fn read_record(&mut self, dst: &mut Vec<u8>) -> Result<()> {
        (**self).read_record(dst).await
    }
}

#[async_trait]
impl<T: RecordWrite + ?Sized> RecordWrite for Box<T> {
    async fn write_record(&mut self, record: &[u8]) -> Result<()> {
        (**self).write_record(record).await
    }

    async fn flush(&mut self) -> Result<()> {
        (**self).flush().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        (**self).shutdown().await
    }
}

/// Plaintext record reader over a buffered stream.
#[derive(Debug)]
pub struct RecordReader<R> {
    inner: BufReader<R>,
    max_record_size: usize,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    /// Wrap `inner` with the buffering and limits from `config`.
    pub fn new(inner: R, config: &RecordConfig) -> Self {
        Self {
            inner: BufReader::with_capacity(config.read_buffer_size, inner),
            max_record_size: config.max_record_size,
        }
    }

    /// Largest record this reader accepts.
    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> RecordRead for RecordReader<R> {
    async fn read_record(&mut self, dst: &mut Vec<u8>) -> Result<()> {
        read_record(&mut self.inner, dst, self.max_record_size).await
    }
}

/// Plaintext record writer over a buffered stream.
#[derive(Debug)]
pub struct RecordWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    /// Wrap `inner` with the buffering from `config`.
    pub fn new(inner: W, config: &RecordConfig) -> Self {
        Self { inner: BufWriter::with_capacity(config.write_buffer_size, inner) }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordWrite for RecordWriter<W> {
    async fn write_record(&mut self, record: &[u8]) -> Result<()> {
        write_record(&mut self.inner, record).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a stream into plaintext record halves.
pub fn split_plain<S>(
    stream: S,
    config: &RecordConfig,
) -> (RecordReader<ReadHalf<S>>, RecordWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (RecordReader::new(read, config), RecordWriter::new(write, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_survive_a_stream() {
        let (client, server) = tokio::io::duplex(64);
        let config = RecordConfig::default();
        let (_client_read, mut client_write) = split_plain(client, &config);
        let (mut server_read, _server_write) = split_plain(server, &config);

        let writer = tokio::spawn(async move {
            client_write.write_record(b"first").await.unwrap();
            client_write.write_record(b"").await.unwrap();
            client_write.write_record(&[7u8; 300]).await.unwrap();
            client_write.flush().await.unwrap();
            client_write
        });

        let mut buf = Vec::new();
        server_read.read_record(&mut buf).await.unwrap();
        assert_eq!(buf, b"first");
        server_read.read_record(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        server_read.read_record(&mut buf).await.unwrap();
        assert_eq!(buf, [7u8; 300]);

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn short_body_does_not_allocate_the_announced_length() {
        let announced: u32 = 16 << 20;
        let mut wire = announced.to_be_bytes().to_vec();
        wire.extend_from_slice(b"only a few bytes");

        let mut buf = Vec::new();
        let err = read_record(&mut wire.as_slice(), &mut buf, 16 << 20).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof), "{err:?}");
        assert!(buf.capacity() < 1 << 20, "allocated {} bytes", buf.capacity());
    }

    #[tokio::test]
    async fn oversized_record_is_rejected() {
        let mut wire = Vec::new();
        write_record(&mut wire, &[0u8; 33]).await.unwrap();

        let mut buf = Vec::new();
        let err = read_record(&mut wire.as_slice(), &mut buf, 32).await.unwrap_err();
        assert!(matches!(err, ProtocolError::RecordTooLarge { size: 33, max: 32 }));
    }

    #[tokio::test]
    async fn short_body_is_unexpected_eof() {
        let mut wire = Vec::new();
        write_record(&mut wire, b"hello").await.unwrap();
        wire.truncate(wire.len() - 2);

        let mut buf = Vec::new();
        let err = read_record(&mut wire.as_slice(), &mut buf, 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn short_prefix_is_unexpected_eof() {
        let wire = [0u8, 0];
        let mut buf = Vec::new();
        let err = read_record(&mut &wire[..], &mut buf, 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }
}
