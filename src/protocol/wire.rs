//! Line- and block-oriented frame codec for the proxy wire protocol.
//!
//! The protocol mixes three primitive shapes on one TCP stream:
//!
//! - **lines**: UTF-8 text terminated by `\n`, `\r` or `\r\n`
//! - **fixed-width big-endian integers**: u8, u16, u32, u64
//! - **length-prefixed blocks**: a u32 byte count followed by that many
//!   bytes, where a zero count means "absent"
//!
//! [`FrameReader`] buffers the inbound stream and keeps one byte of
//! push-back so a `\r` terminator can peek at the following byte without
//! losing it. A partially accumulated line survives cancellation, which
//! keeps [`FrameReader::read_line_timeout`] safe to race against a timer.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DisServiceError, Result};

/// Target refill size for the read buffer.
const FILL_SIZE: usize = 2048;

/// Buffered reader for the proxy protocol's mixed line/binary framing.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    /// Byte consumed while looking past a `\r` terminator.
    pushback: Option<u8>,
    /// Line bytes accumulated so far. Kept in the struct so a cancelled
    /// `read_line` call loses nothing.
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(FILL_SIZE),
            pushback: None,
            line: Vec::new(),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        self.buf.reserve(FILL_SIZE);
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(DisServiceError::ConnectionClosed);
        }
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8> {
        if let Some(b) = self.pushback.take() {
            return Ok(b);
        }
        if self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(self.buf.get_u8())
    }

    fn push_back(&mut self, b: u8) {
        debug_assert!(self.pushback.is_none());
        self.pushback = Some(b);
    }

    /// Reads one text line. Accepts `\n`, `\r` and `\r\n` terminators; the
    /// terminator is consumed and not returned.
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            let b = self.read_byte().await?;
            match b {
                b'\n' => break,
                b'\r' => {
                    let next = self.read_byte().await?;
                    if next != b'\n' {
                        self.push_back(next);
                    }
                    break;
                }
                other => self.line.push(other),
            }
        }
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        Ok(line)
    }

    /// Reads one text line, bounded by `timeout` when one is configured.
    pub async fn read_line_timeout(&mut self, timeout: Option<Duration>) -> Result<String> {
        match timeout {
            None => self.read_line().await,
            Some(t) => match tokio::time::timeout(t, self.read_line()).await {
                Ok(res) => res,
                Err(_) => Err(DisServiceError::ResponseTimeout),
            },
        }
    }

    /// Reads exactly `len` bytes.
    pub async fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut out = BytesMut::with_capacity(len);
        if let Some(b) = self.pushback.take() {
            out.extend_from_slice(&[b]);
        }
        while out.len() < len {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let take = (len - out.len()).min(self.buf.len());
            out.extend_from_slice(&self.buf.split_to(take));
        }
        Ok(out.freeze())
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        self.read_byte().await
    }

    pub async fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_exact(2).await?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub async fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_exact(4).await?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub async fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_exact(8).await?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads a length-prefixed block. A zero length decodes to `None`.
    pub async fn read_block(&mut self) -> Result<Option<Bytes>> {
        let len = self.read_u32().await?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_exact(len as usize).await?))
    }

    /// Reads a length-prefixed block as text. A zero length decodes to
    /// `None`, never to `Some("")`.
    pub async fn read_string_block(&mut self) -> Result<Option<String>> {
        Ok(self
            .read_block()
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }
}

/// Writer for the proxy protocol. Every write is flushed immediately so the
/// server never sits on a partial request.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes a text line terminated by `\n`.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_u8(&mut self, v: u8) -> Result<()> {
        self.inner.write_all(&[v]).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_u16(&mut self, v: u16) -> Result<()> {
        self.inner.write_all(&v.to_be_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_u32(&mut self, v: u32) -> Result<()> {
        self.inner.write_all(&v.to_be_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_u64(&mut self, v: u64) -> Result<()> {
        self.inner.write_all(&v.to_be_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Writes raw bytes without a length prefix.
    pub async fn write_blob(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Writes a length-prefixed block. `None` and the empty slice both
    /// encode as a zero length.
    pub async fn write_block(&mut self, data: Option<&[u8]>) -> Result<()> {
        match data {
            Some(d) if !d.is_empty() => {
                self.write_u32(d.len() as u32).await?;
                self.write_blob(d).await
            }
            _ => self.write_u32(0).await,
        }
    }

    /// Writes a length-prefixed text block.
    pub async fn write_string_block(&mut self, s: Option<&str>) -> Result<()> {
        self.write_block(s.map(|s| s.as_bytes())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_line_terminators() {
        let data: &[u8] = b"first\nsecond\rthird\r\nfourth\n";
        let mut reader = FrameReader::new(data);
        assert_eq!(reader.read_line().await.unwrap(), "first");
        assert_eq!(reader.read_line().await.unwrap(), "second");
        assert_eq!(reader.read_line().await.unwrap(), "third");
        assert_eq!(reader.read_line().await.unwrap(), "fourth");
    }

    #[tokio::test]
    async fn test_cr_pushback_preserves_next_byte() {
        // "a\rb\n": the byte after \r is data, not \n, and must not be lost.
        let data: &[u8] = b"a\rb\n";
        let mut reader = FrameReader::new(data);
        assert_eq!(reader.read_line().await.unwrap(), "a");
        assert_eq!(reader.read_line().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_read_integers_big_endian() {
        let mut data = Vec::new();
        data.push(0x7fu8);
        data.extend_from_slice(&0x0102u16.to_be_bytes());
        data.extend_from_slice(&0xdeadbeefu32.to_be_bytes());
        data.extend_from_slice(&0x0102030405060708u64.to_be_bytes());
        let mut reader = FrameReader::new(&data[..]);
        assert_eq!(reader.read_u8().await.unwrap(), 0x7f);
        assert_eq!(reader.read_u16().await.unwrap(), 0x0102);
        assert_eq!(reader.read_u32().await.unwrap(), 0xdeadbeef);
        assert_eq!(reader.read_u64().await.unwrap(), 0x0102030405060708);
    }

    #[tokio::test]
    async fn test_zero_length_block_is_none() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(b"abc");
        let mut reader = FrameReader::new(&data[..]);
        assert_eq!(reader.read_string_block().await.unwrap(), None);
        assert_eq!(
            reader.read_string_block().await.unwrap(),
            Some("abc".to_string())
        );
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let data: &[u8] = b"no newline";
        let mut reader = FrameReader::new(data);
        let err = reader.read_line().await.unwrap_err();
        assert!(matches!(err, DisServiceError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_line_timeout_expires() {
        // A duplex pair with nothing written never produces a line.
        let (client, _server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(client);
        let err = reader
            .read_line_timeout(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, DisServiceError::ResponseTimeout));
    }

    #[tokio::test]
    async fn test_writer_blocks_and_lines() {
        let mut out = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut out);
            writer.write_line("push").await.unwrap();
            writer.write_string_block(Some("obj")).await.unwrap();
            writer.write_string_block(None).await.unwrap();
            writer.write_block(Some(b"")).await.unwrap();
            writer.write_u16(7).await.unwrap();
        }
        let mut expected = Vec::new();
        expected.extend_from_slice(b"push\n");
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(b"obj");
        expected.extend_from_slice(&0u32.to_be_bytes());
        expected.extend_from_slice(&0u32.to_be_bytes());
        expected.extend_from_slice(&7u16.to_be_bytes());
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_read_exact_across_refills() {
        let data = vec![0xabu8; 5000];
        let mut reader = FrameReader::new(&data[..]);
        let got = reader.read_exact(5000).await.unwrap();
        assert_eq!(got.len(), 5000);
        assert!(got.iter().all(|&b| b == 0xab));
    }
}
