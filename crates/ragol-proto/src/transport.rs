//! Async framed transport over a TCP stream.
//!
//! A [`Transport`] pairs a duplex byte stream with a [`FrameDecoder`] and
//! [`FrameEncoder`]. Before the handshake both directions are plaintext;
//! [`Transport::set_ciphers`] installs the keyed pair. [`Transport::split`]
//! hands out independent halves so a connection task can read and write
//! concurrently inside one `select!` loop — the two directions' ciphers are
//! independent, so the split is clean.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::crypt::Cipher;
use crate::frame::{Frame, FrameDecoder, FrameEncoder, FrameError};
use crate::version::Version;

/// Transport errors: framing violations or socket I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

const READ_CHUNK: usize = 0x1000;

/// A framed, optionally encrypted PSO connection.
pub struct Transport<S = TcpStream> {
    stream: S,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Transport<TcpStream> {
    pub fn tcp(stream: TcpStream, version: Version) -> Self {
        Transport::new(stream, version)
    }

    /// Split into independently owned receive and send halves.
    pub fn split(self) -> (RecvHalf, SendHalf) {
        let (read, write) = self.stream.into_split();
        (
            RecvHalf {
                stream: read,
                decoder: self.decoder,
                buf: self.read_buf,
            },
            SendHalf {
                stream: write,
                encoder: self.encoder,
                buf: self.write_buf,
            },
        )
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub fn new(stream: S, version: Version) -> Self {
        Transport {
            stream,
            decoder: FrameDecoder::new(version),
            encoder: FrameEncoder::new(version),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Install the cipher pair after sending the encryption-init command.
    /// `input` decrypts bytes from the peer; `output` encrypts our sends.
    pub fn set_ciphers(&mut self, input: Cipher, output: Cipher) {
        self.decoder.set_cipher(input);
        self.encoder.set_cipher(output);
    }

    pub fn is_encrypted(&self) -> bool {
        self.decoder.has_cipher()
    }

    /// Receive the next command. `Ok(None)` means the peer closed cleanly.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(Some(frame));
            }
            self.read_buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Frame, pad, encrypt, and write one command.
    pub async fn send(&mut self, command: u16, flag: u32, payload: &[u8]) -> Result<(), TransportError> {
        self.write_buf.clear();
        self.encoder.encode(command, flag, payload, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Inbound half of a split [`Transport`].
pub struct RecvHalf {
    stream: OwnedReadHalf,
    decoder: FrameDecoder,
    buf: BytesMut,
}

impl RecvHalf {
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }
}

/// Outbound half of a split [`Transport`].
pub struct SendHalf {
    stream: OwnedWriteHalf,
    encoder: FrameEncoder,
    buf: BytesMut,
}

impl SendHalf {
    pub async fn send(&mut self, command: u16, flag: u32, payload: &[u8]) -> Result<(), TransportError> {
        self.buf.clear();
        self.encoder.encode(command, flag, payload, &mut self.buf)?;
        self.stream.write_all(&self.buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
