//! Length-prefixed command framing.
//!
//! Three header dialects cover every version (see [`HeaderDialect`]). The
//! decoder is incremental: it decrypts bytes as they arrive, emits a frame
//! as soon as the buffer holds one, and never waits for more bytes than the
//! header promises. Encoding pads to the dialect's alignment with zero
//! bytes before encryption, so the output cipher always advances by the
//! full padded length of every send.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::crypt::Cipher;
use crate::version::Version;

/// Framing errors. Any of these disconnects the channel.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame size {size:#x} is invalid (header is {header} bytes, limit is {limit:#x})")]
    MalformedFrame {
        size: usize,
        header: usize,
        limit: usize,
    },
    #[error("command {command:#04x} does not fit this dialect's header")]
    CommandOutOfRange { command: u16 },
}

/// Wire header layout.
///
/// | Dialect | Layout                               | Alignment |
/// |---------|--------------------------------------|-----------|
/// | Dc      | u8 command, u8 flag, u16 size (LE)   | 4         |
/// | Pc      | u16 size, u8 command, u8 flag (LE)   | 4         |
/// | Bb      | u16 size, u16 command, u32 flag (LE) | 8         |
///
/// `size` counts the header plus payload, before padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderDialect {
    Dc,
    Pc,
    Bb,
}

impl HeaderDialect {
    pub const fn header_size(self) -> usize {
        match self {
            HeaderDialect::Dc | HeaderDialect::Pc => 4,
            HeaderDialect::Bb => 8,
        }
    }

    pub const fn alignment(self) -> usize {
        match self {
            HeaderDialect::Dc | HeaderDialect::Pc => 4,
            HeaderDialect::Bb => 8,
        }
    }

    fn parse_header(self, bytes: &[u8]) -> (u16, u32, usize) {
        match self {
            HeaderDialect::Dc => {
                let size = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
                (bytes[0] as u16, bytes[1] as u32, size)
            }
            HeaderDialect::Pc => {
                let size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
                (bytes[2] as u16, bytes[3] as u32, size)
            }
            HeaderDialect::Bb => {
                let size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
                let command = u16::from_le_bytes([bytes[2], bytes[3]]);
                let flag = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                (command, flag, size)
            }
        }
    }

    fn write_header(
        self,
        command: u16,
        flag: u32,
        size: usize,
        out: &mut BytesMut,
    ) -> Result<(), FrameError> {
        match self {
            HeaderDialect::Dc => {
                if command > 0xFF {
                    return Err(FrameError::CommandOutOfRange { command });
                }
                out.put_u8(command as u8);
                out.put_u8(flag as u8);
                out.put_u16_le(size as u16);
            }
            HeaderDialect::Pc => {
                if command > 0xFF {
                    return Err(FrameError::CommandOutOfRange { command });
                }
                out.put_u16_le(size as u16);
                out.put_u8(command as u8);
                out.put_u8(flag as u8);
            }
            HeaderDialect::Bb => {
                out.put_u16_le(size as u16);
                out.put_u16_le(command);
                out.put_u32_le(flag);
            }
        }
        Ok(())
    }
}

/// One decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u16,
    pub flag: u32,
    pub payload: Bytes,
}

const fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Inbound half of the framing layer: decrypts in place and deframes.
#[derive(Debug)]
pub struct FrameDecoder {
    dialect: HeaderDialect,
    max_size: usize,
    cipher: Option<Cipher>,
    /// Bytes at the front of the caller's buffer already decrypted.
    decrypted: usize,
}

impl FrameDecoder {
    pub fn new(version: Version) -> Self {
        FrameDecoder {
            dialect: version.header_dialect(),
            max_size: version.max_command_size(),
            cipher: None,
            decrypted: 0,
        }
    }

    /// Install the input cipher. Anything still buffered arrived after the
    /// handshake and is ciphertext, so the decrypted watermark resets.
    pub fn set_cipher(&mut self, cipher: Cipher) {
        self.cipher = Some(cipher);
        self.decrypted = 0;
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// Try to extract one frame from `buf`. Returns `Ok(None)` when more
    /// bytes are needed. `buf` accumulates raw socket reads; this method
    /// decrypts it in place up to the cipher's block granularity.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let header = self.dialect.header_size();
        self.decrypt_available(buf);

        if self.decrypted < header {
            return Ok(None);
        }

        let (command, flag, size) = self.dialect.parse_header(&buf[..header]);
        if size < header || size > self.max_size {
            return Err(FrameError::MalformedFrame {
                size,
                header,
                limit: self.max_size,
            });
        }

        let block = self.cipher.as_ref().map_or(1, Cipher::block_size);
        // Block ciphers force the peer to pad; the byte cipher and the
        // plaintext pre-handshake phase consume padding opportunistically.
        let consumed = if block > 1 {
            align_up(size, self.dialect.alignment())
        } else {
            size
        };
        if self.decrypted < consumed {
            return Ok(None);
        }

        let frame_bytes = buf.split_to(consumed).freeze();
        self.decrypted -= consumed;
        if block == 1 {
            self.skip_zero_padding(buf, size);
        }

        Ok(Some(Frame {
            command,
            flag,
            payload: frame_bytes.slice(header..size),
        }))
    }

    fn decrypt_available(&mut self, buf: &mut BytesMut) {
        let Some(cipher) = self.cipher.as_mut() else {
            self.decrypted = buf.len();
            return;
        };
        let block = cipher.block_size();
        let limit = buf.len() - (buf.len() - self.decrypted) % block;
        if limit > self.decrypted {
            cipher.decrypt(&mut buf[self.decrypted..limit]);
            self.decrypted = limit;
        }
    }

    /// Consume zero bytes up to the next alignment boundary. Peers that pad
    /// to alignment are tolerated without desyncing ones that don't.
    fn skip_zero_padding(&mut self, buf: &mut BytesMut, size: usize) {
        let alignment = self.dialect.alignment();
        let mut remainder = (alignment - size % alignment) % alignment;
        while remainder > 0 && self.decrypted > 0 && buf[0] == 0 {
            buf.advance(1);
            self.decrypted -= 1;
            remainder -= 1;
        }
    }
}

/// Outbound half of the framing layer: frames, pads, encrypts.
#[derive(Debug)]
pub struct FrameEncoder {
    dialect: HeaderDialect,
    max_size: usize,
    cipher: Option<Cipher>,
}

impl FrameEncoder {
    pub fn new(version: Version) -> Self {
        FrameEncoder {
            dialect: version.header_dialect(),
            max_size: version.max_command_size(),
            cipher: None,
        }
    }

    pub fn set_cipher(&mut self, cipher: Cipher) {
        self.cipher = Some(cipher);
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// Append one framed, padded, encrypted command to `out`.
    pub fn encode(
        &mut self,
        command: u16,
        flag: u32,
        payload: &[u8],
        out: &mut BytesMut,
    ) -> Result<(), FrameError> {
        let header = self.dialect.header_size();
        let size = header + payload.len();
        if size > self.max_size {
            return Err(FrameError::MalformedFrame {
                size,
                header,
                limit: self.max_size,
            });
        }
        let padded = align_up(size, self.dialect.alignment());

        let start = out.len();
        out.reserve(padded);
        self.dialect.write_header(command, flag, size, out)?;
        out.put_slice(payload);
        out.put_bytes(0, padded - size);

        if let Some(cipher) = self.cipher.as_mut() {
            cipher.encrypt(&mut out[start..]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::{DcCipher, GcCipher, PcCipher};

    fn encode_one(version: Version, cipher: Option<Cipher>, cmd: u16, flag: u32, payload: &[u8]) -> BytesMut {
        let mut enc = FrameEncoder::new(version);
        if let Some(c) = cipher {
            enc.set_cipher(c);
        }
        let mut out = BytesMut::new();
        enc.encode(cmd, flag, payload, &mut out).unwrap();
        out
    }

    #[test]
    fn plaintext_round_trip_all_dialects() {
        for version in [Version::DcV2, Version::PcV2, Version::BbV4] {
            let wire = encode_one(version, None, 0x60, 3, b"hello world");
            let mut dec = FrameDecoder::new(version);
            let mut buf = BytesMut::from(&wire[..]);
            let frame = dec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.command, 0x60);
            assert_eq!(frame.flag, 3);
            assert_eq!(&frame.payload[..], b"hello world");
            assert!(dec.decode(&mut buf).unwrap().is_none());
        }
    }

    #[test]
    fn encrypted_round_trip_gc() {
        let wire = encode_one(
            Version::GcV3,
            Some(Cipher::Gc(GcCipher::new(0x1111))),
            0x64,
            0,
            &[7u8; 0x2D],
        );
        let mut dec = FrameDecoder::new(Version::GcV3);
        dec.set_cipher(Cipher::Gc(GcCipher::new(0x1111)));
        let mut buf = BytesMut::from(&wire[..]);
        let frame = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, 0x64);
        assert_eq!(&frame.payload[..], &[7u8; 0x2D]);
    }

    #[test]
    fn partial_reads_accumulate() {
        let wire = encode_one(
            Version::PcV2,
            Some(Cipher::Pc(PcCipher::new(5))),
            0x06,
            1,
            b"chat text here",
        );
        let mut dec = FrameDecoder::new(Version::PcV2);
        dec.set_cipher(Cipher::Pc(PcCipher::new(5)));

        let mut buf = BytesMut::new();
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let result = dec.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none(), "frame emitted early at byte {i}");
            } else {
                let frame = result.unwrap();
                assert_eq!(frame.command, 0x06);
                assert_eq!(&frame.payload[..], b"chat text here");
            }
        }
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let mut enc = FrameEncoder::new(Version::DcV2);
        enc.set_cipher(Cipher::Dc(DcCipher::new(42)));
        let mut wire = BytesMut::new();
        enc.encode(0x40, 0, &[1, 2, 3, 4], &mut wire).unwrap();
        enc.encode(0x42, 1, &[5, 6, 7, 8, 9], &mut wire).unwrap();

        let mut dec = FrameDecoder::new(Version::DcV2);
        dec.set_cipher(Cipher::Dc(DcCipher::new(42)));
        let mut buf = BytesMut::from(&wire[..]);
        let first = dec.decode(&mut buf).unwrap().unwrap();
        let second = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((first.command, &first.payload[..]), (0x40, &[1u8, 2, 3, 4][..]));
        assert_eq!((second.command, &second.payload[..]), (0x42, &[5u8, 6, 7, 8, 9][..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn undersized_frame_rejected() {
        // size field smaller than the header itself
        let mut buf = BytesMut::from(&[0x60u8, 0x00, 0x02, 0x00][..]);
        let mut dec = FrameDecoder::new(Version::DcV2);
        assert!(matches!(
            dec.decode(&mut buf),
            Err(FrameError::MalformedFrame { size: 2, .. })
        ));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut enc = FrameEncoder::new(Version::DcV2);
        let mut out = BytesMut::new();
        let too_big = vec![0u8; 0x10000];
        assert!(matches!(
            enc.encode(0x60, 0, &too_big, &mut out),
            Err(FrameError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn wide_command_rejected_on_narrow_dialect() {
        let mut enc = FrameEncoder::new(Version::GcV3);
        let mut out = BytesMut::new();
        assert!(matches!(
            enc.encode(0x1DB, 0, &[], &mut out),
            Err(FrameError::CommandOutOfRange { command: 0x1DB })
        ));
    }

    #[test]
    fn unpadded_dc_peer_tolerated() {
        // A DC peer that sends size=6 with no padding, twice back to back.
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x06, 0x00, 0x06, 0x00, b'h', b'i']);
        buf.put_slice(&[0x06, 0x00, 0x06, 0x00, b'y', b'o']);
        let mut dec = FrameDecoder::new(Version::DcV2);
        let first = dec.decode(&mut buf).unwrap().unwrap();
        let second = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"hi");
        assert_eq!(&second.payload[..], b"yo");
    }

    #[test]
    fn padded_plaintext_peer_tolerated() {
        // Same command but padded to 4-byte alignment with zero bytes.
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x06, 0x00, 0x06, 0x00, b'h', b'i', 0, 0]);
        buf.put_slice(&[0x06, 0x00, 0x06, 0x00, b'y', b'o', 0, 0]);
        let mut dec = FrameDecoder::new(Version::DcV2);
        let first = dec.decode(&mut buf).unwrap().unwrap();
        let second = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"hi");
        assert_eq!(&second.payload[..], b"yo");
        assert!(dec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bb_alignment_is_eight() {
        let wire = encode_one(Version::BbV4, None, 0x93, 0, &[1, 2, 3]);
        assert_eq!(wire.len(), 16); // 8 header + 3 payload padded to 16
        assert_eq!(u16::from_le_bytes([wire[0], wire[1]]), 11); // unpadded size
    }
}
