//! Per-version stream ciphers and the handshake key types.
//!
//! Four cipher families cover every supported client. The first three are
//! keystream generators XORed over the wire bytes (encrypt and decrypt are
//! the same operation); Blue Burst is a short Feistel block cipher, so its
//! two directions differ. A [`Cipher`] value is one keyed instance; each
//! channel owns two, one per direction.

mod bb;
mod dc;
mod gc;
mod pc;

pub use bb::{BbCipher, BbKeyMaterial, BbPrivateKey, BB_KEY_MATERIAL_SIZE, BB_PRIVATE_KEY_FILE_SIZE};
pub use dc::DcCipher;
pub use gc::GcCipher;
pub use pc::PcCipher;

use thiserror::Error;

/// Cipher construction errors.
#[derive(Debug, Error)]
pub enum CryptError {
    #[error("private key file is {actual} bytes; expected {expected}")]
    InvalidPrivateKeyFile { actual: usize, expected: usize },
}

/// Which algorithm a version keys at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherFamily {
    /// PC v2 and the patch protocol: 521-word keystream, 4-byte LE words.
    Pc,
    /// GameCube and Xbox v3: 56-word keystream, 4-byte BE words.
    Gc,
    /// Dreamcast v1/v2: 17-byte keystream, byte-at-a-time.
    Dc,
    /// Blue Burst: 4-round Feistel block cipher, 8-byte LE blocks.
    Bb,
}

impl CipherFamily {
    /// The unit the cipher advances in. The framing layer only ever hands a
    /// cipher a multiple of this many bytes.
    pub const fn block_size(self) -> usize {
        match self {
            CipherFamily::Pc | CipherFamily::Gc => 4,
            CipherFamily::Dc => 1,
            CipherFamily::Bb => 8,
        }
    }
}

/// A keyed cipher instance for one direction of one channel.
#[derive(Debug, Clone)]
pub enum Cipher {
    Pc(PcCipher),
    Gc(GcCipher),
    Dc(DcCipher),
    Bb(Box<BbCipher>),
}

impl Cipher {
    pub fn family(&self) -> CipherFamily {
        match self {
            Cipher::Pc(_) => CipherFamily::Pc,
            Cipher::Gc(_) => CipherFamily::Gc,
            Cipher::Dc(_) => CipherFamily::Dc,
            Cipher::Bb(_) => CipherFamily::Bb,
        }
    }

    pub fn block_size(&self) -> usize {
        self.family().block_size()
    }

    /// Encrypt `data` in place. `data.len()` must be a multiple of
    /// [`Self::block_size`].
    pub fn encrypt(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % self.block_size(), 0);
        match self {
            Cipher::Pc(c) => c.apply(data),
            Cipher::Gc(c) => c.apply(data),
            Cipher::Dc(c) => c.apply(data),
            Cipher::Bb(c) => c.encrypt(data),
        }
    }

    /// Decrypt `data` in place. `data.len()` must be a multiple of
    /// [`Self::block_size`].
    pub fn decrypt(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % self.block_size(), 0);
        match self {
            Cipher::Pc(c) => c.apply(data),
            Cipher::Gc(c) => c.apply(data),
            Cipher::Dc(c) => c.apply(data),
            Cipher::Bb(c) => c.decrypt(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(mut enc: Cipher, mut dec: Cipher, len: usize) {
        let plain: Vec<u8> = (0..len).map(|i| (i * 7 + 13) as u8).collect();
        let mut buf = plain.clone();
        enc.encrypt(&mut buf);
        assert_ne!(buf, plain, "ciphertext must differ from plaintext");
        dec.decrypt(&mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn pc_round_trip() {
        round_trip(
            Cipher::Pc(PcCipher::new(0xDEADBEEF)),
            Cipher::Pc(PcCipher::new(0xDEADBEEF)),
            0x40,
        );
    }

    #[test]
    fn gc_round_trip() {
        round_trip(
            Cipher::Gc(GcCipher::new(0xCAFEBABE)),
            Cipher::Gc(GcCipher::new(0xCAFEBABE)),
            0x100,
        );
    }

    #[test]
    fn dc_round_trip() {
        round_trip(
            Cipher::Dc(DcCipher::new(0x12345678)),
            Cipher::Dc(DcCipher::new(0x12345678)),
            0x33,
        );
    }

    #[test]
    fn bb_round_trip() {
        let privkey = BbPrivateKey::from_seed(4);
        let key = BbKeyMaterial([0x5A; BB_KEY_MATERIAL_SIZE]);
        round_trip(
            Cipher::Bb(Box::new(BbCipher::new(&key, &privkey))),
            Cipher::Bb(Box::new(BbCipher::new(&key, &privkey))),
            0x48,
        );
    }

    #[test]
    fn keystreams_are_deterministic() {
        // Two fresh ciphers with the same key must advance identically even
        // when fed different plaintext.
        let mut a = Cipher::Gc(GcCipher::new(7));
        let mut b = Cipher::Gc(GcCipher::new(7));
        let mut zeros = vec![0u8; 64];
        let mut ones = vec![0xFFu8; 64];
        a.encrypt(&mut zeros);
        b.encrypt(&mut ones);
        for (z, o) in zeros.iter().zip(ones.iter()) {
            assert_eq!(z ^ 0x00, o ^ 0xFF);
        }
    }

    #[test]
    fn different_keys_differ() {
        let mut a = Cipher::Pc(PcCipher::new(1));
        let mut b = Cipher::Pc(PcCipher::new(2));
        let mut x = vec![0u8; 32];
        let mut y = vec![0u8; 32];
        a.encrypt(&mut x);
        b.encrypt(&mut y);
        assert_ne!(x, y);
    }
}
