//! Client version identification.
//!
//! Every listening port is bound to exactly one `Version`; the version
//! selects the header dialect, the cipher family, and which command handler
//! tables apply. The enum is dense so per-version data can live in fixed
//! arrays indexed by [`Version::index`].

use crate::crypt::CipherFamily;
use crate::frame::HeaderDialect;

/// A supported client version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Version {
    /// Pre-login patch protocol (PC and BB patch ports).
    Patch = 0,
    /// Dreamcast Network Trial Edition.
    DcNte = 1,
    /// Dreamcast v1.
    DcV1 = 2,
    /// Dreamcast v2.
    DcV2 = 3,
    /// PC Network Trial Edition.
    PcNte = 4,
    /// PC v2.
    PcV2 = 5,
    /// GameCube Network Trial Edition.
    GcNte = 6,
    /// GameCube Episodes 1 & 2.
    GcV3 = 7,
    /// GameCube Episode III Trial Edition.
    GcEp3Nte = 8,
    /// GameCube Episode III.
    GcEp3 = 9,
    /// Xbox Episodes 1 & 2.
    XbV3 = 10,
    /// Blue Burst.
    BbV4 = 11,
}

impl Version {
    /// All versions, in index order.
    pub const ALL: [Version; 12] = [
        Version::Patch,
        Version::DcNte,
        Version::DcV1,
        Version::DcV2,
        Version::PcNte,
        Version::PcV2,
        Version::GcNte,
        Version::GcV3,
        Version::GcEp3Nte,
        Version::GcEp3,
        Version::XbV3,
        Version::BbV4,
    ];

    /// Number of versions (length of dense per-version tables).
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index for per-version array lookups.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The wire header layout spoken by this version.
    pub const fn header_dialect(self) -> HeaderDialect {
        match self {
            Version::Patch | Version::PcNte | Version::PcV2 => HeaderDialect::Pc,
            Version::BbV4 => HeaderDialect::Bb,
            _ => HeaderDialect::Dc,
        }
    }

    /// The cipher family keyed during the handshake.
    pub const fn cipher_family(self) -> CipherFamily {
        match self {
            Version::Patch | Version::PcNte | Version::PcV2 => CipherFamily::Pc,
            Version::DcNte | Version::DcV1 | Version::DcV2 => CipherFamily::Dc,
            Version::GcNte | Version::GcV3 | Version::GcEp3Nte | Version::GcEp3 | Version::XbV3 => {
                CipherFamily::Gc
            }
            Version::BbV4 => CipherFamily::Bb,
        }
    }

    /// Largest command (header + payload) this version may send or receive.
    /// BB's auth exchange carries full character files, so its cap is higher.
    pub const fn max_command_size(self) -> usize {
        match self {
            Version::BbV4 => 0x100000,
            _ => 0x10000,
        }
    }

    pub const fn is_dc(self) -> bool {
        matches!(self, Version::DcNte | Version::DcV1 | Version::DcV2)
    }

    pub const fn is_pc(self) -> bool {
        matches!(self, Version::PcNte | Version::PcV2)
    }

    pub const fn is_gc(self) -> bool {
        matches!(
            self,
            Version::GcNte | Version::GcV3 | Version::GcEp3Nte | Version::GcEp3
        )
    }

    /// GameCube or Xbox (the "v3" generation).
    pub const fn is_v3(self) -> bool {
        self.is_gc() || matches!(self, Version::XbV3)
    }

    pub const fn is_ep3(self) -> bool {
        matches!(self, Version::GcEp3Nte | Version::GcEp3)
    }

    /// Short lowercase tag used in config files and logs.
    pub const fn tag(self) -> &'static str {
        match self {
            Version::Patch => "patch",
            Version::DcNte => "dc-nte",
            Version::DcV1 => "dc-v1",
            Version::DcV2 => "dc-v2",
            Version::PcNte => "pc-nte",
            Version::PcV2 => "pc-v2",
            Version::GcNte => "gc-nte",
            Version::GcV3 => "gc-v3",
            Version::GcEp3Nte => "gc-ep3-nte",
            Version::GcEp3 => "gc-ep3",
            Version::XbV3 => "xb-v3",
            Version::BbV4 => "bb-v4",
        }
    }

    /// Parse a config-file tag. Returns `None` for unknown tags.
    pub fn from_tag(tag: &str) -> Option<Version> {
        Version::ALL.iter().copied().find(|v| v.tag() == tag)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_are_dense() {
        for (i, v) in Version::ALL.iter().enumerate() {
            assert_eq!(v.index(), i);
        }
        assert_eq!(Version::COUNT, 12);
    }

    #[test]
    fn tag_round_trip() {
        for v in Version::ALL {
            assert_eq!(Version::from_tag(v.tag()), Some(v));
        }
        assert_eq!(Version::from_tag("gamegear"), None);
    }

    #[test]
    fn dialect_assignment() {
        assert_eq!(Version::DcV2.header_dialect(), HeaderDialect::Dc);
        assert_eq!(Version::GcV3.header_dialect(), HeaderDialect::Dc);
        assert_eq!(Version::XbV3.header_dialect(), HeaderDialect::Dc);
        assert_eq!(Version::PcV2.header_dialect(), HeaderDialect::Pc);
        assert_eq!(Version::Patch.header_dialect(), HeaderDialect::Pc);
        assert_eq!(Version::BbV4.header_dialect(), HeaderDialect::Bb);
    }

    #[test]
    fn v3_grouping() {
        assert!(Version::XbV3.is_v3());
        assert!(Version::GcEp3.is_v3());
        assert!(Version::GcEp3.is_ep3());
        assert!(!Version::XbV3.is_ep3());
        assert!(!Version::DcV2.is_v3());
    }
}
