//! The unified account system.
//!
//! One logical account binds credentials from up to six platform
//! ecosystems, so a player keeps one Guild Card number across a Dreamcast
//! serial, a GameCube serial, an Xbox gamertag, and a Blue Burst username.
//! Accounts persist as one JSON document each under the configured license
//! directory; see [`store`] for the on-disk format and [`index`] for the
//! concurrent lookup structure.

pub mod index;
pub mod store;

pub use index::{AccountIndex, SharedAccount};

use std::collections::{HashMap, HashSet};

use ragol_proto::fnv1a32;

/// Named permission bits in `Account::flags`.
pub mod flags {
    pub const KICK_USER: u32 = 0x0000_0001;
    pub const BAN_USER: u32 = 0x0000_0002;
    pub const SILENCE_USER: u32 = 0x0000_0004;
    pub const CHANGE_EVENT: u32 = 0x0000_0010;
    pub const ANNOUNCE: u32 = 0x0000_0020;
    pub const FREE_JOIN_GAMES: u32 = 0x0000_0040;
    pub const DEBUG: u32 = 0x0100_0000;
    pub const CHEAT_ANYWHERE: u32 = 0x0200_0000;
    pub const DISABLE_QUEST_REQUIREMENTS: u32 = 0x0400_0000;
    pub const ALWAYS_ENABLE_CHAT_COMMANDS: u32 = 0x0800_0000;
    pub const IS_SHARED_ACCOUNT: u32 = 0x8000_0000;

    // Composite presets.
    pub const MODERATOR: u32 = KICK_USER | BAN_USER | SILENCE_USER;
    pub const ADMINISTRATOR: u32 = 0x0000_00FF;
    pub const ROOT: u32 = 0x7FFF_FFFF;
}

/// Named bits in `Account::user_flags` (player-controlled toggles).
pub mod user_flags {
    pub const DISABLE_DROP_NOTIFICATION_BROADCAST: u32 = 0x0000_0001;
}

/// Dreamcast Network Trial Edition credentials. The trial builds used
/// free-form serial strings rather than the production 32-bit serials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcNteLicense {
    pub serial_number: String,
    pub access_key: String,
}

impl DcNteLicense {
    pub fn validate(&self) -> Result<(), String> {
        if self.serial_number.is_empty() || self.serial_number.len() > 16 {
            return Err("serial number must be 1-16 characters".into());
        }
        if self.access_key.is_empty() || self.access_key.len() > 16 {
            return Err("access key must be 1-16 characters".into());
        }
        Ok(())
    }

    pub fn proxy_session_id_part(&self) -> u64 {
        fnv1a32(self.serial_number.as_bytes()) as u64
    }
}

/// Dreamcast v1/v2 and PC credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1V2License {
    pub serial_number: u32,
    pub access_key: String,
}

impl V1V2License {
    pub fn validate(&self) -> Result<(), String> {
        if self.serial_number == 0 {
            return Err("serial number is zero".into());
        }
        if self.access_key.len() != 8 {
            return Err("access key length is incorrect".into());
        }
        Ok(())
    }

    pub fn proxy_session_id_part(&self) -> u64 {
        self.serial_number as u64
    }
}

/// GameCube credentials: serial, 12-character access key, and a password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcLicense {
    pub serial_number: u32,
    pub access_key: String,
    pub password: String,
}

impl GcLicense {
    pub fn validate(&self) -> Result<(), String> {
        if self.serial_number == 0 {
            return Err("serial number is zero".into());
        }
        if self.access_key.len() != 12 {
            return Err("access key length is incorrect".into());
        }
        if self.password.is_empty() {
            return Err("password is too short".into());
        }
        Ok(())
    }

    pub fn proxy_session_id_part(&self) -> u64 {
        self.serial_number as u64
    }
}

/// Xbox Live identity tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XbLicense {
    pub gamertag: String,
    pub user_id: u64,
    pub account_id: u64,
}

impl XbLicense {
    pub fn validate(&self) -> Result<(), String> {
        if self.gamertag.is_empty() {
            return Err("gamertag is too short".into());
        }
        if self.user_id == 0 {
            return Err("user ID is zero".into());
        }
        if self.account_id == 0 {
            return Err("account ID is zero".into());
        }
        Ok(())
    }

    pub fn proxy_session_id_part(&self) -> u64 {
        fnv1a32(self.gamertag.as_bytes()) as u64
    }
}

/// Blue Burst credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BbLicense {
    pub username: String,
    pub password: String,
}

impl BbLicense {
    pub fn validate(&self) -> Result<(), String> {
        if self.username.is_empty() || self.username.len() > 16 {
            return Err("username must be 1-16 characters".into());
        }
        if self.password.is_empty() || self.password.len() > 16 {
            return Err("password must be 1-16 characters".into());
        }
        Ok(())
    }

    pub fn proxy_session_id_part(&self) -> u64 {
        fnv1a32(self.username.as_bytes()) as u64
    }
}

/// One logical account. `account_id` doubles as the in-game Guild Card
/// number.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub account_id: u32,
    pub flags: u32,
    pub user_flags: u32,
    /// Seconds since the epoch; 0 = not banned.
    pub ban_end_time: u64,
    pub last_player_name: String,
    pub auto_reply_message: String,
    pub ep3_current_meseta: u32,
    pub ep3_total_meseta_earned: u32,
    /// Blue Burst team; 0 = none.
    pub bb_team_id: u32,
    /// Temporary accounts are never written to disk.
    pub is_temporary: bool,
    pub auto_patches_enabled: HashSet<String>,

    pub dc_nte_licenses: HashMap<String, DcNteLicense>,
    pub dc_licenses: HashMap<u32, V1V2License>,
    pub pc_licenses: HashMap<u32, V1V2License>,
    pub gc_licenses: HashMap<u32, GcLicense>,
    pub xb_licenses: HashMap<u64, XbLicense>,
    pub bb_licenses: HashMap<String, BbLicense>,
}

impl Account {
    pub fn check_flag(&self, flag: u32) -> bool {
        (self.flags & flag) != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn toggle_flag(&mut self, flag: u32) {
        self.flags ^= flag;
    }

    pub fn check_user_flag(&self, flag: u32) -> bool {
        (self.user_flags & flag) != 0
    }

    pub fn is_shared(&self) -> bool {
        self.check_flag(flags::IS_SHARED_ACCOUNT)
    }

    pub fn is_banned(&self, now: u64) -> bool {
        self.ban_end_time != 0 && self.ban_end_time > now
    }
}

/// Which credential authenticated a login. Exactly one variant applies per
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    DcNte(DcNteLicense),
    Dc(V1V2License),
    Pc(V1V2License),
    Gc(GcLicense),
    Xb(XbLicense),
    Bb(BbLicense),
}

impl Credential {
    fn proxy_session_id_part(&self) -> u64 {
        match self {
            Credential::DcNte(l) => l.proxy_session_id_part(),
            Credential::Dc(l) | Credential::Pc(l) => l.proxy_session_id_part(),
            Credential::Gc(l) => l.proxy_session_id_part(),
            Credential::Xb(l) => l.proxy_session_id_part(),
            Credential::Bb(l) => l.proxy_session_id_part(),
        }
    }
}

/// The product of a successful credential lookup.
#[derive(Debug, Clone)]
pub struct Login {
    pub account_was_created: bool,
    pub account: SharedAccount,
    pub credential: Credential,
}

impl Login {
    /// A stable 64-bit id associating proxy reconnects with prior sessions:
    /// the account id in the high half, a credential-derived value in the
    /// low half.
    pub fn proxy_session_id(&self) -> u64 {
        let account_id = self.account.read().account_id as u64;
        (account_id << 32) | (self.credential.proxy_session_id_part() & 0xFFFF_FFFF)
    }
}

/// Derive the temporary account id minted for a character on a shared
/// account: the variation string folded over the hash of the source id's
/// raw little-endian bytes.
pub fn derived_shared_account_id(src_account_id: u32, variation_data: &str) -> u32 {
    let basis = fnv1a32(&src_account_id.to_le_bytes());
    ragol_proto::fnv1a32_with(variation_data.as_bytes(), basis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_presets() {
        assert_eq!(flags::MODERATOR, 0x07);
        let mut account = Account {
            flags: flags::MODERATOR,
            ..Default::default()
        };
        assert!(account.check_flag(flags::KICK_USER));
        assert!(!account.check_flag(flags::ANNOUNCE));
        account.toggle_flag(flags::ANNOUNCE);
        assert!(account.check_flag(flags::ANNOUNCE));
        account.clear_flag(flags::ANNOUNCE);
        assert!(!account.check_flag(flags::ANNOUNCE));
    }

    #[test]
    fn ban_expiry() {
        let account = Account {
            ban_end_time: 1000,
            ..Default::default()
        };
        assert!(account.is_banned(999));
        assert!(!account.is_banned(1000));
        assert!(!Account::default().is_banned(0));
    }

    #[test]
    fn license_validation() {
        assert!(V1V2License {
            serial_number: 1,
            access_key: "12345678".into()
        }
        .validate()
        .is_ok());
        assert!(V1V2License {
            serial_number: 0,
            access_key: "12345678".into()
        }
        .validate()
        .is_err());
        assert!(GcLicense {
            serial_number: 5,
            access_key: "123456789012".into(),
            password: "pw".into()
        }
        .validate()
        .is_ok());
        assert!(GcLicense {
            serial_number: 5,
            access_key: "short".into(),
            password: "pw".into()
        }
        .validate()
        .is_err());
        assert!(BbLicense {
            username: "a".repeat(17),
            password: "x".into()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn shared_derivation_is_stable_and_distinct() {
        let a1 = derived_shared_account_id(0x0200_0002, "KEY12345:Alice");
        let a2 = derived_shared_account_id(0x0200_0002, "KEY12345:Alice");
        let b = derived_shared_account_id(0x0200_0002, "KEY12345:Bob");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        // A different source account shifts every derived id.
        assert_ne!(a1, derived_shared_account_id(0x0200_0003, "KEY12345:Alice"));
    }
}
