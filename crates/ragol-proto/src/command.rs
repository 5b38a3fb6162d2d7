//! Command numbers and payload codecs.
//!
//! Command numbers are grouped by protocol (game, patch) and the nested
//! sub-command space carried by 0x60/0x62/0x6C/0x6D. Payload layouts the
//! server constructs or inspects get explicit structs with `encode`/`parse`
//! pairs; everything else flows through dispatch as raw bytes.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::version::Version;

/// Payload parse errors. Treated like a malformed frame by callers.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload truncated: wanted {wanted} bytes at offset {offset}, have {len}")]
    Truncated {
        wanted: usize,
        offset: usize,
        len: usize,
    },
}

/// Top-level game-protocol command numbers.
pub mod cmd {
    /// Encryption init on data/lobby ports (DC/PC/GC/XB).
    pub const SERVER_INIT: u16 = 0x02;
    /// Encryption init on Blue Burst ports.
    pub const SERVER_INIT_BB: u16 = 0x03;
    /// Encryption init on login ports (DC/PC/GC/XB).
    pub const SERVER_INIT_LOGIN: u16 = 0x17;
    pub const DISCONNECT: u16 = 0x05;
    pub const CHAT: u16 = 0x06;
    pub const MENU: u16 = 0x07;
    pub const GAME_LIST_REQUEST: u16 = 0x08;
    pub const MENU_ITEM_INFO_REQUEST: u16 = 0x09;
    pub const CREATE_GAME_DC_V1: u16 = 0x0C;
    pub const MENU_SELECTION: u16 = 0x10;
    pub const INFO_REPLY: u16 = 0x11;
    pub const WRITE_QUEST_FILE: u16 = 0x13;
    pub const RECONNECT_PATCH: u16 = 0x14;
    pub const RECONNECT: u16 = 0x19;
    pub const MESSAGE_BOX: u16 = 0x1A;
    pub const PING: u16 = 0x1D;
    pub const INFORMATION_MENU_REQUEST: u16 = 0x1F;
    pub const GUILD_CARD_SEARCH: u16 = 0x40;
    pub const GUILD_CARD_SEARCH_REPLY: u16 = 0x41;
    pub const OPEN_QUEST_FILE: u16 = 0x44;
    pub const GAME_COMMAND: u16 = 0x60;
    pub const PLAYER_DATA: u16 = 0x61;
    pub const GAME_COMMAND_PRIVATE: u16 = 0x62;
    pub const JOIN_GAME: u16 = 0x64;
    pub const ADD_GAME_PLAYER: u16 = 0x65;
    pub const REMOVE_GAME_PLAYER: u16 = 0x66;
    pub const JOIN_LOBBY: u16 = 0x67;
    pub const ADD_LOBBY_PLAYER: u16 = 0x68;
    pub const REMOVE_LOBBY_PLAYER: u16 = 0x69;
    pub const GAME_COMMAND_BIG: u16 = 0x6C;
    pub const GAME_COMMAND_PRIVATE_BIG: u16 = 0x6D;
    pub const SIMPLE_MAIL: u16 = 0x81;
    pub const LOBBY_INFO: u16 = 0x83;
    pub const CHANGE_LOBBY: u16 = 0x84;
    pub const REQUEST_LOBBY_NAME: u16 = 0x8A;
    pub const LOGIN_DC_V1: u16 = 0x90;
    pub const LOGIN_DC_ACK: u16 = 0x92;
    /// DC NTE/v1 full login; also the Blue Burst login command.
    pub const LOGIN_93: u16 = 0x93;
    pub const PLAYER_DATA_LEAVE: u16 = 0x98;
    pub const VERIFY_LICENSE_V2: u16 = 0x9A;
    pub const REGISTER_V2: u16 = 0x9C;
    pub const LOGIN_V2: u16 = 0x9D;
    pub const LOGIN_V3: u16 = 0x9E;
    pub const CHANGE_SHIP: u16 = 0xA0;
    pub const CHANGE_BLOCK: u16 = 0xA1;
    pub const QUEST_LIST_REQUEST: u16 = 0xA2;
    pub const QUEST_FILE_OPEN: u16 = 0xA6;
    pub const QUEST_FILE_CHUNK: u16 = 0xA7;
    pub const QUEST_BARRIER: u16 = 0xAC;
    pub const CREATE_GAME: u16 = 0xC1;
    pub const EP3_SERVER_DATA: u16 = 0xCA;
    pub const MESSAGE_BOX_BIG: u16 = 0xD5;
    pub const INFO_BOARD_REQUEST: u16 = 0xD8;
    pub const INFO_BOARD_WRITE: u16 = 0xD9;
    pub const VERIFY_LICENSE_GC: u16 = 0xDB;
    pub const BB_GUILD_CARD_HEADER: u16 = 0xDC;
    pub const BB_OPTION_REQUEST: u16 = 0xE0;
    pub const BB_OPTION_CONFIG: u16 = 0xE2;
    pub const BB_CHAR_SELECT: u16 = 0xE3;
    pub const BB_CHAR_SELECT_ACK: u16 = 0xE4;
    pub const BB_CHAR_PREVIEW: u16 = 0xE5;
    pub const BB_SECURITY: u16 = 0xE6;
    pub const BB_FULL_CHARACTER: u16 = 0xE7;
    pub const BB_CHECKSUM: u16 = 0xE8;
    pub const BB_STREAM_FILE_INDEX: u16 = 0xEB;
    pub const CREATE_GAME_BB: u16 = 0xEC;
}

/// Patch-protocol command numbers (spoken only on patch ports).
pub mod patch_cmd {
    pub const START_ENCRYPTION: u16 = 0x02;
    pub const LOGIN: u16 = 0x04;
    pub const MESSAGE: u16 = 0x05;
    pub const OPEN_FILE: u16 = 0x06;
    pub const WRITE_FILE: u16 = 0x07;
    pub const CLOSE_FILE: u16 = 0x08;
    pub const ENTER_DIRECTORY: u16 = 0x09;
    pub const EXIT_DIRECTORY: u16 = 0x0A;
    pub const START_FILE_CHECKSUMS: u16 = 0x0B;
    pub const FILE_CHECKSUM_REQUEST: u16 = 0x0C;
    pub const END_FILE_CHECKSUMS: u16 = 0x0D;
    /// Client reply to a checksum request.
    pub const FILE_INFORMATION: u16 = 0x0F;
    /// Client signal that all checksum replies were sent.
    pub const FILE_INFORMATION_DONE: u16 = 0x10;
    pub const START_FILE_DOWNLOADS: u16 = 0x11;
    pub const END_OF_UPDATE: u16 = 0x12;
    pub const RECONNECT: u16 = 0x14;
}

/// Sub-command numbers inside 0x60/0x62/0x6C/0x6D.
pub mod subcmd {
    pub const SWITCH_TOGGLE: u8 = 0x05;
    pub const HIT_ENEMY: u8 = 0x0A;
    pub const CHANGE_FLOOR_1: u8 = 0x1F;
    pub const CHANGE_FLOOR_2: u8 = 0x20;
    pub const CHANGE_FLOOR_3: u8 = 0x21;
    pub const STOP_MOVING: u8 = 0x3E;
    pub const SET_POSITION: u8 = 0x3F;
    pub const WALK: u8 = 0x40;
    pub const RUN: u8 = 0x42;
    pub const ATTACK_START: u8 = 0x46;
    pub const ATTACK_FINISH: u8 = 0x47;
    pub const CAST_TECHNIQUE: u8 = 0x48;
    pub const PICK_UP_ITEM: u8 = 0x59;
    pub const PICK_UP_ITEM_REQUEST: u8 = 0x5A;
    pub const DROP_STACK: u8 = 0x5D;
    /// Server-to-clients floor item creation.
    pub const CREATE_FLOOR_ITEM: u8 = 0x5F;
    pub const ENEMY_DROP_ITEM_REQUEST: u8 = 0x60;
    pub const DESTROY_FLOOR_ITEM: u8 = 0x63;
    pub const WARP: u8 = 0x94;
    pub const BOX_DROP_ITEM_REQUEST: u8 = 0xA2;
    /// Episode III battle traffic, carrying its own sub-sub opcode.
    pub const EP3_BATTLE: u8 = 0xB6;
    pub const GIVE_EXPERIENCE: u8 = 0xBF;
    pub const ENEMY_KILLED: u8 = 0xC8;
}

/// Episode III battle sub-sub opcodes inside 0xB6.
pub mod ep3_op {
    pub const MAP_DEFINITION: u8 = 0x41;
    pub const SET_RULES: u8 = 0x42;
    pub const REGISTER_DECK: u8 = 0x43;
    pub const READY: u8 = 0x44;
    pub const ROLL_DICE: u8 = 0x45;
    pub const ADVANCE_PHASE: u8 = 0x46;
    pub const BATTLE_RESULT: u8 = 0x47;
}

// ---------------------------------------------------------------------------
// Reader/writer helpers
// ---------------------------------------------------------------------------

/// Bounds-checked little-endian reader over a payload slice.
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PayloadReader { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::Truncated {
                wanted: n,
                offset: self.pos,
                len: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u32_be(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, ParseError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_f32(&mut self) -> Result<f32, ParseError> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        self.take(n)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        self.take(n).map(|_| ())
    }

    /// Fixed-width zero-padded ASCII field.
    pub fn get_ascii(&mut self, width: usize) -> Result<String, ParseError> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
        Ok(raw[..end].iter().map(|&b| b as char).collect())
    }
}

/// Append a fixed-width zero-padded ASCII field (truncating oversize input).
pub fn put_ascii(out: &mut BytesMut, text: &str, width: usize) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(width);
    out.put_slice(&bytes[..n]);
    out.put_bytes(0, width - n);
}

/// Whether a version speaks UTF-16LE text (PC and Blue Burst) rather than
/// the 8-bit console encodings.
pub const fn text_is_wide(version: Version) -> bool {
    matches!(version, Version::PcNte | Version::PcV2 | Version::BbV4)
}

/// Encode user-visible text for a version, NUL-terminated.
pub fn encode_text(version: Version, text: &str) -> Vec<u8> {
    if text_is_wide(version) {
        let mut out = Vec::with_capacity(text.len() * 2 + 2);
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&[0, 0]);
        out
    } else {
        let mut out: Vec<u8> = text.chars().map(|c| if c.is_ascii() { c as u8 } else { b'?' }).collect();
        out.push(0);
        out
    }
}

/// Decode user-visible text from a version's encoding, stopping at NUL.
pub fn decode_text(version: Version, data: &[u8]) -> String {
    if text_is_wide(version) {
        let units: Vec<u16> = data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        data.iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Handshake and session payloads
// ---------------------------------------------------------------------------

pub const GAME_SERVER_COPYRIGHT: &str =
    "DreamCast Lobby Server. Copyright SEGA Enterprises. 1999";
pub const PATCH_SERVER_COPYRIGHT: &str = "Patch Server. Copyright SonicTeam, LTD. 2001";
pub const BB_SERVER_COPYRIGHT: &str =
    "Phantasy Star Online Blue Burst Game Server. Copyright 1999-2004 SONICTEAM.";

/// Encryption init for DC/PC/GC/XB and the patch protocol (commands
/// 0x02/0x17): a 0x40-byte copyright banner and the two 32-bit keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub copyright: String,
    pub server_key: u32,
    pub client_key: u32,
}

impl ServerInit {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(0x48);
        put_ascii(&mut out, &self.copyright, 0x40);
        out.put_u32_le(self.server_key);
        out.put_u32_le(self.client_key);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        Ok(ServerInit {
            copyright: r.get_ascii(0x40)?,
            server_key: r.get_u32()?,
            client_key: r.get_u32()?,
        })
    }
}

/// Encryption init for Blue Burst (command 0x03): 48-byte key halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInitBb {
    pub copyright: String,
    pub server_key: [u8; 48],
    pub client_key: [u8; 48],
}

impl ServerInitBb {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(0x60 + 96);
        put_ascii(&mut out, &self.copyright, 0x60);
        out.put_slice(&self.server_key);
        out.put_slice(&self.client_key);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let copyright = r.get_ascii(0x60)?;
        let mut server_key = [0u8; 48];
        server_key.copy_from_slice(r.get_bytes(48)?);
        let mut client_key = [0u8; 48];
        client_key.copy_from_slice(r.get_bytes(48)?);
        Ok(ServerInitBb {
            copyright,
            server_key,
            client_key,
        })
    }
}

/// DC v2 / PC login (command 0x9D).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginV2 {
    pub player_tag: u32,
    pub guild_card_number: u32,
    pub sub_version: u8,
    pub language: u8,
    pub serial_number: String,
    pub access_key: String,
    pub character_name: String,
}

impl LoginV2 {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(0x3C);
        out.put_u32_le(self.player_tag);
        out.put_u32_le(self.guild_card_number);
        out.put_u8(self.sub_version);
        out.put_u8(self.language);
        out.put_u16_le(0);
        put_ascii(&mut out, &self.serial_number, 0x10);
        put_ascii(&mut out, &self.access_key, 0x10);
        put_ascii(&mut out, &self.character_name, 0x10);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let player_tag = r.get_u32()?;
        let guild_card_number = r.get_u32()?;
        let sub_version = r.get_u8()?;
        let language = r.get_u8()?;
        r.skip(2)?;
        Ok(LoginV2 {
            player_tag,
            guild_card_number,
            sub_version,
            language,
            serial_number: r.get_ascii(0x10)?,
            access_key: r.get_ascii(0x10)?,
            character_name: r.get_ascii(0x10)?,
        })
    }
}

/// GC / Xbox login (command 0x9E): v2 fields plus the echoed client config.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginV3 {
    pub base: LoginV2,
    pub client_config: [u8; 0x20],
}

impl LoginV3 {
    pub fn encode(&self) -> BytesMut {
        let mut out = self.base.encode();
        out.put_slice(&self.client_config);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let base = LoginV2::parse(payload)?;
        let mut r = PayloadReader::new(payload);
        r.skip(0x3C)?;
        let mut client_config = [0u8; 0x20];
        // Older sub-versions send a short or absent config; tolerate that.
        let available = r.remaining().min(0x20);
        client_config[..available].copy_from_slice(r.get_bytes(available)?);
        Ok(LoginV3 {
            base,
            client_config,
        })
    }
}

/// GC license verification (command 0xDB).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifyLicenseGc {
    pub serial_number: String,
    pub access_key: String,
    pub password: String,
    pub sub_version: u8,
    pub language: u8,
}

impl VerifyLicenseGc {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(0x34);
        put_ascii(&mut out, &self.serial_number, 0x10);
        put_ascii(&mut out, &self.access_key, 0x10);
        put_ascii(&mut out, &self.password, 0x10);
        out.put_u8(self.sub_version);
        out.put_u8(self.language);
        out.put_u16_le(0);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        Ok(VerifyLicenseGc {
            serial_number: r.get_ascii(0x10)?,
            access_key: r.get_ascii(0x10)?,
            password: r.get_ascii(0x10)?,
            sub_version: r.get_u8()?,
            language: r.get_u8()?,
        })
    }
}

/// Xbox login extension carried in 0x9E by XB clients: the Xbox Live
/// identity tuple, appended after the config echo.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XbLiveIdentity {
    pub gamertag: String,
    pub user_id: u64,
    pub account_id: u64,
}

impl XbLiveIdentity {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(0x20);
        put_ascii(&mut out, &self.gamertag, 0x10);
        out.put_u64_le(self.user_id);
        out.put_u64_le(self.account_id);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        Ok(XbLiveIdentity {
            gamertag: r.get_ascii(0x10)?,
            user_id: r.get_u64()?,
            account_id: r.get_u64()?,
        })
    }
}

/// Blue Burst login (command 0x93).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginBb {
    pub player_tag: u32,
    pub guild_card_number: u32,
    pub sub_version: u8,
    pub language: u8,
    pub username: String,
    pub password: String,
    pub client_config: [u8; 0x28],
}

impl Default for LoginBb {
    fn default() -> Self {
        LoginBb {
            player_tag: 0,
            guild_card_number: 0,
            sub_version: 0,
            language: 0,
            username: String::new(),
            password: String::new(),
            client_config: [0; 0x28],
        }
    }
}

impl LoginBb {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(0x54);
        out.put_u32_le(self.player_tag);
        out.put_u32_le(self.guild_card_number);
        out.put_u8(self.sub_version);
        out.put_u8(self.language);
        out.put_u16_le(0);
        put_ascii(&mut out, &self.username, 0x10);
        put_ascii(&mut out, &self.password, 0x10);
        out.put_slice(&self.client_config);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let player_tag = r.get_u32()?;
        let guild_card_number = r.get_u32()?;
        let sub_version = r.get_u8()?;
        let language = r.get_u8()?;
        r.skip(2)?;
        let username = r.get_ascii(0x10)?;
        let password = r.get_ascii(0x10)?;
        let mut client_config = [0u8; 0x28];
        let available = r.remaining().min(0x28);
        client_config[..available].copy_from_slice(r.get_bytes(available)?);
        Ok(LoginBb {
            player_tag,
            guild_card_number,
            sub_version,
            language,
            username,
            password,
            client_config,
        })
    }
}

/// Reconnect (command 0x19, or 0x14 in the patch/early-PC flow): the
/// address is in network byte order, the port little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconnect {
    pub address: std::net::Ipv4Addr,
    pub port: u16,
}

impl Reconnect {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(8);
        out.put_slice(&self.address.octets());
        out.put_u16_le(self.port);
        out.put_u16_le(0);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let octets = r.get_bytes(4)?;
        let address = std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        let port = r.get_u16()?;
        Ok(Reconnect { address, port })
    }
}

// ---------------------------------------------------------------------------
// Menus
// ---------------------------------------------------------------------------

/// One entry in a 0x07 menu command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub menu_id: u32,
    pub item_id: u32,
    pub flags: u16,
    pub text: String,
}

/// Encode a 0x07 menu. Entry text is a fixed 0x22-byte field in the
/// version's encoding; the command flag carries `entries.len() - 1`.
pub fn encode_menu(version: Version, entries: &[MenuEntry]) -> BytesMut {
    let mut out = BytesMut::with_capacity(entries.len() * 0x2C);
    for entry in entries {
        out.put_u32_le(entry.menu_id);
        out.put_u32_le(entry.item_id);
        out.put_u16_le(entry.flags);
        let text = encode_text(version, &entry.text);
        let n = text.len().min(0x22);
        out.put_slice(&text[..n]);
        out.put_bytes(0, 0x22 - n);
    }
    out
}

/// Client menu selection (command 0x10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuSelection {
    pub menu_id: u32,
    pub item_id: u32,
    /// Trailing bytes: a password for locked games, if present.
    pub password: Vec<u8>,
}

impl MenuSelection {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(8 + self.password.len());
        out.put_u32_le(self.menu_id);
        out.put_u32_le(self.item_id);
        out.put_slice(&self.password);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let menu_id = r.get_u32()?;
        let item_id = r.get_u32()?;
        let password = r.get_bytes(r.remaining())?.to_vec();
        Ok(MenuSelection {
            menu_id,
            item_id,
            password,
        })
    }
}

/// Create-game request (0xC1, DC v1's 0x0C, and Blue Burst's 0xEC).
/// The trailing solo byte only exists on versions with one-person mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateGame {
    pub name: String,
    pub password: String,
    pub difficulty: u8,
    pub battle: bool,
    pub challenge: bool,
    pub episode: u8,
    pub solo: bool,
}

impl CreateGame {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(0x28);
        put_ascii(&mut out, &self.name, 0x10);
        put_ascii(&mut out, &self.password, 0x10);
        out.put_u8(self.difficulty);
        out.put_u8(self.battle as u8);
        out.put_u8(self.challenge as u8);
        out.put_u8(self.episode);
        out.put_u8(self.solo as u8);
        out.put_bytes(0, 3);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let name = r.get_ascii(0x10)?;
        let password = r.get_ascii(0x10)?;
        let difficulty = r.get_u8()?;
        let battle = r.get_u8()? != 0;
        let challenge = r.get_u8()? != 0;
        let episode = r.get_u8()?;
        let solo = r.get_u8().map(|b| b != 0).unwrap_or(false);
        Ok(CreateGame {
            name,
            password,
            difficulty,
            battle,
            challenge,
            episode,
            solo,
        })
    }
}

// ---------------------------------------------------------------------------
// Lobby/game rosters
// ---------------------------------------------------------------------------

/// Header preceding the roster in 0x64/0x67 join commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinHeader {
    pub client_id: u8,
    pub leader_id: u8,
    pub lobby_number: u8,
    pub block_number: u8,
    pub event: u16,
    pub section_id: u8,
    pub episode: u8,
    pub difficulty: u8,
    pub mode: u8,
    pub random_seed: u32,
}

impl JoinHeader {
    pub const SIZE: usize = 0x10;

    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(Self::SIZE);
        out.put_u8(self.client_id);
        out.put_u8(self.leader_id);
        out.put_u8(self.lobby_number);
        out.put_u8(self.block_number);
        out.put_u16_le(self.event);
        out.put_u8(self.section_id);
        out.put_u8(self.episode);
        out.put_u8(self.difficulty);
        out.put_u8(self.mode);
        out.put_u16_le(0);
        out.put_u32_le(self.random_seed);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let client_id = r.get_u8()?;
        let leader_id = r.get_u8()?;
        let lobby_number = r.get_u8()?;
        let block_number = r.get_u8()?;
        let event = r.get_u16()?;
        let section_id = r.get_u8()?;
        let episode = r.get_u8()?;
        let difficulty = r.get_u8()?;
        let mode = r.get_u8()?;
        r.skip(2)?;
        let random_seed = r.get_u32()?;
        Ok(JoinHeader {
            client_id,
            leader_id,
            lobby_number,
            block_number,
            event,
            section_id,
            episode,
            difficulty,
            mode,
            random_seed,
        })
    }
}

/// One roster slot in join/add-player commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayerEntry {
    pub player_tag: u32,
    pub guild_card_number: u32,
    pub client_id: u8,
    pub language: u8,
    pub section_id: u8,
    pub char_class: u8,
    pub level: u32,
    pub name: String,
}

impl PlayerEntry {
    pub const SIZE: usize = 0x20;

    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(Self::SIZE);
        out.put_u32_le(self.player_tag);
        out.put_u32_le(self.guild_card_number);
        out.put_u8(self.client_id);
        out.put_u8(self.language);
        out.put_u8(self.section_id);
        out.put_u8(self.char_class);
        out.put_u32_le(self.level);
        put_ascii(&mut out, &self.name, 0x10);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        Ok(PlayerEntry {
            player_tag: r.get_u32()?,
            guild_card_number: r.get_u32()?,
            client_id: r.get_u8()?,
            language: r.get_u8()?,
            section_id: r.get_u8()?,
            char_class: r.get_u8()?,
            level: r.get_u32()?,
            name: r.get_ascii(0x10)?,
        })
    }
}

/// 0x66/0x69 player-left notification. The flag carries the leaving slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerLeave {
    pub client_id: u8,
    pub leader_id: u8,
}

impl PlayerLeave {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(4);
        out.put_u8(self.client_id);
        out.put_u8(self.leader_id);
        out.put_u16_le(0);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        Ok(PlayerLeave {
            client_id: r.get_u8()?,
            leader_id: r.get_u8()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Sub-command framing
// ---------------------------------------------------------------------------

/// The 4-byte header on every game sub-command: opcode, size in 4-byte
/// units (0 for over-length commands carried by 0x6C/0x6D), and a
/// per-opcode parameter that is usually a client or entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubcommandHeader {
    pub subcommand: u8,
    pub size_units: u8,
    pub param: u16,
}

impl SubcommandHeader {
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(4);
        out.put_u8(self.subcommand);
        out.put_u8(self.size_units);
        out.put_u16_le(self.param);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        Ok(SubcommandHeader {
            subcommand: r.get_u8()?,
            size_units: r.get_u8()?,
            param: r.get_u16()?,
        })
    }
}
