//! One authenticated connection's session state.
//!
//! A [`Client`] is created at accept and lives until its channel closes.
//! Handlers reach it through `ServerState`; outbound traffic goes through
//! the client's bounded event queue, drained by its connection task, so
//! broadcasts never write to foreign sockets directly.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::sync::mpsc;

use ragol_proto::command::{PayloadReader, ParseError};
use ragol_proto::Version;

use crate::account::Login;
use crate::config::Behavior;

/// Client flag bits carried in [`ClientConfig::enabled_flags`].
///
/// The high byte-range holds server-side bookkeeping that clients must not
/// be able to set; everything else round-trips through the client.
pub mod client_flags {
    pub const LICENSE_WAS_CREATED: u64 = 0x0000_0000_0000_0004; // server-side
    pub const USE_OVERRIDE_RANDOM_SEED: u64 = 0x0000_0000_2000_0000;
    pub const HAS_GUILD_CARD_NUMBER: u64 = 0x0000_0000_4000_0000;
    pub const SWITCH_ASSIST_ENABLED: u64 = 0x0000_0001_0000_0000;
    pub const INFINITE_HP_ENABLED: u64 = 0x0000_0002_0000_0000;
    pub const INFINITE_TP_ENABLED: u64 = 0x0000_0004_0000_0000;
    pub const DEBUG_ENABLED: u64 = 0x0000_0008_0000_0000;
    pub const PROXY_SAVE_FILES: u64 = 0x0000_0010_0000_0000;
    pub const PROXY_CHAT_COMMANDS_ENABLED: u64 = 0x0000_0020_0000_0000;
    pub const PROXY_ZERO_REMOTE_GUILD_CARD: u64 = 0x0000_0040_0000_0000;
    pub const LOADING: u64 = 0x0000_0100_0000_0000; // server-side
    pub const LOADING_QUEST: u64 = 0x0000_0200_0000_0000; // server-side
    pub const AT_WELCOME_MESSAGE: u64 = 0x0000_0400_0000_0000; // server-side

    /// Bits the server trusts when a client echoes its config back.
    pub const CLIENT_SIDE_MASK: u64 =
        !(LICENSE_WAS_CREATED | LOADING | LOADING_QUEST | AT_WELCOME_MESSAGE);

    pub const DEFAULT: u64 = PROXY_CHAT_COMMANDS_ENABLED;
}

/// Sentinel values meaning "no override".
pub const NO_OVERRIDE_SECTION_ID: u8 = 0xFF;
pub const NO_OVERRIDE_LOBBY_EVENT: u8 = 0xFF;
pub const NO_OVERRIDE_LOBBY_NUMBER: u8 = 0x80;

const CONFIG_MAGIC: u32 = 0x444C_4752; // "RGLD" read little-endian

/// Per-client config, serialized into the opaque fields the protocol
/// reserves for the server and echoed back on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub enabled_flags: u64,
    pub specific_version: u32,
    pub override_random_seed: u32,
    /// Network byte order, like the reconnect command.
    pub proxy_destination_address: u32,
    pub proxy_destination_port: u16,
    pub override_section_id: u8,
    pub override_lobby_event: u8,
    pub override_lobby_number: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            enabled_flags: client_flags::DEFAULT,
            specific_version: 0,
            override_random_seed: 0,
            proxy_destination_address: 0,
            proxy_destination_port: 0,
            override_section_id: NO_OVERRIDE_SECTION_ID,
            override_lobby_event: NO_OVERRIDE_LOBBY_EVENT,
            override_lobby_number: NO_OVERRIDE_LOBBY_NUMBER,
        }
    }
}

impl ClientConfig {
    pub const ENCODED_SIZE: usize = 29;

    pub fn check_flag(&self, flag: u64) -> bool {
        (self.enabled_flags & flag) != 0
    }

    pub fn set_flag(&mut self, flag: u64) {
        self.enabled_flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u64) {
        self.enabled_flags &= !flag;
    }

    /// Serialize into a fixed-width wire field, padding with 0xFF. Only
    /// client-side flag bits are written; server-side bits never leave.
    pub fn serialize(&self, width: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(width);
        out.extend_from_slice(&CONFIG_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.specific_version.to_le_bytes());
        out.extend_from_slice(
            &(self.enabled_flags & client_flags::CLIENT_SIDE_MASK).to_le_bytes(),
        );
        out.extend_from_slice(&self.override_random_seed.to_le_bytes());
        out.extend_from_slice(&self.proxy_destination_address.to_be_bytes());
        out.extend_from_slice(&self.proxy_destination_port.to_le_bytes());
        out.push(self.override_section_id);
        out.push(self.override_lobby_event);
        out.push(self.override_lobby_number);
        debug_assert_eq!(out.len(), Self::ENCODED_SIZE);
        out.resize(width.max(Self::ENCODED_SIZE), 0xFF);
        out.truncate(width.max(Self::ENCODED_SIZE));
        out
    }

    /// Parse a config blob echoed by a client. Fails on a bad magic (the
    /// client never sent one of ours back).
    pub fn parse(data: &[u8]) -> Result<ClientConfig, ParseError> {
        let mut r = PayloadReader::new(data);
        let magic = r.get_u32()?;
        if magic != CONFIG_MAGIC {
            return Err(ParseError::Truncated {
                wanted: Self::ENCODED_SIZE,
                offset: 0,
                len: data.len(),
            });
        }
        Ok(ClientConfig {
            specific_version: r.get_u32()?,
            enabled_flags: r.get_u64()?,
            override_random_seed: r.get_u32()?,
            proxy_destination_address: r.get_u32_be()?,
            proxy_destination_port: r.get_u16()?,
            override_section_id: r.get_u8()?,
            override_lobby_event: r.get_u8()?,
            override_lobby_number: r.get_u8()?,
        })
    }

    /// Adopt a client-echoed config, trusting only the client-side mask.
    pub fn merge_from_client(&mut self, echoed: &ClientConfig) {
        let mask = client_flags::CLIENT_SIDE_MASK;
        self.enabled_flags = (echoed.enabled_flags & mask) | (self.enabled_flags & !mask);
        self.specific_version = echoed.specific_version;
        self.override_random_seed = echoed.override_random_seed;
        self.proxy_destination_address = echoed.proxy_destination_address;
        self.proxy_destination_port = echoed.proxy_destination_port;
        self.override_section_id = echoed.override_section_id;
        self.override_lobby_event = echoed.override_lobby_event;
        self.override_lobby_number = echoed.override_lobby_number;
    }
}

/// Outbound events drained by the connection task.
#[derive(Debug)]
pub enum ClientEvent {
    Send {
        command: u16,
        flag: u32,
        payload: Bytes,
    },
    Disconnect,
}

/// Mutable session state behind the client's lock.
#[derive(Debug, Default)]
pub struct ClientState {
    pub login: Option<Login>,
    pub config: ClientConfig,
    pub language: u8,
    pub sub_version: u8,

    pub lobby_id: Option<u32>,
    pub lobby_client_id: u8,
    pub floor: u8,
    pub x: f32,
    pub z: f32,

    pub name: String,
    pub level: u32,
    pub exp: u64,
    pub section_id: u8,
    pub char_class: u8,

    /// Last switch-enabled sub-command payload, kept for switch assist.
    pub last_switch_enabled: Option<Bytes>,
    /// Blue Burst connection phase (data-server step counter).
    pub bb_connection_phase: u8,
}

/// One connected client.
#[derive(Debug)]
pub struct Client {
    pub id: u64,
    pub version: Version,
    pub behavior: Behavior,
    pub remote_addr: SocketAddr,
    tx: mpsc::Sender<ClientEvent>,
    pub state: Mutex<ClientState>,
}

impl Client {
    pub fn new(
        id: u64,
        version: Version,
        behavior: Behavior,
        remote_addr: SocketAddr,
        tx: mpsc::Sender<ClientEvent>,
    ) -> Client {
        Client {
            id,
            version,
            behavior,
            remote_addr,
            tx,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Queue a command for this client. Suspends when the peer is slow
    /// (socket backpressure propagates to the caller).
    pub async fn send(&self, command: u16, flag: u32, payload: Bytes) -> bool {
        self.tx
            .send(ClientEvent::Send {
                command,
                flag,
                payload,
            })
            .await
            .is_ok()
    }

    /// Ask the connection task to close the channel after flushing.
    pub fn request_disconnect(&self) {
        let _ = self.tx.try_send(ClientEvent::Disconnect);
    }

    /// The Guild Card number shown for this client (the account id), or 0
    /// before login.
    pub fn guild_card_number(&self) -> u32 {
        self.state
            .lock()
            .login
            .as_ref()
            .map(|l| l.account.read().account_id)
            .unwrap_or(0)
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().login.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip_with_padding() {
        let mut config = ClientConfig::default();
        config.set_flag(client_flags::SWITCH_ASSIST_ENABLED);
        config.specific_version = 0x3343_4A45;
        config.proxy_destination_address = u32::from_be_bytes([10, 0, 0, 7]);
        config.proxy_destination_port = 9100;
        config.override_section_id = 4;

        let wire = config.serialize(0x20);
        assert_eq!(wire.len(), 0x20);
        assert_eq!(wire[ClientConfig::ENCODED_SIZE], 0xFF);

        let parsed = ClientConfig::parse(&wire).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn server_side_flags_never_serialize() {
        let mut config = ClientConfig::default();
        config.set_flag(client_flags::LOADING);
        config.set_flag(client_flags::DEBUG_ENABLED);
        let parsed = ClientConfig::parse(&config.serialize(0x28)).unwrap();
        assert!(!parsed.check_flag(client_flags::LOADING));
        assert!(parsed.check_flag(client_flags::DEBUG_ENABLED));
    }

    #[test]
    fn merge_preserves_server_side_bits() {
        let mut live = ClientConfig::default();
        live.set_flag(client_flags::LOADING);
        let mut echoed = ClientConfig::default();
        echoed.set_flag(client_flags::INFINITE_HP_ENABLED);
        // A malicious echo tries to clear LOADING and set it via the blob.
        echoed.clear_flag(client_flags::LOADING);
        live.merge_from_client(&echoed);
        assert!(live.check_flag(client_flags::LOADING));
        assert!(live.check_flag(client_flags::INFINITE_HP_ENABLED));
    }

    #[test]
    fn bad_magic_rejected() {
        assert!(ClientConfig::parse(&[0u8; 0x20]).is_err());
        assert!(ClientConfig::parse(&[]).is_err());
    }
}
