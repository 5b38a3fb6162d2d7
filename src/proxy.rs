//! The intercepting proxy.
//!
//! An alternative to the lobby server: the client's channel is paired with
//! a second channel toward a remote official server, and commands relay in
//! both directions through per-command rewrite hooks. The proxy presents a
//! consistent Guild Card number to the remote server across sessions,
//! patches reconnect commands so the client always comes back through the
//! proxy, shadows lobby rosters, optionally regenerates drops locally, and
//! optionally saves files the remote server transmits.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use ragol_proto::command::{
    cmd, subcmd, JoinHeader, LoginBb, LoginV3, PayloadReader, Reconnect, ServerInit, ServerInitBb,
    SubcommandHeader,
};
use ragol_proto::crypt::{BbCipher, BbKeyMaterial, BbPrivateKey, Cipher, DcCipher, GcCipher, PcCipher};
use ragol_proto::{Frame, Transport, Version};

use crate::state::client::ClientConfig;
use crate::state::items::ItemCreator;
use crate::state::lobby::{DropMode, GameMode};
use crate::state::ServerState;

/// A remote player observed in roster traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedPlayer {
    pub guild_card_number: u32,
    pub client_id: u8,
    pub language: u8,
    pub section_id: u8,
    pub char_class: u8,
    pub name: String,
}

/// One proxied client session.
pub struct ProxySession {
    state: Arc<ServerState>,
    client: Transport,
    version: Version,
    local_port: u16,
    client_addr: SocketAddr,
    /// Private key table for remote BB hops.
    bb_private_key: Option<Arc<BbPrivateKey>>,

    config: ClientConfig,
    /// The Guild Card number we present to the client, learned at login.
    local_guild_card: u32,
    /// The Guild Card number the remote server assigned.
    remote_guild_card: Option<u32>,
    session_id: u64,
    lobby_players: Vec<ObservedPlayer>,
    drop_mode: DropMode,
    item_creator: Option<ItemCreator>,
    /// Frames generated locally (intercepted drops) awaiting delivery.
    pending_to_client: Vec<Frame>,
    next_intercept_item_id: u32,
}

impl ProxySession {
    pub fn new(
        state: Arc<ServerState>,
        client: Transport,
        version: Version,
        local_port: u16,
        client_addr: SocketAddr,
        bb_private_key: Option<Arc<BbPrivateKey>>,
    ) -> ProxySession {
        // Interception is opted into through the configured drop mode.
        let drop_mode = {
            let config = state.config_snapshot();
            match config.game.drop_modes.default_for(version, GameMode::Normal) {
                DropMode::Intercept => DropMode::Intercept,
                _ => DropMode::Client,
            }
        };
        ProxySession {
            state,
            client,
            version,
            local_port,
            client_addr,
            bb_private_key,
            config: ClientConfig::default(),
            local_guild_card: 0,
            remote_guild_card: None,
            session_id: 0,
            lobby_players: Vec::new(),
            drop_mode,
            item_creator: None,
            pending_to_client: Vec::new(),
            next_intercept_item_id: 0x0081_0000,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        // The client re-sends its login after our handshake; that tells us
        // who it is and where it wants to go.
        let login_frame = loop {
            match self.client.recv().await? {
                Some(frame)
                    if matches!(
                        frame.command,
                        cmd::LOGIN_93 | cmd::LOGIN_V2 | cmd::LOGIN_V3 | cmd::VERIFY_LICENSE_GC
                    ) =>
                {
                    break frame
                }
                Some(frame) => {
                    debug!(command = format_args!("{:#04x}", frame.command), "Pre-login frame");
                }
                None => return Ok(()),
            }
        };
        self.learn_identity(&login_frame)?;

        let destination = self.destination()?;
        info!(%destination, "Proxy connecting upstream");
        let remote_stream = TcpStream::connect(destination).await?;
        let mut remote = Transport::tcp(remote_stream, self.version);

        // The remote server's init keys our upstream ciphers; we are the
        // client on that side, so the key roles mirror.
        let Some(init) = remote.recv().await? else {
            anyhow::bail!("remote server closed before handshake");
        };
        match self.version {
            Version::BbV4 => {
                let parsed = ServerInitBb::parse(&init.payload)
                    .map_err(|e| anyhow::anyhow!("bad remote init: {e}"))?;
                let key = self
                    .bb_private_key
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("BB proxy without a private key"))?;
                remote.set_ciphers(
                    Cipher::Bb(Box::new(BbCipher::new(
                        &BbKeyMaterial(parsed.server_key),
                        key,
                    ))),
                    Cipher::Bb(Box::new(BbCipher::new(
                        &BbKeyMaterial(parsed.client_key),
                        key,
                    ))),
                );
            }
            version => {
                let parsed = ServerInit::parse(&init.payload)
                    .map_err(|e| anyhow::anyhow!("bad remote init: {e}"))?;
                let make = |key: u32| {
                    if version.is_v3() {
                        Cipher::Gc(GcCipher::new(key))
                    } else if version.is_pc() || version == Version::Patch {
                        Cipher::Pc(PcCipher::new(key))
                    } else {
                        Cipher::Dc(DcCipher::new(key))
                    }
                };
                remote.set_ciphers(make(parsed.server_key), make(parsed.client_key));
            }
        }

        // Forward the stashed login upstream, then relay.
        let outbound = self.rewrite_client_to_server(&login_frame);
        if let Some(frame) = outbound {
            remote.send(frame.command, frame.flag, &frame.payload).await?;
        }

        loop {
            tokio::select! {
                from_client = self.client.recv() => {
                    match from_client? {
                        Some(frame) => {
                            if let Some(frame) = self.rewrite_client_to_server(&frame) {
                                remote.send(frame.command, frame.flag, &frame.payload).await?;
                            }
                            for pending in std::mem::take(&mut self.pending_to_client) {
                                self.client
                                    .send(pending.command, pending.flag, &pending.payload)
                                    .await?;
                            }
                        }
                        None => {
                            info!("Client closed; tearing down proxy");
                            break;
                        }
                    }
                }
                from_remote = remote.recv() => {
                    match from_remote? {
                        Some(frame) => {
                            if let Some(frame) = self.rewrite_server_to_client(&frame) {
                                self.client.send(frame.command, frame.flag, &frame.payload).await?;
                            }
                        }
                        None => {
                            info!("Remote closed; tearing down proxy");
                            break;
                        }
                    }
                }
            }
        }
        info!(
            session = self.session_id(),
            players = self.players().len(),
            "Proxy session ended"
        );
        Ok(())
    }

    /// Pull identity and destination out of the login command.
    fn learn_identity(&mut self, frame: &Frame) -> anyhow::Result<()> {
        match frame.command {
            cmd::LOGIN_V3 => {
                let login = LoginV3::parse(&frame.payload)
                    .map_err(|e| anyhow::anyhow!("bad login: {e}"))?;
                if let Ok(config) = ClientConfig::parse(&login.client_config) {
                    self.config.merge_from_client(&config);
                }
                self.local_guild_card = login.base.guild_card_number;
            }
            cmd::LOGIN_93 if self.version == Version::BbV4 => {
                let login = LoginBb::parse(&frame.payload)
                    .map_err(|e| anyhow::anyhow!("bad login: {e}"))?;
                if let Ok(config) = ClientConfig::parse(&login.client_config) {
                    self.config.merge_from_client(&config);
                }
                self.local_guild_card = login.guild_card_number;
            }
            _ => {
                let mut r = PayloadReader::new(&frame.payload);
                let _tag = r.get_u32().unwrap_or(0);
                self.local_guild_card = r.get_u32().unwrap_or(0);
            }
        }
        self.session_id = ((self.local_guild_card as u64) << 32) | self.local_port as u64;
        Ok(())
    }

    /// Where this session should connect, from the echoed config or the
    /// configured destination list.
    fn destination(&self) -> anyhow::Result<SocketAddr> {
        if self.config.proxy_destination_port != 0 {
            let addr = Ipv4Addr::from(self.config.proxy_destination_address);
            return Ok(SocketAddr::new(addr.into(), self.config.proxy_destination_port));
        }
        let config = self.state.config_snapshot();
        let dest = config
            .proxy
            .destinations
            .iter()
            .find(|d| Version::from_tag(&d.version) == Some(self.version))
            .ok_or_else(|| anyhow::anyhow!("no proxy destination for {}", self.version))?;
        let addr: Ipv4Addr = dest
            .address
            .parse()
            .map_err(|_| anyhow::anyhow!("bad proxy destination address {:?}", dest.address))?;
        Ok(SocketAddr::new(addr.into(), dest.port))
    }

    /// Client-to-server hooks. Returning `None` suppresses the frame.
    fn rewrite_client_to_server(&mut self, frame: &Frame) -> Option<Frame> {
        match frame.command {
            cmd::GAME_COMMAND if self.drop_mode == DropMode::Intercept => {
                if let Ok(header) = SubcommandHeader::parse(&frame.payload) {
                    if header.subcommand == subcmd::ENEMY_DROP_ITEM_REQUEST
                        || header.subcommand == subcmd::BOX_DROP_ITEM_REQUEST
                    {
                        // Drops are generated locally; the remote server
                        // never sees the request.
                        self.intercept_drop(frame);
                        return None;
                    }
                }
                Some(frame.clone())
            }
            _ => Some(frame.clone()),
        }
    }

    /// Server-to-client hooks.
    fn rewrite_server_to_client(&mut self, frame: &Frame) -> Option<Frame> {
        match frame.command {
            cmd::RECONNECT | cmd::RECONNECT_PATCH => {
                // Patch the next hop back through this proxy; the remote
                // address the server wanted becomes our next destination.
                if let Ok(parsed) = Reconnect::parse(&frame.payload) {
                    self.config.proxy_destination_address = u32::from(parsed.address);
                    self.config.proxy_destination_port = parsed.port;
                    let local = match self.client_addr.ip() {
                        std::net::IpAddr::V4(v4) => self.state.reconnect_address_for(v4),
                        _ => Ipv4Addr::LOCALHOST,
                    };
                    let rewritten = Reconnect {
                        address: local,
                        port: self.local_port,
                    };
                    debug!(upstream = %parsed.address, "Reconnect patched back to proxy");
                    return Some(Frame {
                        command: frame.command,
                        flag: frame.flag,
                        payload: bytes::Bytes::from(rewritten.encode().to_vec()),
                    });
                }
                Some(frame.clone())
            }
            cmd::JOIN_LOBBY | cmd::JOIN_GAME | cmd::ADD_LOBBY_PLAYER | cmd::ADD_GAME_PLAYER => {
                self.record_roster(frame);
                Some(self.rewrite_own_guild_card(frame))
            }
            cmd::QUEST_FILE_OPEN | cmd::QUEST_FILE_CHUNK => {
                if self
                    .config
                    .check_flag(crate::state::client::client_flags::PROXY_SAVE_FILES)
                {
                    self.save_remote_file(frame);
                }
                Some(frame.clone())
            }
            _ => Some(frame.clone()),
        }
    }

    /// Shadow lobby rosters (and the game seed for drop interception).
    fn record_roster(&mut self, frame: &Frame) {
        let Ok(header) = JoinHeader::parse(&frame.payload) else {
            return;
        };
        if frame.command == cmd::JOIN_GAME {
            self.item_creator = Some(ItemCreator::new(
                header.random_seed,
                header.section_id,
                header.difficulty,
                self.state.common_items.read().get(self.version).clone(),
                self.state.rare_items.read().get(self.version).clone(),
            ));
            self.lobby_players.clear();
        }
        if frame.command == cmd::JOIN_LOBBY {
            self.lobby_players.clear();
        }
        let mut offset = JoinHeader::SIZE;
        while offset + ragol_proto::command::PlayerEntry::SIZE <= frame.payload.len() {
            let Ok(entry) =
                ragol_proto::command::PlayerEntry::parse(&frame.payload[offset..]) else {
                break;
            };
            self.lobby_players.push(ObservedPlayer {
                guild_card_number: entry.guild_card_number,
                client_id: entry.client_id,
                language: entry.language,
                section_id: entry.section_id,
                char_class: entry.char_class,
                name: entry.name,
            });
            // The join header names our own slot; that entry carries the
            // Guild Card number the remote server assigned us.
            if self.remote_guild_card.is_none() && entry.client_id == header.client_id {
                self.remote_guild_card = Some(entry.guild_card_number);
            }
            offset += ragol_proto::command::PlayerEntry::SIZE;
        }
        debug!(players = self.lobby_players.len(), "Roster shadowed");
    }

    /// The remote server may have assigned a different Guild Card number;
    /// the client keeps seeing the one it logged in with. Roster entries
    /// matching the remote assignment are rewritten in place.
    fn rewrite_own_guild_card(&self, frame: &Frame) -> Frame {
        let Some(remote) = self.remote_guild_card else {
            return frame.clone();
        };
        if remote == self.local_guild_card || self.local_guild_card == 0 {
            return frame.clone();
        }
        let mut payload = frame.payload.to_vec();
        let mut offset = JoinHeader::SIZE;
        while offset + ragol_proto::command::PlayerEntry::SIZE <= payload.len() {
            let gc_bytes = &payload[offset + 4..offset + 8];
            let guild_card = u32::from_le_bytes([gc_bytes[0], gc_bytes[1], gc_bytes[2], gc_bytes[3]]);
            if guild_card == remote {
                payload[offset + 4..offset + 8]
                    .copy_from_slice(&self.local_guild_card.to_le_bytes());
            }
            offset += ragol_proto::command::PlayerEntry::SIZE;
        }
        Frame {
            command: frame.command,
            flag: frame.flag,
            payload: bytes::Bytes::from(payload),
        }
    }

    /// Roll an intercepted drop with the locally seeded creator and queue
    /// the floor-item create for the client.
    fn intercept_drop(&mut self, frame: &Frame) {
        let Some(creator) = self.item_creator.as_mut() else {
            return;
        };
        let Ok(header) = SubcommandHeader::parse(&frame.payload) else {
            return;
        };
        let mut r = PayloadReader::new(&frame.payload[SubcommandHeader::SIZE..]);
        let floor = r.get_u8().unwrap_or(0);
        let _pad = r.get_u8().unwrap_or(0);
        let _entity = r.get_u16().unwrap_or(0);
        let x = r.get_f32().unwrap_or(0.0);
        let z = r.get_f32().unwrap_or(0.0);

        let item = if header.subcommand == subcmd::ENEMY_DROP_ITEM_REQUEST {
            creator.enemy_drop(header.param)
        } else {
            creator.box_drop(floor)
        };
        let Some(item) = item else {
            return;
        };
        debug!(item = %crate::tables::describe_item(&item), "Intercepted drop");

        let item_id = self.next_intercept_item_id;
        self.next_intercept_item_id = item_id.wrapping_add(1);
        let mut payload = Vec::with_capacity(32);
        payload.extend_from_slice(
            &SubcommandHeader {
                subcommand: subcmd::CREATE_FLOOR_ITEM,
                size_units: 7,
                param: 0,
            }
            .encode(),
        );
        payload.extend_from_slice(&item.0);
        payload.extend_from_slice(&item_id.to_le_bytes());
        payload.push(floor);
        payload.extend_from_slice(&[0u8; 3]);
        payload.extend_from_slice(&x.to_bits().to_le_bytes());
        payload.extend_from_slice(&z.to_bits().to_le_bytes());
        self.pending_to_client.push(Frame {
            command: cmd::GAME_COMMAND,
            flag: 0,
            payload: bytes::Bytes::from(payload),
        });
    }

    /// Observed remote players (read by status surfaces).
    pub fn players(&self) -> &[ObservedPlayer] {
        &self.lobby_players
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    fn save_remote_file(&self, frame: &Frame) {
        let dir = PathBuf::from("system/proxy-saves");
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        let name: String = frame
            .payload
            .iter()
            .take(0x20)
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-' || *c == '_')
            .collect();
        if name.is_empty() {
            return;
        }
        let path = dir.join(name);
        let body = &frame.payload[frame.payload.len().min(0x20)..];
        let mut existing = std::fs::read(&path).unwrap_or_default();
        existing.extend_from_slice(body);
        if let Err(e) = std::fs::write(&path, existing) {
            warn!(error = %e, "Failed to save proxied file");
        }
    }
}
