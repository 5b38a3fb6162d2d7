//! Lobbies and games.
//!
//! A game is a lobby with extra state hanging off it ([`GameState`]). Lobby
//! mutations go through the inner `RwLock`; the lock discipline is
//! collect-then-send: gather the target client ids and payloads under the
//! lock, release it, then do the async sends in slot order so every
//! recipient observes a deterministic ordering.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use ragol_proto::Version;

use crate::error::LobbyError;
use crate::state::items::{FloorItemManager, ItemCreator};

pub const MAX_LOBBY_CLIENTS: usize = 12;
pub const MAX_GAME_CLIENTS: usize = 4;

/// Lobby flag bits.
pub mod lobby_flags {
    /// Set on games (lobbies created through game creation).
    pub const IS_GAME: u32 = 0x0001;
    /// Game only: cheat commands may run here.
    pub const CHEATS_ENABLED: u32 = 0x0002;
    /// Lobby only: visible in public lists.
    pub const PUBLIC: u32 = 0x0004;
    /// Lobby and game: Episode III clients only.
    pub const EPISODE_3: u32 = 0x0008;
    /// Game only.
    pub const QUEST_IN_PROGRESS: u32 = 0x0010;
    /// Game only.
    pub const JOINABLE_QUEST_IN_PROGRESS: u32 = 0x0020;
    /// Lobby only: auto-populated by the join-lobby flow.
    pub const DEFAULT: u32 = 0x0040;
    /// Never destroyed when empty.
    pub const PERSISTENT: u32 = 0x0080;
    /// Overflow lobby created when the defaults are full.
    pub const IS_OVERFLOW: u32 = 0x0100;
    /// Episode III battle currently running.
    pub const BATTLE_IN_PROGRESS: u32 = 0x0200;
    /// Episode III spectator team.
    pub const IS_SPECTATOR_TEAM: u32 = 0x0400;
    /// Episode III: spectator teams may not attach.
    pub const SPECTATORS_FORBIDDEN: u32 = 0x0800;
}

/// Game mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameMode {
    Normal,
    Battle,
    Challenge,
    Solo,
}

impl GameMode {
    pub fn from_u8(value: u8) -> GameMode {
        match value {
            1 => GameMode::Battle,
            2 => GameMode::Challenge,
            3 => GameMode::Solo,
            _ => GameMode::Normal,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            GameMode::Normal => 0,
            GameMode::Battle => 1,
            GameMode::Challenge => 2,
            GameMode::Solo => 3,
        }
    }
}

/// Episode selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Episode {
    Ep1,
    Ep2,
    Ep3,
    Ep4,
}

impl Episode {
    pub fn from_number(value: u8) -> Episode {
        match value {
            2 => Episode::Ep2,
            3 => Episode::Ep3,
            4 => Episode::Ep4,
            _ => Episode::Ep1,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Episode::Ep1 => 1,
            Episode::Ep2 => 2,
            Episode::Ep3 => 3,
            Episode::Ep4 => 4,
        }
    }
}

/// Who is authoritative for item drops in a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropMode {
    /// Nothing drops.
    Disabled,
    /// The game leader decides; the server validates and forwards.
    Client,
    /// Server generates one item; everyone sees the same id.
    ServerShared,
    /// Server generates per-client drops, each visible to its owner only.
    ServerPrivate,
    /// Server generates a duplicate per client with distinct ids.
    ServerDuplicate,
    /// Proxy sessions only: intercept remote drops and regenerate locally.
    Intercept,
}

impl DropMode {
    pub fn from_name(name: &str) -> Option<DropMode> {
        match name {
            "disabled" => Some(DropMode::Disabled),
            "client" => Some(DropMode::Client),
            "server-shared" => Some(DropMode::ServerShared),
            "server-private" => Some(DropMode::ServerPrivate),
            "server-duplicate" => Some(DropMode::ServerDuplicate),
            "intercept" => Some(DropMode::Intercept),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DropMode::Disabled => "disabled",
            DropMode::Client => "client",
            DropMode::ServerShared => "server-shared",
            DropMode::ServerPrivate => "server-private",
            DropMode::ServerDuplicate => "server-duplicate",
            DropMode::Intercept => "intercept",
        }
    }

    /// Whether the server (not the leader) rolls the drops.
    pub fn server_generates(self) -> bool {
        matches!(
            self,
            DropMode::ServerShared | DropMode::ServerPrivate | DropMode::ServerDuplicate
        )
    }
}

/// One enemy in the game's fixed enemy set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnemyState {
    pub enemy_type: u16,
    /// Base EXP awarded on kill.
    pub exp: u32,
    pub last_hit_by: Option<u8>,
    /// One bit per client slot that has damaged this enemy.
    pub hit_mask: u16,
    pub killed: bool,
}

impl EnemyState {
    pub fn new(enemy_type: u16, exp: u32) -> Self {
        EnemyState {
            enemy_type,
            exp,
            last_hit_by: None,
            hit_mask: 0,
            killed: false,
        }
    }

    pub fn record_hit(&mut self, client_slot: u8) {
        self.last_hit_by = Some(client_slot);
        self.hit_mask |= 1 << (client_slot as u16 % 16);
    }
}

/// The enemy set for a game, indexed by enemy id.
#[derive(Debug, Clone, Default)]
pub struct MapState {
    pub enemies: Vec<EnemyState>,
}

impl MapState {
    /// Build the enemy set for (episode, difficulty, variations). Real map
    /// files are not shipped with the repository; the set is synthesized
    /// deterministically from the tuple so replays and tests agree.
    pub fn generate(episode: Episode, difficulty: u8, variations: &[u32]) -> MapState {
        let mut enemies = Vec::new();
        let floors = match episode {
            Episode::Ep1 => 10,
            Episode::Ep2 => 12,
            Episode::Ep3 => 0,
            Episode::Ep4 => 9,
        };
        for floor in 0..floors {
            let variation = variations.get(floor as usize).copied().unwrap_or(0);
            let per_floor = 12 + (variation % 4) as u16;
            for n in 0..per_floor {
                let enemy_type = (episode.number() as u16) << 8 | (floor as u16) << 3 | (n % 8);
                let exp = (4 + floor as u32 * 3 + (n as u32 % 5)) * (difficulty as u32 + 1);
                enemies.push(EnemyState::new(enemy_type, exp));
            }
        }
        MapState { enemies }
    }

    pub fn enemy_mut(&mut self, enemy_id: u16) -> Option<&mut EnemyState> {
        self.enemies.get_mut(enemy_id as usize)
    }
}

/// Challenge-mode rank thresholds for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankThreshold {
    /// Stage-completion seconds at or under which the rank is earned.
    pub seconds: u32,
    /// Award bitmask delivered with the rank.
    pub award_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeParams {
    pub stage_number: u8,
    /// Gold, silver, bronze.
    pub rank_thresholds: [RankThreshold; 3],
}

impl ChallengeParams {
    pub fn rank_for_time(&self, seconds: u32) -> Option<usize> {
        self.rank_thresholds
            .iter()
            .position(|t| seconds <= t.seconds)
    }
}

/// Game-only state attached to a lobby.
pub struct GameState {
    pub base_version: Version,
    pub mode: GameMode,
    pub episode: Episode,
    pub difficulty: u8,
    pub min_level: u32,
    pub max_level: u32,
    pub password: String,
    pub random_seed: u32,
    pub section_id: u8,
    pub variations: [u32; 0x20],
    pub drop_mode: DropMode,
    pub exp_multiplier: f32,
    pub floor_items: FloorItemManager,
    pub map: MapState,
    /// Enabled switches, keyed by (floor, switch id).
    pub switch_flags: HashSet<(u8, u16)>,
    pub item_creator: Option<ItemCreator>,
    pub quest_name: Option<String>,
    pub challenge: Option<ChallengeParams>,
    pub ep3: Option<crate::ep3::BattleState>,
}

impl std::fmt::Debug for GameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameState")
            .field("base_version", &self.base_version)
            .field("mode", &self.mode)
            .field("episode", &self.episode)
            .field("difficulty", &self.difficulty)
            .field("drop_mode", &self.drop_mode)
            .finish_non_exhaustive()
    }
}

/// Mutable lobby contents behind the lock.
#[derive(Debug)]
pub struct LobbyInner {
    pub flags: u32,
    pub block: u8,
    /// Visual lobby type (skin number shown to clients).
    pub lobby_type: u8,
    pub event: u8,
    /// Bitmask over `Version::index()`.
    pub allowed_versions: u16,
    pub leader_slot: u8,
    pub max_clients: u8,
    pub name: String,
    /// Client ids by slot. `slots[i]` pairs with that client's
    /// `lobby_client_id == i`.
    pub slots: [Option<u64>; MAX_LOBBY_CLIENTS],
    pub game: Option<GameState>,
    /// When the lobby became empty (drives deferred destruction).
    pub empty_since: Option<Instant>,
}

impl LobbyInner {
    pub fn check_flag(&self, flag: u32) -> bool {
        (self.flags & flag) != 0
    }

    pub fn is_game(&self) -> bool {
        self.check_flag(lobby_flags::IS_GAME)
    }

    pub fn count_clients(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.count_clients() == 0
    }

    pub fn client_ids(&self) -> Vec<(u8, u64)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, id)| id.map(|id| (slot as u8, id)))
            .collect()
    }

    pub fn slot_of(&self, client_id: u64) -> Option<u8> {
        self.slots
            .iter()
            .position(|&id| id == Some(client_id))
            .map(|slot| slot as u8)
    }

    pub fn version_allowed(&self, version: Version) -> bool {
        (self.allowed_versions & (1 << version.index() as u16)) != 0
    }

    /// Seat a client in the first free slot.
    pub fn add_client(&mut self, client_id: u64) -> Result<u8, LobbyError> {
        let limit = (self.max_clients as usize).min(MAX_LOBBY_CLIENTS);
        let slot = self.slots[..limit]
            .iter()
            .position(Option::is_none)
            .ok_or(LobbyError::Full)?;
        self.slots[slot] = Some(client_id);
        if self.count_clients() == 1 {
            self.leader_slot = slot as u8;
        }
        self.empty_since = None;
        Ok(slot as u8)
    }

    /// Remove a client, reassigning the leader to the lowest occupied slot
    /// if the leader left. Returns the vacated slot.
    pub fn remove_client(&mut self, client_id: u64) -> Option<u8> {
        let slot = self.slot_of(client_id)?;
        self.slots[slot as usize] = None;
        if self.leader_slot == slot {
            if let Some(next) = self.slots.iter().position(Option::is_some) {
                self.leader_slot = next as u8;
            }
        }
        if self.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        Some(slot)
    }
}

/// A lobby or game room.
#[derive(Debug)]
pub struct Lobby {
    pub lobby_id: u32,
    inner: RwLock<LobbyInner>,
}

pub type SharedLobby = Arc<Lobby>;

impl Lobby {
    /// A default public lobby (persistent, auto-joined).
    pub fn new_default_lobby(lobby_id: u32, lobby_type: u8, episode3_only: bool) -> Lobby {
        let mut allowed: u16 = 0;
        for version in Version::ALL {
            let ok = if episode3_only {
                version.is_ep3()
            } else {
                version != Version::Patch
            };
            if ok {
                allowed |= 1 << version.index() as u16;
            }
        }
        let mut flags = lobby_flags::PUBLIC | lobby_flags::DEFAULT | lobby_flags::PERSISTENT;
        if episode3_only {
            flags |= lobby_flags::EPISODE_3;
        }
        Lobby {
            lobby_id,
            inner: RwLock::new(LobbyInner {
                flags,
                block: 1,
                lobby_type,
                event: 0,
                allowed_versions: allowed,
                leader_slot: 0,
                max_clients: MAX_LOBBY_CLIENTS as u8,
                name: format!("BLOCK01-{lobby_id:02}"),
                slots: [None; MAX_LOBBY_CLIENTS],
                game: None,
                empty_since: None,
            }),
        }
    }

    /// An overflow lobby, synthesized when every default lobby is full.
    /// Public but not persistent: it disappears once it empties.
    pub fn new_overflow(lobby_id: u32, episode3_only: bool) -> Lobby {
        let lobby = Lobby::new_default_lobby(lobby_id, 0, episode3_only);
        {
            let mut inner = lobby.inner.write();
            inner.flags &= !(lobby_flags::PERSISTENT | lobby_flags::DEFAULT);
            inner.flags |= lobby_flags::IS_OVERFLOW;
            inner.name = format!("OVERFLOW-{lobby_id:02}");
        }
        lobby
    }

    /// A game room. Version gating starts from the creator's version; the
    /// cross-play rules in the lobby search order widen it.
    pub fn new_game(lobby_id: u32, name: String, creator_version: Version, game: GameState) -> Lobby {
        let mut allowed: u16 = 1 << creator_version.index() as u16;
        // DC v1/v2 and PC v2 cross-play; GC and Xbox cross-play.
        match creator_version {
            Version::DcV1 | Version::DcV2 | Version::PcV2 => {
                for v in [Version::DcV1, Version::DcV2, Version::PcV2] {
                    allowed |= 1 << v.index() as u16;
                }
            }
            Version::GcV3 | Version::XbV3 => {
                for v in [Version::GcV3, Version::XbV3] {
                    allowed |= 1 << v.index() as u16;
                }
            }
            _ => {}
        }
        let mut flags = lobby_flags::IS_GAME;
        if game.episode == Episode::Ep3 {
            flags |= lobby_flags::EPISODE_3;
        }
        Lobby {
            lobby_id,
            inner: RwLock::new(LobbyInner {
                flags,
                block: 1,
                lobby_type: 0,
                event: 0,
                allowed_versions: allowed,
                leader_slot: 0,
                max_clients: MAX_GAME_CLIENTS as u8,
                name,
                slots: [None; MAX_LOBBY_CLIENTS],
                game: Some(game),
                empty_since: None,
            }),
        }
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, LobbyInner> {
        self.inner.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, LobbyInner> {
        self.inner.write()
    }
}

/// Translate a lobby decoration event into the in-game event number.
/// Festival decorations only exist in lobbies; games see at most the
/// Christmas/New Year variants.
pub fn game_event_for_lobby_event(lobby_event: u8) -> u8 {
    match lobby_event {
        1 | 2 => lobby_event,
        _ => 0,
    }
}
