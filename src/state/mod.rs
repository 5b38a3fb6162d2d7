//! Shared server state.
//!
//! [`ServerState`] is the process-wide context object handed to every
//! handler: the account index, the lobby registry, the connected-client
//! map, the immutable data tables, and the quest/tournament indexes.
//! Reloadable tables sit behind `RwLock<Arc<T>>` so a handler takes a
//! snapshot once and never observes a half-swapped table.

pub mod client;
pub mod items;
pub mod lobby;
pub mod step_graph;

use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use ragol_proto::Version;

use crate::account::AccountIndex;
use crate::config::{BannedRanges, Config};
use crate::ep3::TournamentIndex;
use crate::error::LobbyError;
use crate::quests::QuestIndex;
use crate::tables::{CommonItemSet, LevelTable, RareItemSet};
use client::Client;
use lobby::{lobby_flags, Lobby, SharedLobby};

/// Number of general default lobbies created at startup.
pub const DEFAULT_LOBBY_COUNT: u32 = 15;
/// Number of Episode III-only default lobbies.
pub const EP3_LOBBY_COUNT: u32 = 5;
/// First id handed to dynamically created games.
const FIRST_DYNAMIC_LOBBY_ID: u32 = 0x100;

/// A dense per-version table, indexed by `Version::index()`.
#[derive(Debug, Clone)]
pub struct VersionTable<T> {
    entries: Vec<T>,
}

impl<T: Clone> VersionTable<T> {
    pub fn splat(value: T) -> Self {
        VersionTable {
            entries: vec![value; Version::COUNT],
        }
    }

    pub fn get(&self, version: Version) -> &T {
        &self.entries[version.index()]
    }

    pub fn set(&mut self, version: Version, value: T) {
        self.entries[version.index()] = value;
    }
}

/// The process-wide state singleton.
pub struct ServerState {
    /// Current configuration snapshot; reloads swap the whole Arc.
    pub config: RwLock<Arc<Config>>,
    pub banned_ranges: RwLock<BannedRanges>,

    pub accounts: AccountIndex,

    /// Every connected client by client id.
    pub clients: DashMap<u64, Arc<Client>>,
    /// Every live lobby and game by lobby id.
    pub lobbies: DashMap<u32, SharedLobby>,

    pub level_table: RwLock<Arc<LevelTable>>,
    pub common_items: RwLock<VersionTable<Arc<CommonItemSet>>>,
    pub rare_items: RwLock<VersionTable<Arc<RareItemSet>>>,
    pub quests: RwLock<Arc<QuestIndex>>,
    pub tournaments: TournamentIndex,

    next_client_id: AtomicU64,
    next_lobby_id: AtomicU32,
}

impl ServerState {
    pub fn new(config: Config) -> Result<Arc<ServerState>, crate::account::store::StoreError> {
        let account_dir = if config.accounts.force_all_temporary {
            None
        } else {
            Some(std::path::PathBuf::from(&config.accounts.directory))
        };
        let accounts = AccountIndex::new(account_dir)?;
        let banned = BannedRanges::from_config(&config.server);
        let tournaments = TournamentIndex::load(&config.episode3.tournament_file);
        let quest_dir = config.game.quest_directory.clone();

        let state = Arc::new(ServerState {
            config: RwLock::new(Arc::new(config)),
            banned_ranges: RwLock::new(banned),
            accounts,
            clients: DashMap::new(),
            lobbies: DashMap::new(),
            level_table: RwLock::new(Arc::new(LevelTable::default())),
            common_items: RwLock::new(VersionTable::splat(Arc::new(CommonItemSet::default()))),
            rare_items: RwLock::new(VersionTable::splat(Arc::new(RareItemSet::default()))),
            quests: RwLock::new(Arc::new(QuestIndex::load(std::path::Path::new(&quest_dir)))),
            tournaments,
            next_client_id: AtomicU64::new(1),
            next_lobby_id: AtomicU32::new(FIRST_DYNAMIC_LOBBY_ID),
        });
        state.create_default_lobbies();
        Ok(state)
    }

    /// The default public lobbies: ids 1-15 general, 16-20 Episode III.
    /// They are persistent and never destroyed.
    fn create_default_lobbies(&self) {
        for id in 1..=DEFAULT_LOBBY_COUNT {
            let lobby = Lobby::new_default_lobby(id, (id - 1) as u8, false);
            self.lobbies.insert(id, Arc::new(lobby));
        }
        for n in 0..EP3_LOBBY_COUNT {
            let id = DEFAULT_LOBBY_COUNT + 1 + n;
            let lobby = Lobby::new_default_lobby(id, (id - 1) as u8, true);
            self.lobbies.insert(id, Arc::new(lobby));
        }
        info!(
            general = DEFAULT_LOBBY_COUNT,
            episode3 = EP3_LOBBY_COUNT,
            "Created default lobbies"
        );
    }

    pub fn allocate_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allocate_lobby_id(&self) -> u32 {
        self.next_lobby_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn config_snapshot(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn find_lobby(&self, lobby_id: u32) -> Option<SharedLobby> {
        self.lobbies.get(&lobby_id).map(|entry| entry.value().clone())
    }

    pub fn find_client(&self, client_id: u64) -> Option<Arc<Client>> {
        self.clients.get(&client_id).map(|entry| entry.value().clone())
    }

    /// Find a connected client by Guild Card number.
    pub fn find_client_by_guild_card(&self, guild_card_number: u32) -> Option<Arc<Client>> {
        self.clients
            .iter()
            .map(|entry| entry.value().clone())
            .find(|client| client.guild_card_number() == guild_card_number)
    }

    /// The default-lobby scan order for a version. Episode III clients see
    /// their dedicated lobbies first; everyone falls back to the general
    /// set.
    pub fn lobby_search_order(&self, version: Version) -> Vec<u32> {
        let general = 1..=DEFAULT_LOBBY_COUNT;
        let ep3 = (DEFAULT_LOBBY_COUNT + 1)..=(DEFAULT_LOBBY_COUNT + EP3_LOBBY_COUNT);
        if version.is_ep3() {
            ep3.chain(general).collect()
        } else {
            general.collect()
        }
    }

    /// Seat a client in the first default lobby with space. Returns the
    /// lobby and assigned slot.
    pub fn join_first_available_lobby(
        &self,
        client: &Arc<Client>,
    ) -> Result<(SharedLobby, u8), LobbyError> {
        for lobby_id in self.lobby_search_order(client.version) {
            let Some(lobby) = self.find_lobby(lobby_id) else {
                continue;
            };
            let mut inner = lobby.write();
            if !inner.version_allowed(client.version) {
                continue;
            }
            if let Ok(slot) = inner.add_client(client.id) {
                drop(inner);
                let mut state = client.state.lock();
                state.lobby_id = Some(lobby_id);
                state.lobby_client_id = slot;
                drop(state);
                debug!(client = client.id, lobby = lobby_id, slot, "Joined lobby");
                return Ok((lobby, slot));
            }
        }

        // Every default lobby is full: synthesize an overflow lobby.
        let lobby_id = self.allocate_lobby_id();
        let lobby = Arc::new(Lobby::new_overflow(lobby_id, client.version.is_ep3()));
        let slot = lobby.write().add_client(client.id)?;
        self.lobbies.insert(lobby_id, lobby.clone());
        {
            let mut state = client.state.lock();
            state.lobby_id = Some(lobby_id);
            state.lobby_client_id = slot;
        }
        info!(client = client.id, lobby = lobby_id, "Created overflow lobby");
        Ok((lobby, slot))
    }

    /// Remove a client from its current lobby. Returns the lobby, the
    /// vacated slot, and the (possibly new) leader slot; the caller emits
    /// the player-left notifications.
    pub fn leave_current_lobby(&self, client: &Arc<Client>) -> Option<(SharedLobby, u8, u8)> {
        let lobby_id = client.state.lock().lobby_id.take()?;
        let lobby = self.find_lobby(lobby_id)?;
        let mut inner = lobby.write();
        let slot = inner.remove_client(client.id)?;
        let leader = inner.leader_slot;
        drop(inner);
        Some((lobby, slot, leader))
    }

    /// Destroy empty non-persistent lobbies whose linger has elapsed.
    /// Runs from a periodic sweep, never during iteration elsewhere.
    pub fn reap_empty_lobbies(&self, linger: Duration) -> Vec<u32> {
        let mut doomed = Vec::new();
        for entry in self.lobbies.iter() {
            let inner = entry.value().read();
            if inner.check_flag(lobby_flags::PERSISTENT) {
                continue;
            }
            if let Some(since) = inner.empty_since {
                if since.elapsed() >= linger {
                    doomed.push(*entry.key());
                }
            }
        }
        for lobby_id in &doomed {
            if self.lobbies.remove(lobby_id).is_some() {
                debug!(lobby = lobby_id, "Destroyed empty lobby");
            }
        }
        doomed
    }

    /// Choose the reconnect address for a client: LAN peers get the local
    /// address, everyone else the external one.
    pub fn reconnect_address_for(&self, peer: Ipv4Addr) -> Ipv4Addr {
        let config = self.config_snapshot();
        let local = config.server.local_address;
        if peer.is_loopback() || same_subnet(peer, local) {
            local
        } else {
            config.server.external_address
        }
    }
}

/// /24 subnet comparison, good enough to split LAN from WAN peers.
fn same_subnet(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    let a = u32::from(a);
    let b = u32::from(b);
    (a & 0xFFFF_FF00) == (b & 0xFFFF_FF00)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Behavior;
    use tokio::sync::mpsc;

    fn test_state() -> Arc<ServerState> {
        let config: Config = toml::from_str(
            r#"
            [server]
            name = "test"

            [[listen]]
            name = "gc"
            port = 9100
            version = "gc-v3"
            behavior = "lobby_server"

            [accounts]
            force_all_temporary = true
        "#,
        )
        .unwrap();
        ServerState::new(config).unwrap()
    }

    fn test_client(state: &ServerState, version: Version) -> Arc<Client> {
        let (tx, _rx) = mpsc::channel(8);
        let id = state.allocate_client_id();
        let client = Arc::new(Client::new(
            id,
            version,
            Behavior::LobbyServer,
            "127.0.0.1:1".parse().unwrap(),
            tx,
        ));
        state.clients.insert(id, client.clone());
        client
    }

    #[test]
    fn default_lobbies_exist_and_persist() {
        let state = test_state();
        assert_eq!(
            state.lobbies.len() as u32,
            DEFAULT_LOBBY_COUNT + EP3_LOBBY_COUNT
        );
        // The reaper never touches them.
        state.reap_empty_lobbies(Duration::ZERO);
        assert_eq!(
            state.lobbies.len() as u32,
            DEFAULT_LOBBY_COUNT + EP3_LOBBY_COUNT
        );
    }

    #[test]
    fn ep3_clients_scan_ep3_lobbies_first() {
        let state = test_state();
        let order = state.lobby_search_order(Version::GcEp3);
        assert_eq!(order[0], DEFAULT_LOBBY_COUNT + 1);
        let order = state.lobby_search_order(Version::DcV2);
        assert_eq!(order[0], 1);
    }

    #[test]
    fn join_and_leave_round_trip() {
        let state = test_state();
        let client = test_client(&state, Version::GcV3);
        let (lobby, slot) = state.join_first_available_lobby(&client).unwrap();
        assert_eq!(lobby.lobby_id, 1);
        assert_eq!(slot, 0);
        assert_eq!(client.state.lock().lobby_id, Some(1));

        let (left, vacated, _) = state.leave_current_lobby(&client).unwrap();
        assert_eq!(left.lobby_id, 1);
        assert_eq!(vacated, 0);
        assert!(client.state.lock().lobby_id.is_none());
        assert!(lobby.read().is_empty());
        // Leaving twice is a no-op.
        assert!(state.leave_current_lobby(&client).is_none());
    }

    #[test]
    fn dynamic_lobby_reaped_after_linger() {
        let state = test_state();
        let id = state.allocate_lobby_id();
        let game = Lobby::new_game(
            id,
            "doomed".into(),
            Version::GcV3,
            crate::state::lobby::GameState {
                base_version: Version::GcV3,
                mode: crate::state::lobby::GameMode::Normal,
                episode: crate::state::lobby::Episode::Ep1,
                difficulty: 0,
                min_level: 0,
                max_level: 200,
                password: String::new(),
                random_seed: 0,
                section_id: 0,
                variations: [0; 0x20],
                drop_mode: crate::state::lobby::DropMode::Client,
                exp_multiplier: 1.0,
                floor_items: crate::state::items::FloorItemManager::new(),
                map: crate::state::lobby::MapState::default(),
                switch_flags: std::collections::HashSet::new(),
                item_creator: None,
                quest_name: None,
                challenge: None,
                ep3: None,
            },
        );
        // Simulate a client having been there and left.
        {
            let mut inner = game.write();
            inner.add_client(42).unwrap();
            inner.remove_client(42);
        }
        state.lobbies.insert(id, Arc::new(game));
        let doomed = state.reap_empty_lobbies(Duration::ZERO);
        assert_eq!(doomed, vec![id]);
        assert!(state.find_lobby(id).is_none());
    }

    #[test]
    fn reconnect_address_split() {
        let state = test_state();
        {
            let mut config = (*state.config_snapshot()).clone();
            config.server.local_address = "192.168.1.10".parse().unwrap();
            config.server.external_address = "203.0.113.5".parse().unwrap();
            *state.config.write() = Arc::new(config);
        }
        assert_eq!(
            state.reconnect_address_for("192.168.1.77".parse().unwrap()),
            "192.168.1.10".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            state.reconnect_address_for("198.51.100.2".parse().unwrap()),
            "203.0.113.5".parse::<Ipv4Addr>().unwrap()
        );
    }
}
