//! Configuration loading and management.
//!
//! A single `config.toml` drives the whole process: the listener list, drop
//! mode defaults, permission gates, patch tree, proxy destinations, and
//! Episode III behavior. Reloads parse and validate a fresh `Config` before
//! anything live is touched; an invalid file aborts the reload.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

use crate::state::lobby::{DropMode, GameMode};
use ragol_proto::Version;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server identity and global behavior.
    pub server: ServerConfig,
    /// Listening ports. Each entry binds one version and one behavior.
    pub listen: Vec<ListenConfig>,
    /// Lobby/game runtime settings.
    #[serde(default)]
    pub game: GameConfig,
    /// Patch server settings.
    #[serde(default)]
    pub patch: PatchConfig,
    /// Proxy destination menu.
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Account store settings.
    #[serde(default)]
    pub accounts: AccountConfig,
    /// Episode III settings.
    #[serde(default)]
    pub episode3: Episode3Config,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Display name, shown in menus and logs.
    pub name: String,
    /// Address handed to clients on the same subnet as the server.
    #[serde(default = "default_local_address")]
    pub local_address: Ipv4Addr,
    /// Address handed to clients reconnecting from outside.
    #[serde(default = "default_local_address")]
    pub external_address: Ipv4Addr,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// Message shown after login. Empty disables it.
    #[serde(default)]
    pub welcome_message: String,
    /// Seconds without any traffic before a channel is dropped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds between protocol pings.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// When true, a failing handler only cancels its own action; the
    /// channel survives. When false, handler errors disconnect.
    #[serde(default = "default_true")]
    pub catch_handler_exceptions: bool,
    /// CIDR ranges refused at accept time.
    #[serde(default)]
    pub banned_ip_ranges: Vec<String>,
}

/// The per-listening-port role. Selects the active handler table and the
/// next hop on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    PatchServer,
    DataServerBb,
    LoginServer,
    LobbyServer,
    ProxyServer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Unique name for logs and reload diffing.
    pub name: String,
    #[serde(default = "default_bind_address")]
    pub addr: Ipv4Addr,
    pub port: u16,
    /// Version tag (see `Version::tag`), e.g. `"gc-v3"`.
    pub version: String,
    pub behavior: Behavior,
    /// Blue Burst private key file for ports that speak BB.
    #[serde(default)]
    pub bb_key_file: Option<String>,
}

impl ListenConfig {
    pub fn parsed_version(&self) -> Option<Version> {
        Version::from_tag(&self.version)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    /// Default drop mode per game mode.
    #[serde(default)]
    pub drop_modes: DropModesConfig,
    /// Drop modes a game creator may switch to.
    #[serde(default = "default_allowed_drop_modes")]
    pub allowed_drop_modes: Vec<String>,
    /// Base EXP multiplier applied to every award.
    #[serde(default = "default_exp_multiplier")]
    pub exp_multiplier: f32,
    /// Seconds an empty non-persistent game lingers before deletion.
    #[serde(default = "default_empty_game_linger")]
    pub empty_game_linger_secs: u64,
    /// Accept logins for credentials with no stored account.
    #[serde(default = "default_true")]
    pub allow_unregistered_users: bool,
    /// Allow GC clients to self-create accounts (requires a password).
    #[serde(default)]
    pub allow_gc_self_creation: bool,
    /// Whether $cheats may be enabled in games.
    #[serde(default = "default_true")]
    pub cheats_allowed: bool,
    /// Lobby decoration event (0 = none).
    #[serde(default)]
    pub lobby_event: u8,
    /// Quest directory root.
    #[serde(default = "default_quest_directory")]
    pub quest_directory: String,
}

impl Default for GameConfig {
    fn default() -> Self {
        GameConfig {
            drop_modes: DropModesConfig::default(),
            allowed_drop_modes: default_allowed_drop_modes(),
            exp_multiplier: default_exp_multiplier(),
            empty_game_linger_secs: default_empty_game_linger(),
            allow_unregistered_users: true,
            allow_gc_self_creation: false,
            cheats_allowed: true,
            lobby_event: 0,
            quest_directory: default_quest_directory(),
        }
    }
}

/// Default drop mode names per game mode.
#[derive(Debug, Clone, Deserialize)]
pub struct DropModesConfig {
    #[serde(default = "default_drop_mode_client")]
    pub normal: String,
    #[serde(default = "default_drop_mode_disabled")]
    pub battle: String,
    #[serde(default = "default_drop_mode_disabled")]
    pub challenge: String,
    #[serde(default = "default_drop_mode_client")]
    pub solo: String,
    /// Blue Burst overrides: the server is authoritative there.
    #[serde(default = "default_drop_mode_server_shared")]
    pub bb_normal: String,
}

impl Default for DropModesConfig {
    fn default() -> Self {
        DropModesConfig {
            normal: default_drop_mode_client(),
            battle: default_drop_mode_disabled(),
            challenge: default_drop_mode_disabled(),
            solo: default_drop_mode_client(),
            bb_normal: default_drop_mode_server_shared(),
        }
    }
}

impl DropModesConfig {
    /// Resolve the configured default for a (version, mode) pair.
    pub fn default_for(&self, version: Version, mode: GameMode) -> DropMode {
        let name = match mode {
            GameMode::Normal if version == Version::BbV4 => &self.bb_normal,
            GameMode::Normal => &self.normal,
            GameMode::Battle => &self.battle,
            GameMode::Challenge => &self.challenge,
            GameMode::Solo => &self.solo,
        };
        DropMode::from_name(name).unwrap_or(DropMode::Client)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchConfig {
    /// Root of the tree mirrored to patch clients.
    #[serde(default = "default_patch_directory")]
    pub directory: String,
    /// Message shown in the patch client's text pane.
    #[serde(default)]
    pub welcome_message: String,
    /// When true, 0x04 credentials are checked against the account index.
    #[serde(default)]
    pub require_login: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        PatchConfig {
            directory: default_patch_directory(),
            welcome_message: String::new(),
            require_login: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub destinations: Vec<ProxyDestination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyDestination {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Directory holding one JSON document per account.
    #[serde(default = "default_account_directory")]
    pub directory: String,
    /// Never persist anything (replay/test setups).
    #[serde(default)]
    pub force_all_temporary: bool,
}

impl Default for AccountConfig {
    fn default() -> Self {
        AccountConfig {
            directory: default_account_directory(),
            force_all_temporary: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Episode3Config {
    /// Tournament state file, persisted across restarts.
    #[serde(default = "default_tournament_file")]
    pub tournament_file: String,
    /// Whether spectator teams may be created.
    #[serde(default = "default_true")]
    pub allow_spectators: bool,
    /// EX result values distributed at tournament match end, win/lose.
    #[serde(default = "default_ex_values")]
    pub ex_values: [u32; 2],
}

impl Default for Episode3Config {
    fn default() -> Self {
        Episode3Config {
            tournament_file: default_tournament_file(),
            allow_spectators: true,
            ex_values: default_ex_values(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_local_address() -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 0, 1)
}
fn default_bind_address() -> Ipv4Addr {
    Ipv4Addr::new(0, 0, 0, 0)
}
fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_ping_interval() -> u64 {
    30
}
fn default_exp_multiplier() -> f32 {
    1.0
}
fn default_empty_game_linger() -> u64 {
    0
}
fn default_quest_directory() -> String {
    "system/quests".to_string()
}
fn default_patch_directory() -> String {
    "system/patch".to_string()
}
fn default_account_directory() -> String {
    "system/licenses".to_string()
}
fn default_tournament_file() -> String {
    "system/ep3/tournaments.json".to_string()
}
fn default_ex_values() -> [u32; 2] {
    [3, 1]
}
fn default_allowed_drop_modes() -> Vec<String> {
    vec![
        "disabled".into(),
        "client".into(),
        "server-shared".into(),
        "server-private".into(),
        "server-duplicate".into(),
    ]
}
fn default_drop_mode_client() -> String {
    "client".to_string()
}
fn default_drop_mode_disabled() -> String {
    "disabled".to_string()
}
fn default_drop_mode_server_shared() -> String {
    "server-shared".to_string()
}

impl Config {
    /// Load and parse a config file.
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(Path::new(path))?;
        Ok(toml::from_str(&content)?)
    }
}

/// Validate a parsed configuration. Returns every problem found so the
/// operator can fix them in one pass.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.server.name.is_empty() {
        errors.push("server.name must not be empty".to_string());
    }
    if config.listen.is_empty() {
        errors.push("at least one [[listen]] block is required".to_string());
    }

    let mut names = std::collections::HashSet::new();
    let mut ports = std::collections::HashSet::new();
    for listener in &config.listen {
        if !names.insert(listener.name.as_str()) {
            errors.push(format!("duplicate listener name {:?}", listener.name));
        }
        if listener.port == 0 {
            errors.push(format!("listener {:?} has port 0", listener.name));
        }
        if !ports.insert((listener.addr, listener.port)) {
            errors.push(format!(
                "listener {:?} duplicates {}:{}",
                listener.name, listener.addr, listener.port
            ));
        }
        match listener.parsed_version() {
            None => errors.push(format!(
                "listener {:?} has unknown version {:?}",
                listener.name, listener.version
            )),
            Some(Version::BbV4) => {
                if listener.bb_key_file.is_none() && listener.behavior != Behavior::PatchServer {
                    errors.push(format!(
                        "listener {:?} speaks Blue Burst but has no bb_key_file",
                        listener.name
                    ));
                }
            }
            Some(Version::Patch) => {
                if listener.behavior != Behavior::PatchServer {
                    errors.push(format!(
                        "listener {:?} is version patch but behavior is not patch_server",
                        listener.name
                    ));
                }
            }
            Some(_) => {}
        }
    }

    for range in &config.server.banned_ip_ranges {
        if range.parse::<ipnet::Ipv4Net>().is_err() {
            errors.push(format!("invalid banned IP range {range:?}"));
        }
    }

    for name in &config.game.allowed_drop_modes {
        if DropMode::from_name(name).is_none() {
            errors.push(format!("unknown drop mode {name:?} in allowed_drop_modes"));
        }
    }
    for (label, name) in [
        ("normal", &config.game.drop_modes.normal),
        ("battle", &config.game.drop_modes.battle),
        ("challenge", &config.game.drop_modes.challenge),
        ("solo", &config.game.drop_modes.solo),
        ("bb_normal", &config.game.drop_modes.bb_normal),
    ] {
        if DropMode::from_name(name).is_none() {
            errors.push(format!("unknown drop mode {name:?} for game.drop_modes.{label}"));
        }
    }

    for dest in &config.proxy.destinations {
        if Version::from_tag(&dest.version).is_none() {
            errors.push(format!(
                "proxy destination {:?} has unknown version {:?}",
                dest.name, dest.version
            ));
        }
    }

    if config.game.exp_multiplier <= 0.0 {
        errors.push("game.exp_multiplier must be positive".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Parsed banned ranges, checked at accept time.
#[derive(Debug, Clone, Default)]
pub struct BannedRanges {
    ranges: Vec<ipnet::Ipv4Net>,
}

impl BannedRanges {
    pub fn from_config(config: &ServerConfig) -> Self {
        BannedRanges {
            ranges: config
                .banned_ip_ranges
                .iter()
                .filter_map(|r| r.parse().ok())
                .collect(),
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.ranges.iter().any(|net| net.contains(&addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [server]
        name = "test"

        [[listen]]
        name = "gc-login"
        port = 9100
        version = "gc-v3"
        behavior = "login_server"
    "#;

    #[test]
    fn minimal_config_parses_and_validates() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert!(validate(&config).is_ok());
        assert_eq!(config.listen[0].parsed_version(), Some(Version::GcV3));
        assert_eq!(config.server.idle_timeout_secs, 60);
        assert!(config.server.catch_handler_exceptions);
    }

    #[test]
    fn bb_listener_requires_key_file() {
        let toml_src = r#"
            [server]
            name = "test"

            [[listen]]
            name = "bb-login"
            port = 12000
            version = "bb-v4"
            behavior = "login_server"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("bb_key_file")));
    }

    #[test]
    fn duplicate_ports_rejected() {
        let toml_src = r#"
            [server]
            name = "test"

            [[listen]]
            name = "a"
            port = 9100
            version = "gc-v3"
            behavior = "login_server"

            [[listen]]
            name = "b"
            port = 9100
            version = "gc-v3"
            behavior = "lobby_server"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn invalid_drop_mode_rejected() {
        let toml_src = r#"
            [server]
            name = "test"

            [[listen]]
            name = "a"
            port = 9100
            version = "gc-v3"
            behavior = "login_server"

            [game.drop_modes]
            normal = "chaotic"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("chaotic")));
    }

    #[test]
    fn banned_ranges_match() {
        let ranges = BannedRanges {
            ranges: vec!["10.0.0.0/8".parse().unwrap()],
        };
        assert!(ranges.contains(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!ranges.contains(Ipv4Addr::new(192, 168, 0, 1)));
    }

    #[test]
    fn drop_mode_defaults_per_mode() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        use crate::state::lobby::{DropMode, GameMode};
        assert_eq!(
            config.game.drop_modes.default_for(Version::GcV3, GameMode::Normal),
            DropMode::Client
        );
        assert_eq!(
            config.game.drop_modes.default_for(Version::BbV4, GameMode::Normal),
            DropMode::ServerShared
        );
        assert_eq!(
            config.game.drop_modes.default_for(Version::GcV3, GameMode::Battle),
            DropMode::Disabled
        );
    }
}
