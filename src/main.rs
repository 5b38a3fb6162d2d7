//! ragold - Ragol Daemon
//!
//! A multi-version Phantasy Star Online server: one process accepts every
//! client generation on its own ports, authenticates against a unified
//! account index, and routes clients through patch/login/lobby/game
//! phases, with an optional intercepting proxy to a remote server.

mod account;
mod config;
mod ep3;
mod error;
mod handlers;
mod network;
mod patch;
mod proxy;
mod quests;
mod state;
mod tables;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{BannedRanges, Config};
use crate::network::Gateway;
use crate::state::step_graph::{RunDirection, StepGraph};
use crate::state::{ServerState, VersionTable};
use crate::tables::{CommonItemSet, LevelTable, RareItemSet};
use ragol_proto::Version;

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `config.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };

    // Canonicalize to avoid relying on the current working directory during
    // a reload.
    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

/// Load per-version table files when they exist; defaults otherwise.
fn load_tables(state: &Arc<ServerState>) {
    let mut common = VersionTable::splat(Arc::new(CommonItemSet::default()));
    let mut rare = VersionTable::splat(Arc::new(RareItemSet::default()));
    for version in Version::ALL {
        let common_path = format!("system/tables/common-items-{}.bin", version.tag());
        match CommonItemSet::from_file(Path::new(&common_path)) {
            Ok(table) => common.set(version, Arc::new(table)),
            Err(tables::TableError::Io(_)) => {}
            Err(e) => warn!(version = %version, error = %e, "Bad common-item table"),
        }
        let rare_path = format!("system/tables/rare-items-{}.bin", version.tag());
        match RareItemSet::from_file(Path::new(&rare_path)) {
            Ok(table) => rare.set(version, Arc::new(table)),
            Err(tables::TableError::Io(_)) => {}
            Err(e) => warn!(version = %version, error = %e, "Bad rare-item table"),
        }
    }
    *state.common_items.write() = common;
    *state.rare_items.write() = rare;

    match LevelTable::from_file(Path::new("system/tables/level-table.bin")) {
        Ok(table) => *state.level_table.write() = Arc::new(table),
        Err(tables::TableError::Io(_)) => {}
        Err(e) => warn!(error = %e, "Bad level table"),
    }
}

/// Build the hot-reload graph: configuration feeds everything downstream.
fn build_reload_graph(state: Arc<ServerState>, config_path: String) -> StepGraph {
    let mut graph = StepGraph::new();

    {
        let state = state.clone();
        graph
            .add_step("config", &[], move || match Config::load(&config_path) {
                Ok(fresh) => match config::validate(&fresh) {
                    Ok(()) => {
                        *state.banned_ranges.write() = BannedRanges::from_config(&fresh.server);
                        *state.config.write() = Arc::new(fresh);
                        info!("Configuration reloaded");
                    }
                    Err(errors) => {
                        for e in &errors {
                            error!(error = %e, "Configuration validation failed");
                        }
                        warn!("Reload aborted; previous configuration kept");
                    }
                },
                Err(e) => {
                    error!(error = %e, "Failed to re-read configuration; previous kept");
                }
            })
            .expect("config step registers on a fresh graph");
    }
    {
        let state = state.clone();
        graph
            .add_step("quests", &["config"], move || {
                let dir = state.config_snapshot().game.quest_directory.clone();
                *state.quests.write() = Arc::new(quests::QuestIndex::load(Path::new(&dir)));
            })
            .expect("quests step registers after config");
    }
    {
        let state = state.clone();
        graph
            .add_step("item-tables", &["config"], move || {
                load_tables(&state);
            })
            .expect("item-tables step registers after config");
    }
    {
        let state = state.clone();
        graph
            .add_step("level-table", &["config"], move || {
                match LevelTable::from_file(Path::new("system/tables/level-table.bin")) {
                    Ok(table) => *state.level_table.write() = Arc::new(table),
                    Err(tables::TableError::Io(_)) => {
                        *state.level_table.write() = Arc::new(LevelTable::default());
                    }
                    Err(e) => warn!(error = %e, "Bad level table; previous kept"),
                }
            })
            .expect("level-table step registers after config");
    }
    graph
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
        e
    })?;

    // Initialize tracing based on config (before anything logs).
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.server.log_format {
        config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(server = %config.server.name, "Starting ragold");

    let state = ServerState::new(config)?;
    load_tables(&state);
    info!(
        accounts = state.accounts.count(),
        quests = state.quests.read().count(),
        "Indexes loaded"
    );

    // Hot reload on SIGUSR1 (changed data plus consumers) and SIGUSR2
    // (requested data plus prerequisites).
    {
        let mut graph = build_reload_graph(state.clone(), config_path.clone());
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut usr1 =
                signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
            let mut usr2 =
                signal(SignalKind::user_defined2()).expect("failed to install SIGUSR2 handler");
            loop {
                tokio::select! {
                    _ = usr1.recv() => {
                        info!("SIGUSR1: reloading configuration and downstream data");
                        if let Err(e) = graph.run(&["config"], RunDirection::Downstream) {
                            error!(error = %e, "Reload failed");
                        }
                    }
                    _ = usr2.recv() => {
                        info!("SIGUSR2: reloading data indexes");
                        let steps = ["quests", "item-tables", "level-table"];
                        if let Err(e) = graph.run(&steps, RunDirection::Upstream) {
                            error!(error = %e, "Reload failed");
                        }
                    }
                }
            }
        });
    }

    // Empty non-persistent games are destroyed after their linger expires.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let linger =
                    Duration::from_secs(state.config_snapshot().game.empty_game_linger_secs);
                let destroyed = state.reap_empty_lobbies(linger);
                if !destroyed.is_empty() {
                    info!(count = destroyed.len(), "Destroyed empty games");
                }
            }
        });
    }

    // Graceful shutdown on SIGINT/SIGTERM.
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT - shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM - shutting down"),
        }
        std::process::exit(0);
    });

    let gateway = Gateway::bind(state).await?;
    gateway.run().await
}
