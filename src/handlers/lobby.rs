//! Lobby-phase handlers: player data, chat, menus, lobby moves, game
//! creation, and quest delivery.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use ragol_proto::command::{
    cmd, decode_text, CreateGame, JoinHeader, MenuEntry, MenuSelection, PlayerEntry,
};
use ragol_proto::{fnv1a32, Frame, Version};

use super::login::menu_ids;
use super::{broadcast_to_lobby, chat, chat_payload, notify_player_left, Context, Handler};
use crate::error::{HandlerError, HandlerResult, LobbyError};
use crate::state::client::Client;
use crate::state::items::{FloorItemManager, ItemCreator};
use crate::state::lobby::{
    lobby_flags, Episode, GameMode, GameState, Lobby, MapState, SharedLobby,
};
use crate::state::ServerState;

pub fn register_lobby_handlers(handlers: &mut HashMap<u16, Box<dyn Handler>>) {
    handlers.insert(cmd::PLAYER_DATA, Box::new(PlayerDataHandler));
    handlers.insert(cmd::PLAYER_DATA_LEAVE, Box::new(PlayerDataHandler));
    handlers.insert(cmd::CHAT, Box::new(ChatHandler));
    handlers.insert(cmd::GAME_LIST_REQUEST, Box::new(GameListHandler));
    handlers.insert(cmd::MENU_ITEM_INFO_REQUEST, Box::new(MenuItemInfoHandler));
    handlers.insert(cmd::MENU_SELECTION, Box::new(MenuSelectionHandler));
    handlers.insert(cmd::LOBBY_INFO, Box::new(LobbyListHandler));
    handlers.insert(cmd::CHANGE_LOBBY, Box::new(ChangeLobbyHandler));
    handlers.insert(cmd::REQUEST_LOBBY_NAME, Box::new(LobbyNameHandler));
    handlers.insert(cmd::CHANGE_SHIP, Box::new(ChangeShipHandler));
    handlers.insert(cmd::CHANGE_BLOCK, Box::new(LobbyListHandler));
    handlers.insert(cmd::CREATE_GAME, Box::new(CreateGameHandler));
    handlers.insert(cmd::CREATE_GAME_DC_V1, Box::new(CreateGameHandler));
    handlers.insert(cmd::CREATE_GAME_BB, Box::new(CreateGameHandler));
    handlers.insert(cmd::QUEST_LIST_REQUEST, Box::new(QuestListHandler));
    handlers.insert(cmd::QUEST_BARRIER, Box::new(QuestBarrierHandler));
    handlers.insert(cmd::SIMPLE_MAIL, Box::new(SimpleMailHandler));
}

/// Build the roster entry for one client.
fn player_entry(client: &Client, slot: u8) -> PlayerEntry {
    let state = client.state.lock();
    PlayerEntry {
        player_tag: 0x0001_0000,
        guild_card_number: state
            .login
            .as_ref()
            .map(|l| l.account.read().account_id)
            .unwrap_or(0),
        client_id: slot,
        language: state.language,
        section_id: state.section_id,
        char_class: state.char_class,
        level: state.level,
        name: state.name.clone(),
    }
}

/// Send the full join command to the arriving client and the delta to
/// everyone already there.
pub async fn announce_join(
    ctx: &mut Context<'_>,
    lobby: &SharedLobby,
    slot: u8,
) -> HandlerResult {
    let state = ctx.state.clone();
    let joiner = ctx.client.clone();
    let (is_game, header, members) = {
        let inner = lobby.read();
        let game = inner.game.as_ref();
        // Games only understand a subset of the festival decorations.
        let event = if game.is_some() {
            crate::state::lobby::game_event_for_lobby_event(inner.event)
        } else {
            inner.event
        };
        let header = JoinHeader {
            client_id: slot,
            leader_id: inner.leader_slot,
            lobby_number: inner.lobby_type,
            block_number: inner.block,
            event: event as u16,
            section_id: game.map(|g| g.section_id).unwrap_or(0),
            episode: game.map(|g| g.episode.number()).unwrap_or(0),
            difficulty: game.map(|g| g.difficulty).unwrap_or(0),
            mode: game.map(|g| g.mode.as_u8()).unwrap_or(0),
            random_seed: game.map(|g| g.random_seed).unwrap_or(0),
        };
        (inner.is_game(), header, inner.client_ids())
    };

    // Full roster to the joiner.
    let mut payload = header.encode();
    let mut count = 0u32;
    for (member_slot, member_id) in &members {
        if let Some(member) = state.find_client(*member_id) {
            payload.extend_from_slice(&player_entry(&member, *member_slot).encode());
            count += 1;
        }
    }
    let join_cmd = if is_game { cmd::JOIN_GAME } else { cmd::JOIN_LOBBY };
    ctx.reply(join_cmd, count, &payload).await?;

    // Delta to everyone else.
    let add_cmd = if is_game {
        cmd::ADD_GAME_PLAYER
    } else {
        cmd::ADD_LOBBY_PLAYER
    };
    let mut delta = header.encode();
    delta.extend_from_slice(&player_entry(&joiner, slot).encode());
    broadcast_to_lobby(
        &state,
        lobby,
        Some(joiner.id),
        add_cmd,
        slot as u32,
        Bytes::from(delta.to_vec()),
    )
    .await;
    Ok(())
}

/// Move a client into a specific lobby, emitting leave and join traffic.
pub async fn move_client_to_lobby(
    ctx: &mut Context<'_>,
    target: &SharedLobby,
) -> Result<u8, HandlerError> {
    // Validations before any state changes.
    {
        let inner = target.read();
        if !inner.version_allowed(ctx.client.version) {
            return Err(LobbyError::VersionNotAllowed.into());
        }
    }
    if let Some((old, slot, leader)) = ctx.state.leave_current_lobby(ctx.client) {
        notify_player_left(ctx.state, &old, slot, leader).await;
    }
    let slot = {
        let mut inner = target.write();
        inner.add_client(ctx.client.id)?
    };
    {
        let mut state = ctx.client.state.lock();
        state.lobby_id = Some(target.lobby_id);
        state.lobby_client_id = slot;
        state.floor = 0;
        state.x = 0.0;
        state.z = 0.0;
    }
    announce_join(ctx, target, slot).await?;
    Ok(slot)
}

/// 0x61 (and 0x98 when leaving a game): the client's player data upload.
/// The first upload also triggers default-lobby entry.
struct PlayerDataHandler;

#[async_trait]
impl Handler for PlayerDataHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let entry = PlayerEntry::parse(&frame.payload)?;
        {
            let mut state = ctx.client.state.lock();
            state.name = entry.name.clone();
            state.level = entry.level;
            state.section_id = entry.section_id;
            state.char_class = entry.char_class;
        }
        if let Some(login) = ctx.client.state.lock().login.clone() {
            let mut account = login.account.write();
            account.last_player_name = entry.name.clone();
            drop(account);
            ctx.state.accounts.save(&login.account.read());
        }

        let leaving_game = frame.command == cmd::PLAYER_DATA_LEAVE;
        let in_lobby = ctx.client.state.lock().lobby_id.is_some();
        if leaving_game || !in_lobby {
            if leaving_game {
                if let Some((old, slot, leader)) = ctx.state.leave_current_lobby(ctx.client) {
                    notify_player_left(ctx.state, &old, slot, leader).await;
                }
            }
            let (lobby, slot) = ctx
                .state
                .join_first_available_lobby(ctx.client)
                .map_err(HandlerError::from)?;
            announce_join(ctx, &lobby, slot).await?;
        }
        Ok(())
    }
}

/// 0x06: chat. Lines starting with `$` dispatch as chat commands; plain
/// lines broadcast to the lobby, echoing to the sender too.
struct ChatHandler;

#[async_trait]
impl Handler for ChatHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        if frame.payload.len() < 8 {
            return Err(HandlerError::Runtime("chat payload too short".into()));
        }
        let text = decode_text(ctx.client.version, &frame.payload[8..]);
        if text.is_empty() {
            return Ok(());
        }
        if let Some(command_line) = text.strip_prefix('$') {
            return chat::dispatch_chat_command(ctx, command_line).await;
        }

        let lobby_id = ctx.client.state.lock().lobby_id;
        let Some(lobby) = lobby_id.and_then(|id| ctx.state.find_lobby(id)) else {
            return Ok(());
        };
        let guild_card = ctx.client.guild_card_number();
        debug!(from = guild_card, "Chat");
        let payload = chat_payload(ctx.client, guild_card, &text);
        // The sender sees its own line through the same broadcast.
        ctx.reply(cmd::CHAT, 0, &payload).await?;
        broadcast_to_lobby(
            ctx.state,
            &lobby,
            Some(ctx.client.id),
            cmd::CHAT,
            0,
            Bytes::from(payload),
        )
        .await;
        Ok(())
    }
}

/// 0x08: the joinable-game list.
struct GameListHandler;

#[async_trait]
impl Handler for GameListHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        let mut entries = Vec::new();
        for item in ctx.state.lobbies.iter() {
            let inner = item.value().read();
            if !inner.is_game() || !inner.version_allowed(ctx.client.version) {
                continue;
            }
            let locked = inner
                .game
                .as_ref()
                .is_some_and(|g| !g.password.is_empty());
            entries.push(MenuEntry {
                menu_id: menu_ids::GAMES,
                item_id: item.value().lobby_id,
                flags: locked as u16,
                text: inner.name.clone(),
            });
        }
        entries.sort_by_key(|e| e.item_id);
        ctx.reply_menu(&entries).await
    }
}

/// 0x09: hover info for a menu entry.
struct MenuItemInfoHandler;

#[async_trait]
impl Handler for MenuItemInfoHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let selection = MenuSelection::parse(&frame.payload)?;
        let text = match selection.menu_id {
            menu_ids::GAMES => match ctx.state.find_lobby(selection.item_id) {
                Some(lobby) => {
                    let inner = lobby.read();
                    let players = inner.count_clients();
                    match inner.game.as_ref() {
                        Some(game) => format!(
                            "{}\nEpisode {} / difficulty {}\n{} players",
                            inner.name,
                            game.episode.number(),
                            game.difficulty,
                            players
                        ),
                        None => inner.name.clone(),
                    }
                }
                None => "This game no longer exists".to_string(),
            },
            _ => String::new(),
        };
        ctx.reply(
            cmd::INFO_REPLY,
            0,
            &ragol_proto::command::encode_text(ctx.client.version, &text),
        )
        .await
    }
}

/// 0x10 on the lobby server: game joins and quest selection.
struct MenuSelectionHandler;

#[async_trait]
impl Handler for MenuSelectionHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let selection = MenuSelection::parse(&frame.payload)?;
        match selection.menu_id {
            menu_ids::GAMES => {
                let lobby = ctx
                    .state
                    .find_lobby(selection.item_id)
                    .ok_or(LobbyError::NotFound)
                    .map_err(HandlerError::from)?;
                {
                    let inner = lobby.read();
                    let Some(game) = inner.game.as_ref() else {
                        return Err(LobbyError::NotFound.into());
                    };
                    if !game.password.is_empty() {
                        let supplied = decode_text(ctx.client.version, &selection.password);
                        if supplied != game.password {
                            return Err(LobbyError::IncorrectPassword.into());
                        }
                    }
                    let level = ctx.client.state.lock().level;
                    if level < game.min_level || level > game.max_level {
                        return Err(LobbyError::LevelRequirement.into());
                    }
                    if inner.check_flag(lobby_flags::QUEST_IN_PROGRESS) {
                        return Err(LobbyError::QuestInProgress.into());
                    }
                }
                move_client_to_lobby(ctx, &lobby).await?;
                Ok(())
            }
            menu_ids::LOBBIES => {
                let lobby = ctx
                    .state
                    .find_lobby(selection.item_id)
                    .ok_or(LobbyError::NotFound)
                    .map_err(HandlerError::from)?;
                move_client_to_lobby(ctx, &lobby).await?;
                Ok(())
            }
            menu_ids::QUEST_CATEGORIES => {
                send_quest_menu(ctx, selection.item_id as usize).await
            }
            quest_menu if (quest_menu & 0xFF) == menu_ids::QUESTS => {
                // The category index rides in the menu id's next byte.
                let category_index = ((quest_menu >> 8) & 0xFF) as usize;
                start_selected_quest(ctx, category_index, selection.item_id as usize).await
            }
            other if other == menu_ids::SHIPS || other == menu_ids::PROXY => {
                Err(HandlerError::PreconditionFailed(
                    "Use the ship menu from the counter".into(),
                ))
            }
            _ => Err(HandlerError::PreconditionFailed("Unknown menu".into())),
        }
    }
}

/// 0x83 / 0xA1: the lobby list.
struct LobbyListHandler;

#[async_trait]
impl Handler for LobbyListHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        let mut entries = Vec::new();
        for lobby_id in ctx.state.lobby_search_order(ctx.client.version) {
            let Some(lobby) = ctx.state.find_lobby(lobby_id) else {
                continue;
            };
            let inner = lobby.read();
            if !inner.version_allowed(ctx.client.version) {
                continue;
            }
            entries.push(MenuEntry {
                menu_id: menu_ids::LOBBIES,
                item_id: lobby_id,
                flags: 0,
                text: inner.name.clone(),
            });
        }
        ctx.reply_menu(&entries).await
    }
}

/// 0x84: change lobby.
struct ChangeLobbyHandler;

#[async_trait]
impl Handler for ChangeLobbyHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let selection = MenuSelection::parse(&frame.payload)?;
        let lobby = ctx
            .state
            .find_lobby(selection.item_id)
            .ok_or(LobbyError::NotFound)
            .map_err(HandlerError::from)?;
        if lobby.read().is_game() {
            return Err(HandlerError::PreconditionFailed(
                "Use the game list to join games".into(),
            ));
        }
        move_client_to_lobby(ctx, &lobby).await?;
        Ok(())
    }
}

/// 0x8A: the current lobby/game name.
struct LobbyNameHandler;

#[async_trait]
impl Handler for LobbyNameHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        let name = ctx
            .client
            .state
            .lock()
            .lobby_id
            .and_then(|id| ctx.state.find_lobby(id))
            .map(|lobby| lobby.read().name.clone())
            .unwrap_or_default();
        ctx.reply(
            cmd::REQUEST_LOBBY_NAME,
            0,
            &ragol_proto::command::encode_text(ctx.client.version, &name),
        )
        .await
    }
}

/// 0xA0: back to ship select.
struct ChangeShipHandler;

#[async_trait]
impl Handler for ChangeShipHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        let config = ctx.state.config_snapshot();
        let mut entries = Vec::new();
        for (index, listen) in config.listen.iter().enumerate() {
            if listen.behavior != crate::config::Behavior::LobbyServer {
                continue;
            }
            if listen.parsed_version() != Some(ctx.client.version) {
                continue;
            }
            entries.push(MenuEntry {
                menu_id: menu_ids::SHIPS,
                item_id: index as u32,
                flags: 0,
                text: listen.name.clone(),
            });
        }
        ctx.reply_menu(&entries).await
    }
}

/// 0xC1 / 0x0C / 0xEC: create a game.
struct CreateGameHandler;

#[async_trait]
impl Handler for CreateGameHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let request = CreateGame::parse(&frame.payload)?;
        let lobby = create_game_generic(ctx.state, ctx.client, &request)?;
        info!(
            lobby = lobby.lobby_id,
            name = %request.name,
            episode = request.episode,
            difficulty = request.difficulty,
            "Game created"
        );
        move_client_to_lobby(ctx, &lobby).await?;
        Ok(())
    }
}

/// Validate, roll, and register a game lobby (not yet joined).
pub fn create_game_generic(
    state: &Arc<ServerState>,
    client: &Arc<Client>,
    request: &CreateGame,
) -> Result<SharedLobby, HandlerError> {
    let version = client.version;
    let episode = Episode::from_number(request.episode);

    let allowed_episode = match version {
        Version::DcNte | Version::DcV1 | Version::DcV2 | Version::PcNte | Version::PcV2 => {
            episode == Episode::Ep1
        }
        Version::GcNte | Version::GcV3 | Version::XbV3 => {
            matches!(episode, Episode::Ep1 | Episode::Ep2)
        }
        Version::GcEp3Nte | Version::GcEp3 => episode == Episode::Ep3,
        Version::BbV4 => matches!(episode, Episode::Ep1 | Episode::Ep2 | Episode::Ep4),
        Version::Patch => false,
    };
    if !allowed_episode {
        return Err(HandlerError::PreconditionFailed(format!(
            "Episode {} is not playable on your version",
            episode.number()
        )));
    }
    if request.difficulty > 3 {
        return Err(HandlerError::PreconditionFailed(
            "Invalid difficulty".into(),
        ));
    }

    let mode = if request.battle {
        GameMode::Battle
    } else if request.challenge {
        GameMode::Challenge
    } else if request.solo {
        GameMode::Solo
    } else {
        GameMode::Normal
    };

    let config = state.config_snapshot();
    let (seed_override, section_override, client_state_name) = {
        let cs = client.state.lock();
        (
            cs.config
                .check_flag(crate::state::client::client_flags::USE_OVERRIDE_RANDOM_SEED)
                .then_some(cs.config.override_random_seed),
            (cs.config.override_section_id != crate::state::client::NO_OVERRIDE_SECTION_ID)
                .then_some(cs.config.override_section_id),
            cs.name.clone(),
        )
    };
    let random_seed = seed_override.unwrap_or_else(rand::random);
    // Section id follows the character name unless overridden, like the
    // game itself derives it.
    let section_id =
        section_override.unwrap_or((fnv1a32(client_state_name.as_bytes()) % 10) as u8);

    let mut variations = [0u32; 0x20];
    {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(random_seed as u64);
        for v in variations.iter_mut() {
            *v = rng.gen_range(0..4);
        }
    }

    let map = MapState::generate(episode, request.difficulty, &variations);
    let drop_mode = config.game.drop_modes.default_for(version, mode);
    let item_creator = ItemCreator::new(
        random_seed,
        section_id,
        request.difficulty,
        state.common_items.read().get(version).clone(),
        state.rare_items.read().get(version).clone(),
    );

    let game = GameState {
        base_version: version,
        mode,
        episode,
        difficulty: request.difficulty,
        min_level: 0,
        max_level: crate::tables::MAX_LEVEL,
        password: request.password.clone(),
        random_seed,
        section_id,
        variations,
        drop_mode,
        exp_multiplier: config.game.exp_multiplier,
        floor_items: FloorItemManager::new(),
        map,
        switch_flags: std::collections::HashSet::new(),
        item_creator: Some(item_creator),
        quest_name: None,
        challenge: (mode == GameMode::Challenge).then(|| crate::state::lobby::ChallengeParams {
            stage_number: 1,
            rank_thresholds: [
                crate::state::lobby::RankThreshold { seconds: 420, award_flags: 4 },
                crate::state::lobby::RankThreshold { seconds: 900, award_flags: 2 },
                crate::state::lobby::RankThreshold { seconds: 1800, award_flags: 1 },
            ],
        }),
        ep3: (episode == Episode::Ep3).then(|| crate::ep3::BattleState::new(random_seed)),
    };

    let lobby_id = state.allocate_lobby_id();
    let lobby = Arc::new(Lobby::new_game(
        lobby_id,
        request.name.clone(),
        version,
        game,
    ));
    state.lobbies.insert(lobby_id, lobby.clone());
    Ok(lobby)
}

// ---------------------------------------------------------------------------
// Quests
// ---------------------------------------------------------------------------

/// 0xA2: quest categories menu.
struct QuestListHandler;

#[async_trait]
impl Handler for QuestListHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        let quests = ctx.state.quests.read().clone();
        let entries: Vec<MenuEntry> = quests
            .categories()
            .enumerate()
            .map(|(index, category)| MenuEntry {
                menu_id: menu_ids::QUEST_CATEGORIES,
                item_id: index as u32,
                flags: 0,
                text: category.to_string(),
            })
            .collect();
        if entries.is_empty() {
            return Err(HandlerError::PreconditionFailed(
                "No quests are available".into(),
            ));
        }
        let flag = entries.len().saturating_sub(1) as u32;
        let payload = ragol_proto::command::encode_menu(ctx.client.version, &entries);
        ctx.reply(cmd::QUEST_LIST_REQUEST, flag, &payload).await
    }
}

/// Quests within a category, answered to a category selection. The quest
/// menu id encodes the category index in its high byte.
async fn send_quest_menu(ctx: &mut Context<'_>, category_index: usize) -> HandlerResult {
    let quests = ctx.state.quests.read().clone();
    let Some(category) = quests.categories().nth(category_index) else {
        return Err(HandlerError::PreconditionFailed("Unknown category".into()));
    };
    let entries: Vec<MenuEntry> = quests
        .quests_in(category)
        .iter()
        .enumerate()
        .filter(|(_, quest)| quest.files_for(ctx.client.version).is_some())
        .map(|(index, quest)| MenuEntry {
            menu_id: menu_ids::QUESTS | ((category_index as u32) << 8),
            item_id: index as u32,
            flags: 0,
            text: quest.name.clone(),
        })
        .collect();
    if entries.is_empty() {
        return Err(HandlerError::PreconditionFailed(
            "No quests in that category for your version".into(),
        ));
    }
    let flag = entries.len().saturating_sub(1) as u32;
    let payload = ragol_proto::command::encode_menu(ctx.client.version, &entries);
    ctx.reply(cmd::QUEST_LIST_REQUEST, flag, &payload).await
}

async fn start_selected_quest(
    ctx: &mut Context<'_>,
    category_index: usize,
    quest_index: usize,
) -> HandlerResult {
    let lobby = super::checks::check_is_game(ctx.state, ctx.client)?;
    super::checks::check_is_leader(&lobby, ctx.client)?;

    let quests = ctx.state.quests.read().clone();
    let Some(category) = quests.categories().nth(category_index) else {
        return Err(HandlerError::PreconditionFailed("Unknown category".into()));
    };
    let Some(quest) = quests.quests_in(category).get(quest_index).cloned() else {
        return Err(HandlerError::PreconditionFailed("Unknown quest".into()));
    };
    set_lobby_quest(ctx, &lobby, &quest).await
}

/// Install a quest on a game and stream its files to every member.
pub async fn set_lobby_quest(
    ctx: &mut Context<'_>,
    lobby: &SharedLobby,
    quest: &Arc<crate::quests::Quest>,
) -> HandlerResult {
    let members = {
        let mut inner = lobby.write();
        if inner.check_flag(lobby_flags::QUEST_IN_PROGRESS)
            || inner.check_flag(lobby_flags::JOINABLE_QUEST_IN_PROGRESS)
        {
            return Err(LobbyError::QuestInProgress.into());
        }
        inner.flags |= if quest.joinable {
            lobby_flags::JOINABLE_QUEST_IN_PROGRESS
        } else {
            lobby_flags::QUEST_IN_PROGRESS
        };
        if let Some(game) = inner.game.as_mut() {
            game.quest_name = Some(quest.name.clone());
        }
        inner.client_ids()
    };
    info!(quest = %quest.name, lobby = lobby.lobby_id, "Quest started");

    for (_slot, member_id) in members {
        let Some(member) = ctx.state.find_client(member_id) else {
            continue;
        };
        let Some(files) = quest.files_for(member.version) else {
            continue;
        };
        for (kind, data) in [("bin", &files.bin), ("dat", &files.dat)] {
            let file_name = format!("{}.{}", quest.name, kind);
            let mut open = Vec::with_capacity(0x24);
            let mut name_field = file_name.clone().into_bytes();
            name_field.resize(0x20, 0);
            open.extend_from_slice(&name_field);
            open.extend_from_slice(&(data.len() as u32).to_le_bytes());
            if member.id == ctx.client.id {
                ctx.reply(cmd::OPEN_QUEST_FILE, 0, &open).await?;
            } else {
                member
                    .send(cmd::OPEN_QUEST_FILE, 0, Bytes::from(open))
                    .await;
            }
            for (index, chunk) in data.chunks(0x400).enumerate() {
                let mut payload = name_field.clone();
                payload.extend_from_slice(chunk);
                if member.id == ctx.client.id {
                    ctx.reply(cmd::WRITE_QUEST_FILE, index as u32, &payload).await?;
                } else {
                    member
                        .send(cmd::WRITE_QUEST_FILE, index as u32, Bytes::from(payload))
                        .await;
                }
            }
        }
    }
    Ok(())
}

/// 0xAC: quest-start barrier; re-broadcast when everyone is ready. The
/// client blocks until it sees the echo.
struct QuestBarrierHandler;

#[async_trait]
impl Handler for QuestBarrierHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        let lobby_id = ctx.client.state.lock().lobby_id;
        let Some(lobby) = lobby_id.and_then(|id| ctx.state.find_lobby(id)) else {
            return Ok(());
        };
        ctx.reply(cmd::QUEST_BARRIER, 0, &[]).await?;
        broadcast_to_lobby(
            ctx.state,
            &lobby,
            Some(ctx.client.id),
            cmd::QUEST_BARRIER,
            0,
            Bytes::new(),
        )
        .await;
        Ok(())
    }
}

/// 0x81: simple mail, routed to the target Guild Card number wherever it
/// is connected.
struct SimpleMailHandler;

#[async_trait]
impl Handler for SimpleMailHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        if frame.payload.len() < 12 {
            return Err(HandlerError::Runtime("mail payload too short".into()));
        }
        let to_guild_card = u32::from_le_bytes([
            frame.payload[8],
            frame.payload[9],
            frame.payload[10],
            frame.payload[11],
        ]);
        match ctx.state.find_client_by_guild_card(to_guild_card) {
            Some(target) => {
                target
                    .send(cmd::SIMPLE_MAIL, 0, frame.payload.clone())
                    .await;
                Ok(())
            }
            None => {
                ctx.reply_chat("That player is not online").await
            }
        }
    }
}
