//! Chat commands: user-typed lines beginning with `$`.
//!
//! A parallel dispatch surface with per-command preconditions. A failed
//! precondition surfaces as a colored chat line back to the sender only;
//! nothing here ever affects another client's connection.

use bytes::Bytes;
use tracing::info;

use super::checks;
use super::{broadcast_to_lobby, chat_payload, Context};
use crate::account::flags as account_flags;
use crate::error::{HandlerError, HandlerResult};
use crate::state::client::client_flags;
use crate::state::items::{ItemData, ItemSource, VISIBLE_TO_ALL};
use crate::state::lobby::{lobby_flags, DropMode};
use crate::tables::describe_item;

/// Dispatch one chat-command line (without the leading `$`).
pub async fn dispatch_chat_command(ctx: &mut Context<'_>, line: &str) -> HandlerResult {
    let (name, args) = match line.split_once(' ') {
        Some((name, args)) => (name, args.trim()),
        None => (line, ""),
    };
    match name {
        "what" => command_what(ctx).await,
        "cheats" => command_cheats(ctx).await,
        "swa" => command_switch_assist(ctx).await,
        "infhp" => command_toggle_flag(ctx, client_flags::INFINITE_HP_ENABLED, "Infinite HP").await,
        "inftp" => command_toggle_flag(ctx, client_flags::INFINITE_TP_ENABLED, "Infinite TP").await,
        "item" => command_item(ctx, args).await,
        "event" => command_event(ctx, args).await,
        "ann" => command_announce(ctx, args).await,
        "kick" => command_kick(ctx, args, false).await,
        "ban" => command_kick(ctx, args, true).await,
        "exp" => command_exp(ctx).await,
        "seed" => command_seed(ctx).await,
        "dropmode" => command_dropmode(ctx, args).await,
        "autoreply" => command_autoreply(ctx, args).await,
        _ => Err(HandlerError::PreconditionFailed(format!(
            "Unknown command: ${name}"
        ))),
    }
}

/// `$what`: describe the nearest floor item.
async fn command_what(ctx: &mut Context<'_>) -> HandlerResult {
    let lobby = checks::check_is_game(ctx.state, ctx.client)?;
    let (floor, x, z) = {
        let state = ctx.client.state.lock();
        (state.floor, state.x, state.z)
    };
    let description = {
        let inner = lobby.read();
        inner.game.as_ref().and_then(|game| {
            game.floor_items
                .find_nearest(floor, x, z)
                .map(|item| {
                    let dx = item.x - x;
                    let dz = item.z - z;
                    let distance = (dx * dx + dz * dz).sqrt();
                    format!("{} ({distance:.0} units away)", describe_item(&item.item))
                })
        })
    };
    match description {
        Some(text) => ctx.reply_chat(&text).await,
        None => ctx.reply_chat("No items nearby").await,
    }
}

/// `$cheats`: toggle the game's cheat gate. Leader only, and the server
/// must allow cheats at all.
async fn command_cheats(ctx: &mut Context<'_>) -> HandlerResult {
    let lobby = checks::check_is_game(ctx.state, ctx.client)?;
    checks::check_is_leader(&lobby, ctx.client)?;
    if !ctx.state.config_snapshot().game.cheats_allowed {
        checks::check_privileges(ctx.client, account_flags::CHEAT_ANYWHERE)?;
    }
    let enabled = {
        let mut inner = lobby.write();
        inner.flags ^= lobby_flags::CHEATS_ENABLED;
        inner.check_flag(lobby_flags::CHEATS_ENABLED)
    };
    let text = if enabled {
        "Cheats are now ON"
    } else {
        "Cheats are now OFF"
    };
    ctx.reply_chat(text).await?;
    let payload = chat_payload(ctx.client, 0, text);
    broadcast_to_lobby(
        ctx.state,
        &lobby,
        Some(ctx.client.id),
        ragol_proto::command::cmd::CHAT,
        0,
        Bytes::from(payload),
    )
    .await;
    Ok(())
}

/// `$swa`: toggle switch assist.
async fn command_switch_assist(ctx: &mut Context<'_>) -> HandlerResult {
    let lobby = checks::check_is_game(ctx.state, ctx.client)?;
    checks::check_cheats_enabled(&lobby, ctx.client)?;
    let enabled = {
        let mut state = ctx.client.state.lock();
        if state.config.check_flag(client_flags::SWITCH_ASSIST_ENABLED) {
            state.config.clear_flag(client_flags::SWITCH_ASSIST_ENABLED);
            false
        } else {
            state.config.set_flag(client_flags::SWITCH_ASSIST_ENABLED);
            true
        }
    };
    ctx.reply_chat(if enabled {
        "Switch assist enabled"
    } else {
        "Switch assist disabled"
    })
    .await
}

async fn command_toggle_flag(ctx: &mut Context<'_>, flag: u64, label: &str) -> HandlerResult {
    let lobby = checks::check_is_game(ctx.state, ctx.client)?;
    checks::check_cheats_enabled(&lobby, ctx.client)?;
    let enabled = {
        let mut state = ctx.client.state.lock();
        if state.config.check_flag(flag) {
            state.config.clear_flag(flag);
            false
        } else {
            state.config.set_flag(flag);
            true
        }
    };
    ctx.reply_chat(&format!(
        "{label} {}",
        if enabled { "enabled" } else { "disabled" }
    ))
    .await
}

/// `$item <hex bytes>`: materialize an item at the player's feet.
async fn command_item(ctx: &mut Context<'_>, args: &str) -> HandlerResult {
    let lobby = checks::check_is_game(ctx.state, ctx.client)?;
    checks::check_cheats_enabled(&lobby, ctx.client)?;

    let hex: String = args.chars().filter(|c| !c.is_whitespace()).collect();
    if hex.is_empty() || hex.len() > 24 || hex.len() % 2 != 0 {
        return Err(HandlerError::PreconditionFailed(
            "Usage: $item <up to 12 hex bytes>".into(),
        ));
    }
    let mut data = [0u8; 12];
    for (index, pair) in hex.as_bytes().chunks(2).enumerate() {
        let text = std::str::from_utf8(pair).unwrap_or("");
        data[index] = u8::from_str_radix(text, 16).map_err(|_| {
            HandlerError::PreconditionFailed("Bad hex in item code".into())
        })?;
    }
    let item = ItemData(data);

    let (floor, x, z, slot) = {
        let state = ctx.client.state.lock();
        (state.floor, state.x, state.z, state.lobby_client_id)
    };
    let item_id = {
        let mut inner = lobby.write();
        let Some(game) = inner.game.as_mut() else {
            return Err(HandlerError::PreconditionFailed("Not in a game".into()));
        };
        game.floor_items
            .add(item, floor, x, z, VISIBLE_TO_ALL, ItemSource::Client(slot))
            .map_err(HandlerError::from)?
    };
    info!(item_id, "Cheat item created");
    ctx.reply_chat(&format!("Created {}", describe_item(&item))).await
}

/// `$event <n>`: change the lobby decoration event.
async fn command_event(ctx: &mut Context<'_>, args: &str) -> HandlerResult {
    checks::check_privileges(ctx.client, account_flags::CHANGE_EVENT)?;
    let event: u8 = args
        .parse()
        .map_err(|_| HandlerError::PreconditionFailed("Usage: $event <number>".into()))?;
    let lobby_id = ctx.client.state.lock().lobby_id;
    let Some(lobby) = lobby_id.and_then(|id| ctx.state.find_lobby(id)) else {
        return Err(HandlerError::PreconditionFailed("Not in a lobby".into()));
    };
    lobby.write().event = event;
    ctx.reply_chat(&format!("Lobby event set to {event}")).await
}

/// `$ann <text>`: announce to every connected client.
async fn command_announce(ctx: &mut Context<'_>, args: &str) -> HandlerResult {
    checks::check_privileges(ctx.client, account_flags::ANNOUNCE)?;
    if args.is_empty() {
        return Err(HandlerError::PreconditionFailed("Usage: $ann <text>".into()));
    }
    let clients: Vec<_> = ctx
        .state
        .clients
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    for client in clients {
        let payload = chat_payload(&client, 0, args);
        if client.id == ctx.client.id {
            ctx.reply(ragol_proto::command::cmd::CHAT, 0, &payload).await?;
        } else {
            client
                .send(ragol_proto::command::cmd::CHAT, 0, Bytes::from(payload))
                .await;
        }
    }
    info!(text = args, "Announcement");
    Ok(())
}

/// `$kick <name>` / `$ban <name> <hours>`.
async fn command_kick(ctx: &mut Context<'_>, args: &str, ban: bool) -> HandlerResult {
    checks::check_privileges(
        ctx.client,
        if ban {
            account_flags::BAN_USER
        } else {
            account_flags::KICK_USER
        },
    )?;
    let (target_name, hours) = match args.split_once(' ') {
        Some((name, rest)) => (name, rest.trim().parse::<u64>().unwrap_or(24)),
        None => (args, 24),
    };
    if target_name.is_empty() {
        return Err(HandlerError::PreconditionFailed(
            "Usage: $kick/<$ban> <player name>".into(),
        ));
    }
    let target = ctx
        .state
        .clients
        .iter()
        .map(|entry| entry.value().clone())
        .find(|client| client.state.lock().name.eq_ignore_ascii_case(target_name));
    let Some(target) = target else {
        return Err(HandlerError::PreconditionFailed(format!(
            "No player named {target_name:?} is online"
        )));
    };

    if ban {
        if let Some(login) = target.state.lock().login.clone() {
            let until = chrono::Utc::now().timestamp().max(0) as u64 + hours * 3600;
            login.account.write().ban_end_time = until;
            ctx.state.accounts.save(&login.account.read());
        }
    }
    target.request_disconnect();
    info!(target = target_name, ban, "Moderation action");
    ctx.reply_chat(&format!(
        "{} {target_name}",
        if ban { "Banned" } else { "Kicked" }
    ))
    .await
}

/// `$exp`: show accumulated experience.
async fn command_exp(ctx: &mut Context<'_>) -> HandlerResult {
    let (level, exp) = {
        let state = ctx.client.state.lock();
        (state.level, state.exp)
    };
    ctx.reply_chat(&format!("Level {level}, {exp} EXP")).await
}

/// `$seed`: show the game's random seed (useful for replays).
async fn command_seed(ctx: &mut Context<'_>) -> HandlerResult {
    let lobby = checks::check_is_game(ctx.state, ctx.client)?;
    let seed = lobby.read().game.as_ref().map(|g| g.random_seed);
    match seed {
        Some(seed) => ctx.reply_chat(&format!("Seed: {seed:08X}")).await,
        None => Err(HandlerError::PreconditionFailed("Not in a game".into())),
    }
}

/// `$dropmode [mode]`: show or change the drop mode. Changing requires
/// the leader and the configured allow-list.
async fn command_dropmode(ctx: &mut Context<'_>, args: &str) -> HandlerResult {
    let lobby = checks::check_is_game(ctx.state, ctx.client)?;
    if args.is_empty() {
        let mode = lobby.read().game.as_ref().map(|g| g.drop_mode);
        return match mode {
            Some(mode) => ctx.reply_chat(&format!("Drop mode: {}", mode.name())).await,
            None => Err(HandlerError::PreconditionFailed("Not in a game".into())),
        };
    }
    checks::check_is_leader(&lobby, ctx.client)?;
    let Some(mode) = DropMode::from_name(args) else {
        return Err(HandlerError::PreconditionFailed(format!(
            "Unknown drop mode {args:?}"
        )));
    };
    let allowed = ctx
        .state
        .config_snapshot()
        .game
        .allowed_drop_modes
        .iter()
        .any(|name| name == args);
    if !allowed {
        return Err(HandlerError::PreconditionFailed(format!(
            "Drop mode {args:?} is not allowed on this server"
        )));
    }
    {
        let mut inner = lobby.write();
        if let Some(game) = inner.game.as_mut() {
            game.drop_mode = mode;
        }
    }
    ctx.reply_chat(&format!("Drop mode set to {}", mode.name())).await
}

/// `$autoreply <text>`: store an auto-reply on the account; empty clears.
async fn command_autoreply(ctx: &mut Context<'_>, args: &str) -> HandlerResult {
    let Some(login) = ctx.client.state.lock().login.clone() else {
        return Err(HandlerError::PreconditionFailed("Log in first".into()));
    };
    login.account.write().auto_reply_message = args.to_string();
    ctx.state.accounts.save(&login.account.read());
    ctx.reply_chat(if args.is_empty() {
        "Auto reply cleared"
    } else {
        "Auto reply set"
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_parse() {
        // The split logic: name only, and name with arguments.
        let line = "dropmode server-shared";
        let (name, args) = line.split_once(' ').unwrap();
        assert_eq!(name, "dropmode");
        assert_eq!(args, "server-shared");
    }

    #[test]
    fn item_hex_rules() {
        // 12 bytes max, even digit count.
        let ok = "0400000000000000E8030000";
        assert_eq!(ok.len(), 24);
        let mut data = [0u8; 12];
        for (i, pair) in ok.as_bytes().chunks(2).enumerate() {
            data[i] = u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16).unwrap();
        }
        let item = ItemData(data);
        assert!(item.is_meseta());
        assert_eq!(item.meseta_amount(), 1000);
    }

    #[test]
    fn version_check_helper() {
        // A sanity anchor for the chat-command version gate.
        assert!(ragol_proto::Version::GcEp3.is_ep3());
    }
}
