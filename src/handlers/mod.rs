//! Command dispatch.
//!
//! Dispatch is a two-level switch: the top-level command number selects a
//! handler from the behavior's registry; commands 0x60/0x62/0x6C/0x6D
//! dispatch again on the sub-command number inside the payload (see
//! [`game`]). Chat lines starting with `$` take a third path through the
//! chat-command table in [`chat`].
//!
//! Handlers reply on the originating connection through
//! [`Context::reply`]; traffic to other clients goes through their
//! outbound queues in slot order, so each recipient observes a
//! deterministic ordering.

pub mod chat;
pub mod game;
pub mod lobby;
pub mod login;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use ragol_proto::command::{cmd, encode_menu, encode_text, MenuEntry};
use ragol_proto::{Frame, SendHalf};

use crate::config::Behavior;
use crate::error::{HandlerError, HandlerResult};
use crate::state::client::Client;
use crate::state::lobby::SharedLobby;
use crate::state::ServerState;

/// Handler context for one inbound frame.
pub struct Context<'a> {
    pub state: &'a Arc<ServerState>,
    pub client: &'a Arc<Client>,
    /// Direct writer to the originating socket. Replies bypass the client's
    /// queue so a handler can never deadlock against its own connection.
    pub send: &'a mut SendHalf,
}

impl Context<'_> {
    pub async fn reply(&mut self, command: u16, flag: u32, payload: &[u8]) -> HandlerResult {
        self.send.send(command, flag, payload).await?;
        Ok(())
    }

    /// A server-originated chat line (Guild Card number 0).
    pub async fn reply_chat(&mut self, text: &str) -> HandlerResult {
        let payload = chat_payload(self.client, 0, text);
        self.reply(cmd::CHAT, 0, &payload).await
    }

    /// A modal message box.
    pub async fn reply_message_box(&mut self, text: &str) -> HandlerResult {
        self.reply(cmd::MESSAGE_BOX, 0, &encode_text(self.client.version, text))
            .await
    }

    /// A 0x07 menu; the flag carries the entry count minus one.
    pub async fn reply_menu(&mut self, entries: &[MenuEntry]) -> HandlerResult {
        let flag = entries.len().saturating_sub(1) as u32;
        let payload = encode_menu(self.client.version, entries);
        self.reply(cmd::MENU, flag, &payload).await
    }
}

/// Build a 0x06 chat payload: sender tag, Guild Card number, then text in
/// the version's encoding.
pub fn chat_payload(client: &Client, guild_card_number: u32, text: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12 + text.len() * 2);
    payload.extend_from_slice(&0x0001_0000u32.to_le_bytes());
    payload.extend_from_slice(&guild_card_number.to_le_bytes());
    payload.extend_from_slice(&encode_text(client.version, text));
    payload
}

/// Trait implemented by all command handlers.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult;
}

/// Registry of command handlers for one listener behavior.
pub struct Registry {
    behavior: Behavior,
    handlers: HashMap<u16, Box<dyn Handler>>,
}

impl Registry {
    /// Build the handler table for a behavior.
    pub fn for_behavior(behavior: Behavior) -> Arc<Registry> {
        let mut handlers: HashMap<u16, Box<dyn Handler>> = HashMap::new();

        // Commands live on every game-protocol behavior.
        handlers.insert(cmd::PING, Box::new(PingHandler));
        handlers.insert(cmd::DISCONNECT, Box::new(DisconnectHandler));

        match behavior {
            Behavior::LoginServer => {
                login::register_login_handlers(&mut handlers);
            }
            Behavior::DataServerBb => {
                login::register_data_server_handlers(&mut handlers);
            }
            Behavior::LobbyServer => {
                login::register_login_handlers(&mut handlers);
                lobby::register_lobby_handlers(&mut handlers);
                game::register_game_handlers(&mut handlers);
            }
            // Patch and proxy ports never reach registry dispatch; their
            // session loops own the connection.
            Behavior::PatchServer | Behavior::ProxyServer => {}
        }

        Arc::new(Registry { behavior, handlers })
    }

    pub async fn dispatch(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        debug!(
            command = format_args!("{:#04x}", frame.command),
            flag = frame.flag,
            size = frame.payload.len(),
            behavior = ?self.behavior,
            "Dispatch"
        );
        match self.handlers.get(&frame.command) {
            Some(handler) => handler.handle(ctx, frame).await,
            None => Err(HandlerError::UnknownCommand {
                command: frame.command,
                version: ctx.client.version,
            }),
        }
    }
}

/// Translate a dispatch error into the client-visible outcome. Returns
/// whether the connection survives.
pub async fn absorb_dispatch_error(
    send: &mut SendHalf,
    client: &Arc<Client>,
    frame: &Frame,
    error: HandlerError,
    catch_handler_exceptions: bool,
) -> bool {
    match &error {
        HandlerError::UnknownCommand { command, version } => {
            warn!(
                command = format_args!("{command:#04x}"),
                %version,
                "Unknown command"
            );
            true
        }
        HandlerError::PreconditionFailed(message) => {
            // Chat-back to the offender in the warning color.
            let text = format!("$C6{message}");
            let payload = chat_payload(client, 0, &text);
            send.send(cmd::CHAT, 0, &payload).await.is_ok()
        }
        _ if error.is_fatal() => {
            warn!(error = %error, code = error.error_code(), "Fatal handler error");
            false
        }
        _ => {
            warn!(
                command = format_args!("{:#04x}", frame.command),
                error = %error,
                code = error.error_code(),
                "Handler error"
            );
            catch_handler_exceptions
        }
    }
}

/// 0x1D: the client answering our ping (or pinging us). Receipt alone
/// resets the idle timer; nothing else to do.
struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, _ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        Ok(())
    }
}

/// 0x05: the client announcing it is about to close the connection.
struct DisconnectHandler;

#[async_trait]
impl Handler for DisconnectHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        ctx.client.request_disconnect();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lobby traffic helpers
// ---------------------------------------------------------------------------

/// Send a command to every member of a lobby, in slot order. `exclude`
/// skips one client id (usually the originator, who gets a direct reply).
pub async fn broadcast_to_lobby(
    state: &Arc<ServerState>,
    lobby: &SharedLobby,
    exclude: Option<u64>,
    command: u16,
    flag: u32,
    payload: Bytes,
) {
    let members = lobby.read().client_ids();
    for (_slot, client_id) in members {
        if Some(client_id) == exclude {
            continue;
        }
        if let Some(client) = state.find_client(client_id) {
            client.send(command, flag, payload.clone()).await;
        }
    }
}

/// Emit the player-left notification for a vacated slot.
pub async fn notify_player_left(
    state: &Arc<ServerState>,
    lobby: &SharedLobby,
    vacated_slot: u8,
    leader_slot: u8,
) {
    let (is_game, members) = {
        let inner = lobby.read();
        (inner.is_game(), inner.client_ids())
    };
    let command = if is_game {
        cmd::REMOVE_GAME_PLAYER
    } else {
        cmd::REMOVE_LOBBY_PLAYER
    };
    let payload = Bytes::from(
        ragol_proto::command::PlayerLeave {
            client_id: vacated_slot,
            leader_id: leader_slot,
        }
        .encode()
        .to_vec(),
    );
    for (_slot, client_id) in members {
        if let Some(client) = state.find_client(client_id) {
            client
                .send(command, vacated_slot as u32, payload.clone())
                .await;
        }
    }
}

/// Full departure path used by disconnect cleanup and lobby moves.
pub async fn handle_client_departure(state: &Arc<ServerState>, client: &Arc<Client>) {
    if let Some((lobby, slot, leader)) = state.leave_current_lobby(client) {
        notify_player_left(state, &lobby, slot, leader).await;
    }
}

/// Precondition helpers for chat commands and privileged handlers.
pub mod checks {
    use super::*;
    use crate::state::lobby::lobby_flags;

    pub fn check_privileges(client: &Client, required_flags: u32) -> HandlerResult {
        let has = client
            .state
            .lock()
            .login
            .as_ref()
            .map(|login| login.account.read().flags)
            .unwrap_or(0);
        if (has & required_flags) == required_flags {
            Ok(())
        } else {
            Err(HandlerError::PreconditionFailed(
                "You do not have permission to do that".into(),
            ))
        }
    }

    pub fn check_is_game(state: &ServerState, client: &Client) -> Result<SharedLobby, HandlerError> {
        let lobby_id = client
            .state
            .lock()
            .lobby_id
            .ok_or_else(|| HandlerError::PreconditionFailed("You are not in a game".into()))?;
        let lobby = state
            .find_lobby(lobby_id)
            .ok_or_else(|| HandlerError::PreconditionFailed("You are not in a game".into()))?;
        if lobby.read().is_game() {
            Ok(lobby)
        } else {
            Err(HandlerError::PreconditionFailed(
                "This command can only be used in a game".into(),
            ))
        }
    }

    pub fn check_is_leader(lobby: &SharedLobby, client: &Client) -> HandlerResult {
        let inner = lobby.read();
        if inner.slot_of(client.id) == Some(inner.leader_slot) {
            Ok(())
        } else {
            Err(HandlerError::PreconditionFailed(
                "Only the game leader can do that".into(),
            ))
        }
    }

    pub fn check_cheats_enabled(lobby: &SharedLobby, client: &Client) -> HandlerResult {
        if lobby.read().check_flag(lobby_flags::CHEATS_ENABLED) {
            return Ok(());
        }
        // CHEAT_ANYWHERE accounts bypass the per-game gate.
        let anywhere = client
            .state
            .lock()
            .login
            .as_ref()
            .is_some_and(|l| l.account.read().check_flag(crate::account::flags::CHEAT_ANYWHERE));
        if anywhere {
            Ok(())
        } else {
            Err(HandlerError::PreconditionFailed(
                "Cheats are not enabled in this game".into(),
            ))
        }
    }

    pub fn check_version(client: &Client, allowed: &[ragol_proto::Version]) -> HandlerResult {
        if allowed.contains(&client.version) {
            Ok(())
        } else {
            Err(HandlerError::PreconditionFailed(
                "Your client version cannot use this command".into(),
            ))
        }
    }
}
