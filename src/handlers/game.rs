//! In-game sub-command dispatch.
//!
//! Commands 0x60 (broadcast), 0x62 (private to one slot), 0x6C (broadcast,
//! over-length), and 0x6D (private, over-length) carry nested sub-commands
//! dispatched on their first byte. Every sub-command passes shape
//! validation before any handler logic; private commands route by the
//! target slot in the frame's flag.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use ragol_proto::command::{cmd, subcmd, PayloadReader, SubcommandHeader};
use ragol_proto::{Frame, Version};

use super::{broadcast_to_lobby, Context, Handler};
use crate::error::{HandlerError, HandlerResult, ItemError};
use crate::state::client::client_flags;
use crate::state::items::{ItemData, ItemSource, VISIBLE_TO_ALL};
use crate::state::lobby::{DropMode, GameMode, SharedLobby};

pub fn register_game_handlers(handlers: &mut HashMap<u16, Box<dyn Handler>>) {
    handlers.insert(cmd::GAME_COMMAND, Box::new(GameCommandHandler { private: false }));
    handlers.insert(cmd::GAME_COMMAND_BIG, Box::new(GameCommandHandler { private: false }));
    handlers.insert(cmd::GAME_COMMAND_PRIVATE, Box::new(GameCommandHandler { private: true }));
    handlers.insert(
        cmd::GAME_COMMAND_PRIVATE_BIG,
        Box::new(GameCommandHandler { private: true }),
    );
    handlers.insert(cmd::EP3_SERVER_DATA, Box::new(Ep3ServerDataHandler));
}

/// Minimum payload length per sub-command (header included). Commands not
/// listed are forwarded without interpretation.
fn minimum_size(subcommand: u8) -> Option<usize> {
    match subcommand {
        subcmd::SWITCH_TOGGLE => Some(8),
        subcmd::HIT_ENEMY => Some(8),
        subcmd::CHANGE_FLOOR_1 | subcmd::CHANGE_FLOOR_2 | subcmd::CHANGE_FLOOR_3 => Some(8),
        subcmd::STOP_MOVING | subcmd::WALK | subcmd::RUN => Some(12),
        subcmd::SET_POSITION => Some(16),
        subcmd::PICK_UP_ITEM_REQUEST | subcmd::PICK_UP_ITEM => Some(12),
        subcmd::CREATE_FLOOR_ITEM => Some(32),
        subcmd::ENEMY_DROP_ITEM_REQUEST | subcmd::BOX_DROP_ITEM_REQUEST => Some(16),
        subcmd::ENEMY_KILLED => Some(4),
        subcmd::GIVE_EXPERIENCE => Some(8),
        subcmd::EP3_BATTLE => Some(8),
        _ => None,
    }
}

fn validate_shape(subcommand: u8, len: usize) -> HandlerResult {
    if let Some(minimum) = minimum_size(subcommand) {
        if len < minimum {
            return Err(HandlerError::Malformed(
                ragol_proto::ParseError::Truncated {
                    wanted: minimum,
                    offset: 0,
                    len,
                },
            ));
        }
    }
    Ok(())
}

struct GameCommandHandler {
    private: bool,
}

#[async_trait]
impl Handler for GameCommandHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let header = SubcommandHeader::parse(&frame.payload)?;
        validate_shape(header.subcommand, frame.payload.len())?;

        let lobby_id = ctx.client.state.lock().lobby_id;
        let Some(lobby) = lobby_id.and_then(|id| ctx.state.find_lobby(id)) else {
            return Ok(());
        };

        if self.private {
            return forward_private(ctx, &lobby, frame).await;
        }

        match header.subcommand {
            subcmd::WALK | subcmd::RUN | subcmd::STOP_MOVING => {
                let mut r = PayloadReader::new(&frame.payload[4..]);
                let x = r.get_f32()?;
                let z = r.get_f32()?;
                {
                    let mut state = ctx.client.state.lock();
                    state.x = x;
                    state.z = z;
                }
                forward_broadcast(ctx, &lobby, frame).await
            }
            subcmd::SET_POSITION => {
                let mut r = PayloadReader::new(&frame.payload[4..]);
                let x = r.get_f32()?;
                let _y = r.get_f32()?;
                let z = r.get_f32()?;
                {
                    let mut state = ctx.client.state.lock();
                    state.x = x;
                    state.z = z;
                }
                forward_broadcast(ctx, &lobby, frame).await
            }
            subcmd::CHANGE_FLOOR_1 | subcmd::CHANGE_FLOOR_2 | subcmd::CHANGE_FLOOR_3 => {
                let mut r = PayloadReader::new(&frame.payload[4..]);
                let floor = r.get_u32()? as u8;
                let old_floor = {
                    let mut state = ctx.client.state.lock();
                    let old = state.floor;
                    state.floor = floor;
                    old
                };
                // Challenge mode clears the abandoned floor on warp.
                {
                    let mut inner = lobby.write();
                    if let Some(game) = inner.game.as_mut() {
                        if game.mode == GameMode::Challenge && old_floor != floor {
                            game.floor_items.clear(old_floor);
                        }
                    }
                }
                forward_broadcast(ctx, &lobby, frame).await
            }
            subcmd::SWITCH_TOGGLE => handle_switch(ctx, &lobby, frame).await,
            subcmd::HIT_ENEMY => {
                {
                    let slot = ctx.client.state.lock().lobby_client_id;
                    let mut inner = lobby.write();
                    if let Some(game) = inner.game.as_mut() {
                        if let Some(enemy) = game.map.enemy_mut(header.param) {
                            enemy.record_hit(slot);
                        }
                    }
                }
                forward_broadcast(ctx, &lobby, frame).await
            }
            subcmd::ENEMY_KILLED => handle_enemy_killed(ctx, &lobby, frame, header.param).await,
            subcmd::ENEMY_DROP_ITEM_REQUEST | subcmd::BOX_DROP_ITEM_REQUEST => {
                handle_drop_request(ctx, &lobby, frame, header.subcommand).await
            }
            subcmd::CREATE_FLOOR_ITEM => handle_leader_drop(ctx, &lobby, frame).await,
            subcmd::PICK_UP_ITEM_REQUEST => handle_pickup(ctx, &lobby, frame).await,
            _ => forward_broadcast(ctx, &lobby, frame).await,
        }
    }
}

/// Forward a broadcast sub-command to everyone else in the lobby.
async fn forward_broadcast(
    ctx: &mut Context<'_>,
    lobby: &SharedLobby,
    frame: &Frame,
) -> HandlerResult {
    broadcast_to_lobby(
        ctx.state,
        lobby,
        Some(ctx.client.id),
        frame.command,
        frame.flag,
        frame.payload.clone(),
    )
    .await;
    Ok(())
}

/// 0x62/0x6D: deliver to the slot named in the flag.
async fn forward_private(
    ctx: &mut Context<'_>,
    lobby: &SharedLobby,
    frame: &Frame,
) -> HandlerResult {
    let target_slot = (frame.flag & 0xFF) as u8;
    let target_id = {
        let inner = lobby.read();
        inner.slots.get(target_slot as usize).copied().flatten()
    };
    let Some(target_id) = target_id else {
        debug!(slot = target_slot, "Private command to empty slot");
        return Ok(());
    };
    if let Some(target) = ctx.state.find_client(target_id) {
        // Private traffic arrives as 0x62 regardless of which private
        // command number carried it in.
        let command = if frame.command == cmd::GAME_COMMAND_PRIVATE_BIG {
            cmd::GAME_COMMAND_PRIVATE_BIG
        } else {
            cmd::GAME_COMMAND_PRIVATE
        };
        target.send(command, frame.flag, frame.payload.clone()).await;
    }
    Ok(())
}

/// Switch handling, including the switch-assist replay: a momentary step
/// replays the player's previous switch-enabled command so two-player
/// doors open solo.
async fn handle_switch(ctx: &mut Context<'_>, lobby: &SharedLobby, frame: &Frame) -> HandlerResult {
    let mut r = PayloadReader::new(&frame.payload[4..]);
    let switch_id = r.get_u16()?;
    let floor = r.get_u8()?;
    let flags = r.get_u8()?;
    let enabled = (flags & 1) != 0;

    if enabled {
        {
            let mut inner = lobby.write();
            if let Some(game) = inner.game.as_mut() {
                game.switch_flags.insert((floor, switch_id));
            }
        }
        ctx.client.state.lock().last_switch_enabled = Some(frame.payload.clone());
        return forward_broadcast(ctx, lobby, frame).await;
    }

    // Momentary step: maybe replay the remembered enable first.
    let assist = ctx
        .client
        .state
        .lock()
        .config
        .check_flag(client_flags::SWITCH_ASSIST_ENABLED);
    if assist {
        let remembered = ctx.client.state.lock().last_switch_enabled.clone();
        if let Some(prior) = remembered {
            debug!("Switch assist replay");
            // Everyone sees the replay, the stepping player included.
            ctx.reply(frame.command, frame.flag, &prior).await?;
            broadcast_to_lobby(
                ctx.state,
                lobby,
                Some(ctx.client.id),
                frame.command,
                frame.flag,
                prior,
            )
            .await;
        }
    }
    forward_broadcast(ctx, lobby, frame).await
}

/// Blue Burst kill accounting: first kill report wins, then EXP fans out
/// to everyone whose hit bit is set (77% for non-final hits).
async fn handle_enemy_killed(
    ctx: &mut Context<'_>,
    lobby: &SharedLobby,
    frame: &Frame,
    enemy_id: u16,
) -> HandlerResult {
    if ctx.client.version != Version::BbV4 {
        // The leader is authoritative elsewhere; just relay.
        return forward_broadcast(ctx, lobby, frame).await;
    }

    let award = {
        let mut inner = lobby.write();
        let Some(game) = inner.game.as_mut() else {
            return Ok(());
        };
        let multiplier = game.exp_multiplier;
        let Some(enemy) = game.map.enemy_mut(enemy_id) else {
            return Ok(());
        };
        if enemy.killed {
            None
        } else {
            enemy.killed = true;
            Some((enemy.exp, enemy.hit_mask, enemy.last_hit_by, multiplier))
        }
    };
    forward_broadcast(ctx, lobby, frame).await?;

    let Some((base_exp, hit_mask, last_hit_by, multiplier)) = award else {
        return Ok(());
    };
    let members = lobby.read().client_ids();
    let level_table = ctx.state.level_table.read().clone();
    for (slot, member_id) in members {
        if hit_mask & (1 << (slot as u16 % 16)) == 0 {
            continue;
        }
        let Some(member) = ctx.state.find_client(member_id) else {
            continue;
        };
        let share = if last_hit_by == Some(slot) { 100 } else { 77 };
        let amount = ((base_exp as u64 * share / 100) as f32 * multiplier) as u32;
        let leveled = {
            let mut state = member.state.lock();
            state.exp += amount as u64;
            let new_level = level_table.level_for_exp(state.exp);
            let leveled = new_level > state.level;
            if leveled {
                state.level = new_level;
            }
            leveled
        };
        let mut payload = BytesMut::with_capacity(8);
        payload.put_slice(
            &SubcommandHeader {
                subcommand: subcmd::GIVE_EXPERIENCE,
                size_units: 2,
                param: slot as u16,
            }
            .encode(),
        );
        payload.put_u32_le(amount);
        let payload = payload.freeze();
        if member.id == ctx.client.id {
            ctx.reply(cmd::GAME_COMMAND_PRIVATE, slot as u32, &payload).await?;
        } else {
            member
                .send(cmd::GAME_COMMAND_PRIVATE, slot as u32, payload)
                .await;
        }
        if leveled {
            debug!(member = member_id, "Level up");
        }
    }
    Ok(())
}

/// Build the 0x5F create-floor-item payload.
fn floor_item_payload(item: &ItemData, item_id: u32, floor: u8, x: f32, z: f32) -> Bytes {
    let mut out = BytesMut::with_capacity(32);
    out.put_slice(
        &SubcommandHeader {
            subcommand: subcmd::CREATE_FLOOR_ITEM,
            size_units: 7,
            param: 0,
        }
        .encode(),
    );
    out.put_slice(&item.0);
    out.put_u32_le(item_id);
    out.put_u8(floor);
    out.put_bytes(0, 3);
    out.put_u32_le(x.to_bits());
    out.put_u32_le(z.to_bits());
    out.freeze()
}

/// A drop request: `{header, floor u8, pad u8, entity u16, x f32, z f32}`.
struct DropRequest {
    floor: u8,
    entity_id: u16,
    x: f32,
    z: f32,
}

impl DropRequest {
    fn parse(payload: &[u8]) -> Result<DropRequest, HandlerError> {
        let mut r = PayloadReader::new(&payload[4..]);
        let floor = r.get_u8()?;
        let _pad = r.get_u8()?;
        let entity_id = r.get_u16()?;
        let x = r.get_f32()?;
        let z = r.get_f32()?;
        Ok(DropRequest {
            floor,
            entity_id,
            x,
            z,
        })
    }
}

/// Enemy and box drop requests, resolved per the game's drop mode.
async fn handle_drop_request(
    ctx: &mut Context<'_>,
    lobby: &SharedLobby,
    frame: &Frame,
    which: u8,
) -> HandlerResult {
    let request = DropRequest::parse(&frame.payload)?;
    let drop_mode = {
        let inner = lobby.read();
        inner.game.as_ref().map(|g| g.drop_mode)
    };
    let Some(drop_mode) = drop_mode else {
        return Ok(());
    };

    match drop_mode {
        DropMode::Disabled => Ok(()),
        DropMode::Client | DropMode::Intercept => {
            // The leader's client rolls the drop; requests only reach it.
            let leader_id = {
                let inner = lobby.read();
                let leader_slot = inner.leader_slot;
                inner.slots.get(leader_slot as usize).copied().flatten()
            };
            if let Some(leader_id) = leader_id {
                if leader_id != ctx.client.id {
                    if let Some(leader) = ctx.state.find_client(leader_id) {
                        leader
                            .send(frame.command, frame.flag, frame.payload.clone())
                            .await;
                    }
                }
            }
            Ok(())
        }
        DropMode::ServerShared => {
            let rolled = roll_drop(lobby, which, &request);
            let Some(item) = rolled else { return Ok(()) };
            let item_id = {
                let mut inner = lobby.write();
                let Some(game) = inner.game.as_mut() else {
                    return Ok(());
                };
                match game.floor_items.add(
                    item,
                    request.floor,
                    request.x,
                    request.z,
                    VISIBLE_TO_ALL,
                    ItemSource::Server,
                ) {
                    Ok(id) => id,
                    Err(ItemError::TooManyItems) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            };
            let payload = floor_item_payload(&item, item_id, request.floor, request.x, request.z);
            ctx.reply(cmd::GAME_COMMAND, 0, &payload).await?;
            broadcast_to_lobby(
                ctx.state,
                lobby,
                Some(ctx.client.id),
                cmd::GAME_COMMAND,
                0,
                payload,
            )
            .await;
            Ok(())
        }
        DropMode::ServerPrivate | DropMode::ServerDuplicate => {
            let members = lobby.read().client_ids();
            // DUPLICATE rolls once and stamps copies; PRIVATE rolls per
            // member so each sees an independent drop.
            let shared_roll = if drop_mode == DropMode::ServerDuplicate {
                roll_drop(lobby, which, &request)
            } else {
                None
            };
            for (slot, member_id) in members {
                let item = if drop_mode == DropMode::ServerDuplicate {
                    shared_roll
                } else {
                    roll_drop(lobby, which, &request)
                };
                let Some(item) = item else { continue };
                let item_id = {
                    let mut inner = lobby.write();
                    let Some(game) = inner.game.as_mut() else {
                        return Ok(());
                    };
                    match game.floor_items.add(
                        item,
                        request.floor,
                        request.x,
                        request.z,
                        1 << (slot as u16 % 16),
                        ItemSource::Server,
                    ) {
                        Ok(id) => id,
                        Err(_) => continue,
                    }
                };
                let payload =
                    floor_item_payload(&item, item_id, request.floor, request.x, request.z);
                if member_id == ctx.client.id {
                    ctx.reply(cmd::GAME_COMMAND_PRIVATE, slot as u32, &payload).await?;
                } else if let Some(member) = ctx.state.find_client(member_id) {
                    member
                        .send(cmd::GAME_COMMAND_PRIVATE, slot as u32, payload)
                        .await;
                }
            }
            Ok(())
        }
    }
}

fn roll_drop(
    lobby: &SharedLobby,
    which: u8,
    request: &DropRequest,
) -> Option<ItemData> {
    let mut inner = lobby.write();
    let game = inner.game.as_mut()?;
    let enemy_type = if which == subcmd::ENEMY_DROP_ITEM_REQUEST {
        game.map
            .enemies
            .get(request.entity_id as usize)
            .map(|e| e.enemy_type)?
    } else {
        0
    };
    let creator = game.item_creator.as_mut()?;
    if which == subcmd::ENEMY_DROP_ITEM_REQUEST {
        creator.enemy_drop(enemy_type)
    } else {
        creator.box_drop(request.floor)
    }
}

/// 0x5F from the game leader in client-authoritative mode: register and
/// relay the leader's drop.
async fn handle_leader_drop(
    ctx: &mut Context<'_>,
    lobby: &SharedLobby,
    frame: &Frame,
) -> HandlerResult {
    let mut r = PayloadReader::new(&frame.payload[4..]);
    let mut item = [0u8; 12];
    item.copy_from_slice(r.get_bytes(12)?);
    let item_id = r.get_u32()?;
    let floor = r.get_u8()?;
    r.skip(3)?;
    let x = r.get_f32()?;
    let z = r.get_f32()?;

    let leader_slot = {
        let inner = lobby.read();
        let slot = inner.slot_of(ctx.client.id);
        let is_leader = slot == Some(inner.leader_slot);
        let mode = inner.game.as_ref().map(|g| g.drop_mode);
        if mode != Some(DropMode::Client) || !is_leader {
            warn!(client = ctx.client.id, "Unsanctioned floor item create dropped");
            return Ok(());
        }
        inner.leader_slot
    };
    {
        let mut inner = lobby.write();
        if let Some(game) = inner.game.as_mut() {
            // Track under the leader's own id namespace; the leader picked
            // the id, so trust-but-record for pickup validation.
            let _ = game.floor_items.add(
                ItemData(item),
                floor,
                x,
                z,
                VISIBLE_TO_ALL,
                ItemSource::Client(leader_slot),
            );
            let _ = item_id;
        }
    }
    forward_broadcast(ctx, lobby, frame).await
}

/// 0x5A pick-up request: validate existence and visibility, then confirm
/// with 0x59 and destroy with 0x63.
async fn handle_pickup(ctx: &mut Context<'_>, lobby: &SharedLobby, frame: &Frame) -> HandlerResult {
    let mut r = PayloadReader::new(&frame.payload[4..]);
    let item_id = r.get_u32()?;
    let slot = ctx.client.state.lock().lobby_client_id;

    let removed = {
        let mut inner = lobby.write();
        let Some(game) = inner.game.as_mut() else {
            return Ok(());
        };
        let visible = game
            .floor_items
            .get(item_id)
            .map(|item| item.visibility_mask & (1 << (slot as u16 % 16)) != 0);
        match visible {
            Some(true) => game.floor_items.remove(item_id).ok(),
            Some(false) => {
                warn!(item_id, slot, "Pickup of invisible item refused");
                None
            }
            None => None,
        }
    };
    let Some(removed) = removed else {
        return Ok(());
    };

    let mut confirm = BytesMut::with_capacity(12);
    confirm.put_slice(
        &SubcommandHeader {
            subcommand: subcmd::PICK_UP_ITEM,
            size_units: 2,
            param: slot as u16,
        }
        .encode(),
    );
    confirm.put_u32_le(item_id);
    let confirm = confirm.freeze();

    let mut destroy = BytesMut::with_capacity(12);
    destroy.put_slice(
        &SubcommandHeader {
            subcommand: subcmd::DESTROY_FLOOR_ITEM,
            size_units: 2,
            param: 0,
        }
        .encode(),
    );
    destroy.put_u32_le(item_id);
    let destroy = destroy.freeze();

    ctx.reply(cmd::GAME_COMMAND, 0, &confirm).await?;
    // Only clients that could see the item hear about its destruction.
    let members = lobby.read().client_ids();
    for (member_slot, member_id) in members {
        if member_id == ctx.client.id {
            continue;
        }
        if removed.visibility_mask & (1 << (member_slot as u16 % 16)) == 0 {
            continue;
        }
        if let Some(member) = ctx.state.find_client(member_id) {
            member.send(cmd::GAME_COMMAND, 0, confirm.clone()).await;
            member.send(cmd::GAME_COMMAND, 0, destroy.clone()).await;
        }
    }
    Ok(())
}

/// 0xCA: Episode III referee traffic. The payload is a 0xB6-framed battle
/// command whose sub-sub opcode selects the referee transition; resulting
/// events broadcast to the whole game.
struct Ep3ServerDataHandler;

#[async_trait]
impl Handler for Ep3ServerDataHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        super::checks::check_version(
            ctx.client,
            &[Version::GcEp3, Version::GcEp3Nte],
        )?;
        let header = SubcommandHeader::parse(&frame.payload)?;
        if header.subcommand != subcmd::EP3_BATTLE {
            return Err(HandlerError::Runtime(format!(
                "unexpected Episode III envelope {:#04x}",
                header.subcommand
            )));
        }
        let mut r = PayloadReader::new(&frame.payload[4..]);
        let opcode = r.get_u8()?;
        r.skip(3)?;
        let rest = r.get_bytes(r.remaining())?.to_vec();

        let lobby_id = ctx.client.state.lock().lobby_id;
        let Some(lobby) = lobby_id.and_then(|id| ctx.state.find_lobby(id)) else {
            return Ok(());
        };
        let events = {
            let mut inner = lobby.write();
            let Some(battle) = inner.game.as_mut().and_then(|g| g.ep3.as_mut()) else {
                return Err(HandlerError::PreconditionFailed(
                    "No battle is in progress here".into(),
                ));
            };
            battle.handle_opcode(opcode, &rest)?
        };

        for event in events {
            let mut payload = BytesMut::with_capacity(8 + event.payload.len());
            payload.put_slice(
                &SubcommandHeader {
                    subcommand: subcmd::EP3_BATTLE,
                    size_units: 0,
                    param: 0,
                }
                .encode(),
            );
            payload.put_u8(event.opcode);
            payload.put_bytes(0, 3);
            payload.put_slice(&event.payload);
            let payload = payload.freeze();
            ctx.reply(cmd::EP3_SERVER_DATA, 0, &payload).await?;
            broadcast_to_lobby(
                ctx.state,
                &lobby,
                Some(ctx.client.id),
                cmd::EP3_SERVER_DATA,
                0,
                payload,
            )
            .await;
        }
        Ok(())
    }
}
