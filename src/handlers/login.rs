//! Login-phase handlers.
//!
//! Every version lands here with its own handshake variant: DC v1 runs
//! 0x90/0x93, v2 and PC run 0x9A/0x9C/0x9D, GC runs 0xDB then 0x9E, Xbox
//! runs 0x9E with the Live identity appended, and Blue Burst runs 0x93
//! with username/password. On a login-behavior port a successful login
//! leads to the ship-select menu and a reconnect; on a lobby-behavior port
//! it re-authenticates the arriving client, which then uploads player data
//! (0x61) and enters a lobby.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info};

use ragol_proto::command::{
    cmd, LoginBb, LoginV2, LoginV3, MenuEntry, MenuSelection, Reconnect, VerifyLicenseGc,
    XbLiveIdentity,
};
use ragol_proto::{Frame, Version};

use super::{Context, Handler};
use crate::account::Login;
use crate::config::Behavior;
use crate::error::{AccountError, HandlerError, HandlerResult};
use crate::state::client::{client_flags, ClientConfig};

/// Menu ids used across the login and lobby surfaces.
pub mod menu_ids {
    pub const SHIPS: u32 = 0x21;
    pub const GAMES: u32 = 0x22;
    pub const QUEST_CATEGORIES: u32 = 0x23;
    pub const QUESTS: u32 = 0x24;
    pub const PROXY: u32 = 0x25;
    pub const LOBBIES: u32 = 0x26;
}

pub fn register_login_handlers(handlers: &mut HashMap<u16, Box<dyn Handler>>) {
    handlers.insert(cmd::LOGIN_DC_V1, Box::new(LoginDcV1Handler));
    handlers.insert(cmd::LOGIN_93, Box::new(Login93Handler));
    handlers.insert(cmd::VERIFY_LICENSE_V2, Box::new(VerifyLicenseV2Handler));
    handlers.insert(cmd::REGISTER_V2, Box::new(RegisterV2Handler));
    handlers.insert(cmd::LOGIN_V2, Box::new(LoginV2Handler));
    handlers.insert(cmd::LOGIN_V3, Box::new(LoginV3Handler));
    handlers.insert(cmd::VERIFY_LICENSE_GC, Box::new(VerifyLicenseGcHandler));
    handlers.insert(cmd::MENU_SELECTION, Box::new(ShipSelectHandler));
}

pub fn register_data_server_handlers(handlers: &mut HashMap<u16, Box<dyn Handler>>) {
    handlers.insert(cmd::LOGIN_93, Box::new(Login93Handler));
    handlers.insert(cmd::BB_OPTION_REQUEST, Box::new(BbOptionRequestHandler));
    handlers.insert(cmd::BB_CHAR_SELECT, Box::new(BbCharSelectHandler));
    handlers.insert(cmd::BB_CHECKSUM, Box::new(BbChecksumHandler));
}

/// Whether unknown credentials may create accounts in this process.
fn allow_create(ctx: &Context<'_>) -> bool {
    ctx.state.config_snapshot().game.allow_unregistered_users
}

/// Hex for DC/PC serials, decimal for GC.
fn parse_serial(text: &str, decimal: bool) -> Result<u32, HandlerError> {
    let parsed = if decimal {
        text.trim().parse::<u32>().ok()
    } else {
        u32::from_str_radix(text.trim(), 16).ok()
    };
    parsed.ok_or(HandlerError::Account(AccountError::NoUsername))
}

/// Translate an account error into the version's reject behavior: a modal
/// message box, then disconnect. Ban text includes the remaining time.
async fn reject_login(ctx: &mut Context<'_>, error: AccountError) -> HandlerResult {
    let text = match &error {
        AccountError::AccountBanned => "You are banned from this server.".to_string(),
        AccountError::MissingAccount => {
            "You are not registered on this server.".to_string()
        }
        AccountError::IncorrectAccessKey => "Incorrect access key.".to_string(),
        AccountError::IncorrectPassword => "Incorrect password.".to_string(),
        other => format!("Login failed: {other}"),
    };
    ctx.reply_message_box(&text).await?;
    ctx.client.request_disconnect();
    info!(code = error.error_code(), "Login rejected");
    Ok(())
}

/// Store a successful login on the client and run the behavior-specific
/// follow-up.
async fn complete_login(
    ctx: &mut Context<'_>,
    login: Login,
    echoed_config: Option<&[u8]>,
) -> HandlerResult {
    let account_id = login.account.read().account_id;
    let created = login.account_was_created;
    {
        let mut state = ctx.client.state.lock();
        if let Some(blob) = echoed_config {
            if let Ok(echoed) = ClientConfig::parse(blob) {
                state.config.merge_from_client(&echoed);
            }
        }
        if created {
            state.config.set_flag(client_flags::LICENSE_WAS_CREATED);
        }
        state.config.set_flag(client_flags::HAS_GUILD_CARD_NUMBER);
        state.login = Some(login);
    }
    info!(account_id, created, "Login succeeded");

    match ctx.client.behavior {
        Behavior::LoginServer => {
            let config = ctx.state.config_snapshot();
            if !config.server.welcome_message.is_empty() {
                ctx.reply_message_box(&config.server.welcome_message).await?;
            }
            send_ship_menu(ctx).await
        }
        Behavior::DataServerBb => {
            // Auth result carries the config blob the client must echo on
            // its next hop.
            let blob = ctx.client.state.lock().config.serialize(0x28);
            ctx.reply(cmd::BB_SECURITY, 0, &blob).await
        }
        _ => {
            if ctx.client.version == Version::BbV4 {
                let blob = ctx.client.state.lock().config.serialize(0x28);
                ctx.reply(cmd::BB_SECURITY, 0, &blob).await?;
            }
            // Lobby entry happens when the client uploads player data.
            Ok(())
        }
    }
}

/// The ship-select menu: every lobby-behavior listener for this version,
/// plus the proxy destinations.
async fn send_ship_menu(ctx: &mut Context<'_>) -> HandlerResult {
    let config = ctx.state.config_snapshot();
    let mut entries = Vec::new();
    for (index, listen) in config.listen.iter().enumerate() {
        if listen.behavior != Behavior::LobbyServer {
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
    for (index, dest) in config.proxy.destinations.iter().enumerate() {
        if Version::from_tag(&dest.version) != Some(ctx.client.version) {
            continue;
        }
        entries.push(MenuEntry {
            menu_id: menu_ids::PROXY,
            item_id: index as u32,
            flags: 0,
            text: format!("Proxy: {}", dest.name),
        });
    }
    ctx.reply_menu(&entries).await
}

/// Serialize hop state and send the version's reconnect variant.
pub async fn send_reconnect(ctx: &mut Context<'_>, port: u16) -> HandlerResult {
    let peer = match ctx.client.remote_addr.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => std::net::Ipv4Addr::LOCALHOST,
    };
    let address = ctx.state.reconnect_address_for(peer);
    let payload = Reconnect { address, port }.encode();
    // The trial builds use the patch-style reconnect number.
    let command = match ctx.client.version {
        Version::DcNte | Version::PcNte => cmd::RECONNECT_PATCH,
        _ => cmd::RECONNECT,
    };
    debug!(%address, port, "Reconnect");
    ctx.reply(command, 0, &payload).await
}

/// 0x90: DC v1 pre-login. Flag 1 tells the client to continue with 0x93.
struct LoginDcV1Handler;

#[async_trait]
impl Handler for LoginDcV1Handler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        ctx.reply(cmd::LOGIN_DC_ACK, 1, &[]).await
    }
}

/// 0x93: DC v1 full login, or the Blue Burst username/password login.
struct Login93Handler;

#[async_trait]
impl Handler for Login93Handler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        if ctx.client.version == Version::BbV4 {
            let login = LoginBb::parse(&frame.payload)?;
            {
                let mut state = ctx.client.state.lock();
                state.sub_version = login.sub_version;
                state.language = login.language;
            }
            match ctx.state.accounts.from_bb_credentials(
                &login.username,
                Some(&login.password),
                allow_create(ctx),
            ) {
                Ok(result) => complete_login(ctx, result, Some(&login.client_config)).await,
                Err(e) => reject_login(ctx, e).await,
            }
        } else {
            let login = LoginV2::parse(&frame.payload)?;
            {
                let mut state = ctx.client.state.lock();
                state.sub_version = login.sub_version;
                state.language = login.language;
            }
            // The trial edition used free-form serial strings; production
            // DC serials are 32-bit hex.
            let result = if ctx.client.version == Version::DcNte {
                ctx.state.accounts.from_dc_nte_credentials(
                    &login.serial_number,
                    &login.access_key,
                    allow_create(ctx),
                )
            } else {
                let serial = parse_serial(&login.serial_number, false)?;
                ctx.state.accounts.from_dc_credentials(
                    serial,
                    &login.access_key,
                    &login.character_name,
                    allow_create(ctx),
                )
            };
            match result {
                Ok(result) => complete_login(ctx, result, None).await,
                Err(e) => reject_login(ctx, e).await,
            }
        }
    }
}

/// 0x9A: v2 license check. The reply reuses the command number with the
/// result in the flag (0 = ok).
struct VerifyLicenseV2Handler;

#[async_trait]
impl Handler for VerifyLicenseV2Handler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let login = LoginV2::parse(&frame.payload)?;
        let serial = parse_serial(&login.serial_number, false)?;
        let result = if ctx.client.version.is_dc() {
            ctx.state
                .accounts
                .from_dc_credentials(serial, &login.access_key, "", allow_create(ctx))
        } else {
            ctx.state
                .accounts
                .from_pc_credentials(serial, &login.access_key, "", allow_create(ctx))
        };
        match result {
            Ok(_) => ctx.reply(cmd::VERIFY_LICENSE_V2, 0, &[]).await,
            Err(AccountError::AccountBanned) => reject_login(ctx, AccountError::AccountBanned).await,
            Err(_) => ctx.reply(cmd::VERIFY_LICENSE_V2, 1, &[]).await,
        }
    }
}

/// 0x9C: v2 registration. Flag 1 = success.
struct RegisterV2Handler;

#[async_trait]
impl Handler for RegisterV2Handler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let login = LoginV2::parse(&frame.payload)?;
        let serial = parse_serial(&login.serial_number, false)?;
        let result = if ctx.client.version.is_dc() {
            ctx.state
                .accounts
                .from_dc_credentials(serial, &login.access_key, "", true)
        } else {
            ctx.state
                .accounts
                .from_pc_credentials(serial, &login.access_key, "", true)
        };
        match result {
            Ok(_) => ctx.reply(cmd::REGISTER_V2, 1, &[]).await,
            Err(e) => reject_login(ctx, e).await,
        }
    }
}

/// 0x9D: DC v2 / PC login.
struct LoginV2Handler;

#[async_trait]
impl Handler for LoginV2Handler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let login = LoginV2::parse(&frame.payload)?;
        let serial = parse_serial(&login.serial_number, false)?;
        {
            let mut state = ctx.client.state.lock();
            state.sub_version = login.sub_version;
            state.language = login.language;
            if !login.character_name.is_empty() {
                state.name = login.character_name.clone();
            }
        }
        let result = if ctx.client.version.is_dc() {
            ctx.state.accounts.from_dc_credentials(
                serial,
                &login.access_key,
                &login.character_name,
                allow_create(ctx),
            )
        } else {
            ctx.state.accounts.from_pc_credentials(
                serial,
                &login.access_key,
                &login.character_name,
                allow_create(ctx),
            )
        };
        match result {
            Ok(result) => complete_login(ctx, result, None).await,
            Err(e) => reject_login(ctx, e).await,
        }
    }
}

/// 0x9E: GC / Xbox login with the echoed config blob. Xbox appends its
/// Live identity tuple after the blob.
struct LoginV3Handler;

#[async_trait]
impl Handler for LoginV3Handler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let login = LoginV3::parse(&frame.payload)?;
        {
            let mut state = ctx.client.state.lock();
            state.sub_version = login.base.sub_version;
            state.language = login.base.language;
            if !login.base.character_name.is_empty() {
                state.name = login.base.character_name.clone();
            }
        }
        let result = if ctx.client.version == Version::XbV3 {
            let identity_offset = 0x3C + 0x20;
            let identity = frame
                .payload
                .get(identity_offset..)
                .filter(|rest| !rest.is_empty())
                .map(XbLiveIdentity::parse)
                .transpose()?
                .unwrap_or_default();
            ctx.state.accounts.from_xb_credentials(
                &identity.gamertag,
                identity.user_id,
                identity.account_id,
                allow_create(ctx),
            )
        } else {
            let serial = parse_serial(&login.base.serial_number, true)?;
            ctx.state.accounts.from_gc_credentials(
                serial,
                &login.base.access_key,
                None,
                &login.base.character_name,
                allow_create(ctx),
            )
        };
        match result {
            Ok(result) => complete_login(ctx, result, Some(&login.client_config)).await,
            Err(e) => reject_login(ctx, e).await,
        }
    }
}

/// 0xDB: GC license verification, the only step carrying the password.
/// Reply reuses 0x9A with the result in the flag.
struct VerifyLicenseGcHandler;

#[async_trait]
impl Handler for VerifyLicenseGcHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let verify = VerifyLicenseGc::parse(&frame.payload)?;
        let serial = parse_serial(&verify.serial_number, true)?;
        let allow = allow_create(ctx) && ctx.state.config_snapshot().game.allow_gc_self_creation;
        let result = ctx.state.accounts.from_gc_credentials(
            serial,
            &verify.access_key,
            Some(&verify.password),
            "",
            allow,
        );
        match result {
            Ok(_) => ctx.reply(cmd::VERIFY_LICENSE_V2, 0, &[]).await,
            Err(AccountError::AccountBanned) => reject_login(ctx, AccountError::AccountBanned).await,
            Err(e) => {
                info!(code = e.error_code(), "GC license check failed");
                ctx.reply(cmd::VERIFY_LICENSE_V2, 1, &[]).await
            }
        }
    }
}

/// 0x10 on a login-behavior port: ship or proxy selection, answered with a
/// reconnect.
struct ShipSelectHandler;

#[async_trait]
impl Handler for ShipSelectHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        if !ctx.client.is_logged_in() {
            return Err(HandlerError::PreconditionFailed("Log in first".into()));
        }
        let selection = MenuSelection::parse(&frame.payload)?;
        let config = ctx.state.config_snapshot();
        match selection.menu_id {
            menu_ids::SHIPS => {
                let listen = config
                    .listen
                    .get(selection.item_id as usize)
                    .filter(|l| l.behavior == Behavior::LobbyServer)
                    .ok_or_else(|| {
                        HandlerError::PreconditionFailed("That ship no longer exists".into())
                    })?;
                send_reconnect(ctx, listen.port).await
            }
            menu_ids::PROXY => {
                let dest = config
                    .proxy
                    .destinations
                    .get(selection.item_id as usize)
                    .ok_or_else(|| {
                        HandlerError::PreconditionFailed("That destination no longer exists".into())
                    })?;
                let proxy_port = config
                    .listen
                    .iter()
                    .find(|l| {
                        l.behavior == Behavior::ProxyServer
                            && l.parsed_version() == Some(ctx.client.version)
                    })
                    .map(|l| l.port)
                    .ok_or_else(|| {
                        HandlerError::PreconditionFailed(
                            "No proxy port is configured for your version".into(),
                        )
                    })?;
                {
                    let mut state = ctx.client.state.lock();
                    let addr: std::net::Ipv4Addr = dest.address.parse().map_err(|_| {
                        HandlerError::Runtime(format!("bad proxy address {:?}", dest.address))
                    })?;
                    state.config.proxy_destination_address = u32::from(addr);
                    state.config.proxy_destination_port = dest.port;
                }
                send_reconnect(ctx, proxy_port).await
            }
            _ => Err(HandlerError::PreconditionFailed("Unknown menu".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Blue Burst data server
// ---------------------------------------------------------------------------

/// 0xE0: account options request. Served with defaults; the storage
/// engine proper lives outside this server.
struct BbOptionRequestHandler;

#[async_trait]
impl Handler for BbOptionRequestHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        ctx.reply(cmd::BB_OPTION_CONFIG, 0, &[0u8; 0xA0]).await
    }
}

/// 0xE3: character select. Preview requests answer 0xE4 with flag 0 (no
/// character); a confirmed selection completes the data-server phase and
/// bounces the client to the login port.
struct BbCharSelectHandler;

#[async_trait]
impl Handler for BbCharSelectHandler {
    async fn handle(&self, ctx: &mut Context<'_>, frame: &Frame) -> HandlerResult {
        let selected = frame.flag == 1;
        if !selected {
            return ctx.reply(cmd::BB_CHAR_SELECT_ACK, 0, &[]).await;
        }
        ctx.reply(cmd::BB_CHAR_SELECT_ACK, 1, &[]).await?;
        let config = ctx.state.config_snapshot();
        let login_port = config
            .listen
            .iter()
            .find(|l| {
                l.behavior == Behavior::LoginServer
                    && l.parsed_version() == Some(Version::BbV4)
            })
            .map(|l| l.port);
        match login_port {
            Some(port) => {
                send_reconnect(ctx, port).await?;
                ctx.client.request_disconnect();
                Ok(())
            }
            None => Err(HandlerError::Runtime(
                "no Blue Burst login port configured".into(),
            )),
        }
    }
}

/// 0xE8: client data checksum; acknowledged blindly.
struct BbChecksumHandler;

#[async_trait]
impl Handler for BbChecksumHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _frame: &Frame) -> HandlerResult {
        ctx.reply(cmd::BB_CHECKSUM, 1, &[]).await
    }
}

