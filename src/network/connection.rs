//! One client connection.
//!
//! Phase 1 keys the ciphers: the server sends the plaintext
//! encryption-init command and immediately installs the cipher pair
//! (output keyed with `server_key`, input with `client_key`; the client
//! mirrors this). Phase 2 is a unified `select!` loop over inbound frames,
//! the client's outbound queue, the ping interval, and the idle timeout.
//! Patch-behavior ports never enter phase 2; the patch protocol runs its
//! own session loop.

use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use ragol_proto::command::{
    cmd, patch_cmd, ServerInit, ServerInitBb, BB_SERVER_COPYRIGHT, GAME_SERVER_COPYRIGHT,
    PATCH_SERVER_COPYRIGHT,
};
use ragol_proto::crypt::{
    BbCipher, BbKeyMaterial, BbPrivateKey, Cipher, CipherFamily, DcCipher, GcCipher, PcCipher,
    BB_KEY_MATERIAL_SIZE,
};
use ragol_proto::{Transport, Version};

use crate::config::Behavior;
use crate::handlers::{self, Context, Registry};
use crate::patch::PatchSession;
use crate::state::client::{Client, ClientEvent};
use crate::state::ServerState;

pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    version: Version,
    behavior: Behavior,
    bb_private_key: Option<Arc<BbPrivateKey>>,
    state: Arc<ServerState>,
    registry: Arc<Registry>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        version: Version,
        behavior: Behavior,
        bb_private_key: Option<Arc<BbPrivateKey>>,
        state: Arc<ServerState>,
        registry: Arc<Registry>,
    ) -> Connection {
        Connection {
            stream,
            addr,
            version,
            behavior,
            bb_private_key,
            state,
            registry,
        }
    }

    #[instrument(skip(self), fields(addr = %self.addr, version = %self.version), name = "connection")]
    pub async fn run(self) -> anyhow::Result<()> {
        info!(behavior = ?self.behavior, "Client connected");
        let local_port = self.stream.local_addr().map(|a| a.port()).unwrap_or(0);
        let mut transport = Transport::tcp(self.stream, self.version);

        // Phase 1: plaintext init, then ciphers on.
        match self.version.cipher_family() {
            CipherFamily::Bb => {
                let private_key = self
                    .bb_private_key
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("BB listener without a private key"))?;
                let (server_key, client_key) = {
                    let mut rng = rand::thread_rng();
                    let mut server_key = [0u8; BB_KEY_MATERIAL_SIZE];
                    let mut client_key = [0u8; BB_KEY_MATERIAL_SIZE];
                    rng.fill_bytes(&mut server_key);
                    rng.fill_bytes(&mut client_key);
                    (server_key, client_key)
                };
                let init = ServerInitBb {
                    copyright: BB_SERVER_COPYRIGHT.to_string(),
                    server_key,
                    client_key,
                };
                transport.send(cmd::SERVER_INIT_BB, 0, &init.encode()).await?;
                transport.set_ciphers(
                    Cipher::Bb(Box::new(BbCipher::new(
                        &BbKeyMaterial(client_key),
                        &private_key,
                    ))),
                    Cipher::Bb(Box::new(BbCipher::new(
                        &BbKeyMaterial(server_key),
                        &private_key,
                    ))),
                );
            }
            family => {
                let server_key: u32 = rand::random();
                let client_key: u32 = rand::random();
                let (command, copyright) = match self.behavior {
                    Behavior::PatchServer => (patch_cmd::START_ENCRYPTION, PATCH_SERVER_COPYRIGHT),
                    Behavior::LoginServer => (cmd::SERVER_INIT_LOGIN, GAME_SERVER_COPYRIGHT),
                    _ => (cmd::SERVER_INIT, GAME_SERVER_COPYRIGHT),
                };
                let init = ServerInit {
                    copyright: copyright.to_string(),
                    server_key,
                    client_key,
                };
                transport.send(command, 0, &init.encode()).await?;
                let make = |key: u32| match family {
                    CipherFamily::Pc => Cipher::Pc(PcCipher::new(key)),
                    CipherFamily::Gc => Cipher::Gc(GcCipher::new(key)),
                    _ => Cipher::Dc(DcCipher::new(key)),
                };
                transport.set_ciphers(make(client_key), make(server_key));
            }
        }

        if self.behavior == Behavior::PatchServer {
            return PatchSession::new(self.state.clone(), transport).run().await;
        }
        if self.behavior == Behavior::ProxyServer {
            return crate::proxy::ProxySession::new(
                self.state.clone(),
                transport,
                self.version,
                local_port,
                self.addr,
                self.bb_private_key.clone(),
            )
            .run()
            .await;
        }

        // Phase 2: the session proper.
        let (tx, mut rx) = mpsc::channel::<ClientEvent>(64);
        let client_id = self.state.allocate_client_id();
        let client = Arc::new(Client::new(
            client_id,
            self.version,
            self.behavior,
            self.addr,
            tx,
        ));
        self.state.clients.insert(client_id, client.clone());

        let config = self.state.config_snapshot();
        let idle_timeout = Duration::from_secs(config.server.idle_timeout_secs.max(1));
        let ping_interval = Duration::from_secs(config.server.ping_interval_secs.max(1));
        drop(config);

        let (mut recv_half, mut send_half) = transport.split();
        let mut last_activity = Instant::now();
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping_timer.reset();

        loop {
            tokio::select! {
                result = recv_half.recv() => {
                    match result {
                        Ok(Some(frame)) => {
                            last_activity = Instant::now();
                            let result = {
                                let mut ctx = Context {
                                    state: &self.state,
                                    client: &client,
                                    send: &mut send_half,
                                };
                                self.registry.dispatch(&mut ctx, &frame).await
                            };
                            if let Err(e) = result {
                                let catch = self
                                    .state
                                    .config_snapshot()
                                    .server
                                    .catch_handler_exceptions;
                                if !handlers::absorb_dispatch_error(
                                    &mut send_half,
                                    &client,
                                    &frame,
                                    e,
                                    catch,
                                )
                                .await
                                {
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            info!("Client disconnected");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Read error");
                            break;
                        }
                    }
                }

                event = rx.recv() => {
                    match event {
                        Some(ClientEvent::Send { command, flag, payload }) => {
                            if let Err(e) = send_half.send(command, flag, &payload).await {
                                warn!(error = %e, "Write error");
                                break;
                            }
                        }
                        Some(ClientEvent::Disconnect) | None => {
                            debug!("Disconnect requested");
                            break;
                        }
                    }
                }

                _ = ping_timer.tick() => {
                    if last_activity.elapsed() >= idle_timeout {
                        info!("Idle timeout");
                        break;
                    }
                    if send_half.send(cmd::PING, 0, &[]).await.is_err() {
                        break;
                    }
                }
            }
        }

        // Cleanup: leave the lobby with notifications, then vanish.
        // The rx queue is dropped here, cancelling anything still queued.
        while rx.try_recv().is_ok() {}
        handlers::handle_client_departure(&self.state, &client).await;
        self.state.clients.remove(&client_id);
        info!("Connection closed");
        Ok(())
    }
}
