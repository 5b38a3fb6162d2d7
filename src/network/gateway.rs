//! The Gateway binds every configured listener and spawns a Connection
//! task per accepted socket. Each listener carries its version, behavior,
//! and (for Blue Burst ports) the private key table advertised to clients.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use ragol_proto::crypt::BbPrivateKey;
use ragol_proto::Version;

use crate::config::{Behavior, ListenConfig};
use crate::handlers::Registry;
use crate::network::Connection;
use crate::state::ServerState;

/// One bound listening port.
struct BoundListener {
    listener: TcpListener,
    name: String,
    version: Version,
    behavior: Behavior,
    bb_private_key: Option<Arc<BbPrivateKey>>,
}

/// All listening ports plus the shared handler registries.
pub struct Gateway {
    listeners: Vec<BoundListener>,
    state: Arc<ServerState>,
}

impl Gateway {
    /// Bind every configured listener. A Blue Burst listener loads its
    /// private key file here so a bad path fails startup, not a client.
    pub async fn bind(state: Arc<ServerState>) -> anyhow::Result<Gateway> {
        let config = state.config_snapshot();
        let mut listeners = Vec::with_capacity(config.listen.len());
        for listen in &config.listen {
            let version = listen.parsed_version().ok_or_else(|| {
                anyhow::anyhow!("listener {:?} has an unknown version", listen.name)
            })?;
            let bb_private_key = Self::load_bb_key(listen, version)?;
            let addr = SocketAddr::new(IpAddr::V4(listen.addr), listen.port);
            let listener = TcpListener::bind(addr).await?;
            info!(
                name = %listen.name,
                %addr,
                version = %version,
                behavior = ?listen.behavior,
                "Listener bound"
            );
            listeners.push(BoundListener {
                listener,
                name: listen.name.clone(),
                version,
                behavior: listen.behavior,
                bb_private_key,
            });
        }
        Ok(Gateway { listeners, state })
    }

    fn load_bb_key(
        listen: &ListenConfig,
        version: Version,
    ) -> anyhow::Result<Option<Arc<BbPrivateKey>>> {
        if version != Version::BbV4 || listen.behavior == Behavior::PatchServer {
            return Ok(None);
        }
        let path = listen.bb_key_file.as_ref().ok_or_else(|| {
            anyhow::anyhow!("listener {:?} speaks Blue Burst but has no bb_key_file", listen.name)
        })?;
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("cannot read BB key file {path:?}: {e}"))?;
        let key = BbPrivateKey::from_bytes(&data)
            .map_err(|e| anyhow::anyhow!("BB key file {path:?}: {e}"))?;
        Ok(Some(Arc::new(key)))
    }

    /// Accept connections forever on every listener.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut tasks = Vec::with_capacity(self.listeners.len());
        for bound in self.listeners {
            let state = self.state.clone();
            let registry = Registry::for_behavior(bound.behavior);
            tasks.push(tokio::spawn(accept_loop(bound, state, registry)));
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn accept_loop(bound: BoundListener, state: Arc<ServerState>, registry: Arc<Registry>) {
    loop {
        match bound.listener.accept().await {
            Ok((stream, addr)) => {
                // Banned ranges are refused before any handshake bytes.
                if let IpAddr::V4(v4) = addr.ip() {
                    if state.banned_ranges.read().contains(v4) {
                        warn!(%addr, "Refusing connection from banned range");
                        continue;
                    }
                }
                let _ = stream.set_nodelay(true);
                let state = state.clone();
                let registry = registry.clone();
                let version = bound.version;
                let behavior = bound.behavior;
                let bb_key = bound.bb_private_key.clone();
                let listener_name = bound.name.clone();
                tokio::spawn(async move {
                    let connection =
                        Connection::new(stream, addr, version, behavior, bb_key, state, registry);
                    if let Err(e) = connection.run().await {
                        error!(%addr, listener = %listener_name, error = %e, "Connection error");
                    }
                });
            }
            Err(e) => {
                error!(listener = %bound.name, error = %e, "Failed to accept connection");
            }
        }
    }
}
