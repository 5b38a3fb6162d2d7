//! A real protocol client for integration tests.
//!
//! Mirrors the handshake the retail clients perform: read the plaintext
//! encryption-init, key the ciphers (client output = `client_key`, input =
//! `server_key`), then speak the framed protocol.

#![allow(dead_code)]

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use ragol_proto::command::{cmd, ServerInit, ServerInitBb};
use ragol_proto::crypt::{
    BbCipher, BbKeyMaterial, BbPrivateKey, Cipher, CipherFamily, DcCipher, GcCipher, PcCipher,
};
use ragol_proto::{Frame, Transport, Version};

pub struct TestClient {
    transport: Transport,
    pub version: Version,
}

impl TestClient {
    /// Connect and complete the encryption handshake. BB versions need the
    /// same private key table the listener was configured with.
    pub async fn connect(
        port: u16,
        version: Version,
        bb_key: Option<&BbPrivateKey>,
    ) -> anyhow::Result<TestClient> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let mut transport = Transport::tcp(stream, version);

        let init = timeout(Duration::from_secs(5), transport.recv())
            .await??
            .ok_or_else(|| anyhow::anyhow!("server closed before init"))?;

        match version.cipher_family() {
            CipherFamily::Bb => {
                let parsed = ServerInitBb::parse(&init.payload)
                    .map_err(|e| anyhow::anyhow!("bad BB init: {e}"))?;
                let key = bb_key.ok_or_else(|| anyhow::anyhow!("BB client needs a key table"))?;
                transport.set_ciphers(
                    Cipher::Bb(Box::new(BbCipher::new(
                        &BbKeyMaterial(parsed.server_key),
                        key,
                    ))),
                    Cipher::Bb(Box::new(BbCipher::new(
                        &BbKeyMaterial(parsed.client_key),
                        key,
                    ))),
                );
            }
            family => {
                anyhow::ensure!(
                    init.command == cmd::SERVER_INIT || init.command == cmd::SERVER_INIT_LOGIN,
                    "unexpected init command {:#04x}",
                    init.command
                );
                let parsed = ServerInit::parse(&init.payload)
                    .map_err(|e| anyhow::anyhow!("bad init: {e}"))?;
                let make = |key: u32| match family {
                    CipherFamily::Pc => Cipher::Pc(PcCipher::new(key)),
                    CipherFamily::Gc => Cipher::Gc(GcCipher::new(key)),
                    _ => Cipher::Dc(DcCipher::new(key)),
                };
                // Mirror of the server: our input decrypts with the
                // server's output key.
                transport.set_ciphers(make(parsed.server_key), make(parsed.client_key));
            }
        }

        Ok(TestClient { transport, version })
    }

    pub async fn send(&mut self, command: u16, flag: u32, payload: &[u8]) -> anyhow::Result<()> {
        self.transport.send(command, flag, payload).await?;
        Ok(())
    }

    /// Receive the next frame, failing after `wait`.
    pub async fn recv_timeout(&mut self, wait: Duration) -> anyhow::Result<Frame> {
        let frame = timeout(wait, self.transport.recv())
            .await??
            .ok_or_else(|| anyhow::anyhow!("server closed"))?;
        Ok(frame)
    }

    /// Read frames until one matches `predicate`, failing after five
    /// seconds. Non-matching frames are returned too, in order.
    pub async fn recv_until(
        &mut self,
        predicate: impl Fn(&Frame) -> bool,
    ) -> anyhow::Result<Vec<Frame>> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("timed out waiting; saw {:?}", commands(&seen)))?;
            let frame = self.recv_timeout(remaining).await?;
            let matched = predicate(&frame);
            seen.push(frame);
            if matched {
                return Ok(seen);
            }
        }
    }

    /// Read frames until one with the given command number arrives.
    pub async fn expect_command(&mut self, command: u16) -> anyhow::Result<Frame> {
        let mut frames = self.recv_until(|f| f.command == command).await?;
        Ok(frames.pop().expect("recv_until returns the match last"))
    }

    /// Assert the connection closes without delivering `forbidden`.
    pub async fn expect_close_without(&mut self, forbidden: u16) -> anyhow::Result<()> {
        loop {
            match timeout(Duration::from_secs(5), self.transport.recv()).await {
                Ok(Ok(Some(frame))) => {
                    anyhow::ensure!(
                        frame.command != forbidden,
                        "received forbidden command {:#04x}",
                        frame.command
                    );
                }
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(_)) => return Ok(()),
                Err(_) => return Err(anyhow::anyhow!("connection did not close")),
            }
        }
    }
}

fn commands(frames: &[Frame]) -> Vec<u16> {
    frames.iter().map(|f| f.command).collect()
}
