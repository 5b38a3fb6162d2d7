//! Test server management.
//!
//! Spawns and manages ragold instances for integration testing.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;

/// A test server instance running the real binary.
pub struct TestServer {
    child: Child,
    ports: Vec<u16>,
    data_dir: PathBuf,
}

impl TestServer {
    /// Spawn a server with the given `[[listen]]` blocks appended to a
    /// minimal `[server]` section. `ports` is used for readiness checks.
    pub async fn spawn(tag: &str, ports: &[u16], config_body: &str) -> anyhow::Result<Self> {
        Self::spawn_prepared(tag, ports, config_body, |_| Ok(())).await
    }

    /// Like [`TestServer::spawn`], running `setup` against the data
    /// directory before the server starts (pre-seeded accounts, key
    /// files, patch trees).
    pub async fn spawn_prepared(
        tag: &str,
        ports: &[u16],
        config_body: &str,
        setup: impl FnOnce(&Path) -> anyhow::Result<()>,
    ) -> anyhow::Result<Self> {
        let data_dir = std::env::temp_dir().join(format!("ragold-test-{tag}-{}", ports[0]));
        let _ = std::fs::remove_dir_all(&data_dir);
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(data_dir.join("licenses"))?;
        setup(&data_dir)?;

        // `%DATA%` in the config body expands to the data directory.
        let config_body = config_body.replace("%DATA%", &data_dir.display().to_string());
        let config_body = config_body.as_str();
        let config_content = format!(
            r#"
[server]
name = "test-ragold"
local_address = "127.0.0.1"
external_address = "127.0.0.1"

[accounts]
directory = "{accounts}"

[episode3]
tournament_file = "{tournaments}"

{config_body}
"#,
            accounts = data_dir.join("licenses").display(),
            tournaments = data_dir.join("tournaments.json").display(),
        );
        let config_path = data_dir.join("config.toml");
        std::fs::write(&config_path, config_content)?;

        let binary = env!("CARGO_BIN_EXE_ragold");
        let child = Command::new(binary)
            .arg("-c")
            .arg(&config_path)
            .env("RUST_LOG", "info")
            .spawn()?;

        let server = TestServer {
            child,
            ports: ports.to_vec(),
            data_dir,
        };
        server.wait_ready().await?;
        Ok(server)
    }

    async fn wait_ready(&self) -> anyhow::Result<()> {
        for port in &self.ports {
            let mut attempts = 0;
            loop {
                match TcpStream::connect(("127.0.0.1", *port)).await {
                    Ok(_) => break,
                    Err(_) if attempts < 100 => {
                        attempts += 1;
                        sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => {
                        return Err(anyhow::anyhow!("port {port} never came up: {e}"));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the license directory the server persists accounts into.
    pub fn licenses_dir(&self) -> PathBuf {
        self.data_dir.join("licenses")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}
