//! The patch server.
//!
//! A separate, simpler protocol spoken before the game protocol: the
//! client proves which files it has (CRC32 + size per file), and the
//! server pushes every file that differs, walking the directory tree with
//! enter/exit commands that keep the client's directory pointer in sync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use ragol_proto::command::{patch_cmd, PayloadReader};
use ragol_proto::{Transport, Version};

use crate::state::ServerState;

const WRITE_CHUNK: usize = 0x4000;

/// One file in the patch tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchFileEntry {
    /// Directory components under the patch root.
    pub directories: Vec<String>,
    pub name: String,
    pub size: u32,
    pub crc32: u32,
    path: PathBuf,
}

impl PatchFileEntry {
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }
}

/// The patch tree, pre-sorted so the directory walk is a common-prefix
/// scan.
#[derive(Debug, Default)]
pub struct PatchFileIndex {
    entries: Vec<PatchFileEntry>,
}

impl PatchFileIndex {
    /// Walk `root`, checksumming every file. A missing root is an empty
    /// index (nothing to patch).
    pub fn load(root: &Path) -> PatchFileIndex {
        let mut entries = Vec::new();
        Self::walk(root, &mut Vec::new(), &mut entries);
        entries.sort_by(|a, b| {
            a.directories
                .cmp(&b.directories)
                .then_with(|| a.name.cmp(&b.name))
        });
        info!(count = entries.len(), "Patch index loaded");
        PatchFileIndex { entries }
    }

    fn walk(dir: &Path, stack: &mut Vec<String>, out: &mut Vec<PatchFileEntry>) {
        let Ok(read_dir) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                stack.push(name);
                Self::walk(&path, stack, out);
                stack.pop();
            } else if let Ok(data) = std::fs::read(&path) {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&data);
                out.push(PatchFileEntry {
                    directories: stack.clone(),
                    name,
                    size: data.len() as u32,
                    crc32: hasher.finalize(),
                    path,
                });
            }
        }
    }

    pub fn entries(&self) -> &[PatchFileEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the client reported for one checksum request.
#[derive(Debug, Clone, Copy, Default)]
struct ClientFileInfo {
    responded: bool,
    crc32: u32,
    size: u32,
}

/// One patch-protocol session. The encryption init was already sent by
/// the accepting connection; this owns the rest of the exchange.
pub struct PatchSession {
    state: Arc<ServerState>,
    transport: Transport,
}

impl PatchSession {
    pub fn new(state: Arc<ServerState>, transport: Transport) -> PatchSession {
        PatchSession { state, transport }
    }

    /// Receive with the channel idle timeout applied.
    async fn recv(&mut self) -> anyhow::Result<Option<ragol_proto::Frame>> {
        let idle = self.state.config_snapshot().server.idle_timeout_secs.max(1);
        match tokio::time::timeout(
            std::time::Duration::from_secs(idle),
            self.transport.recv(),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => {
                info!("Patch client idle timeout");
                Ok(None)
            }
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let config = self.state.config_snapshot();
        let index = PatchFileIndex::load(Path::new(&config.patch.directory));

        // Wait for the client's login (0x04). An 0x02 echo of the init may
        // arrive first on some client builds; when it does, answer with the
        // login request.
        loop {
            let Some(frame) = self.recv().await? else {
                return Ok(());
            };
            match frame.command {
                patch_cmd::START_ENCRYPTION => {
                    self.transport.send(patch_cmd::LOGIN, 0, &[]).await?;
                }
                patch_cmd::LOGIN => {
                    if config.patch.require_login {
                        let mut r = PayloadReader::new(&frame.payload);
                        r.skip(12).ok();
                        let username = r.get_ascii(0x10).unwrap_or_default();
                        let password = r.get_ascii(0x10).unwrap_or_default();
                        if self
                            .state
                            .accounts
                            .from_bb_credentials(&username, Some(&password), false)
                            .is_err()
                        {
                            warn!(username = %username, "Patch login refused");
                            return Ok(());
                        }
                    }
                    break;
                }
                other => {
                    debug!(command = format_args!("{other:#04x}"), "Ignored pre-login command");
                }
            }
        }

        if !config.patch.welcome_message.is_empty() {
            let text = ragol_proto::command::encode_text(
                Version::Patch,
                &config.patch.welcome_message,
            );
            self.transport.send(patch_cmd::MESSAGE, 0, &text).await?;
        }

        // Phase 1: request checksums for every file, walking directories.
        self.walk_tree(&index, |request_id, entry| {
            let mut payload = Vec::with_capacity(0x24);
            payload.extend_from_slice(&(request_id as u32).to_le_bytes());
            let mut name = entry.name.clone().into_bytes();
            name.resize(0x20, 0);
            payload.extend_from_slice(&name);
            (patch_cmd::FILE_CHECKSUM_REQUEST, 0, payload)
        })
        .await?;
        self.transport.send(patch_cmd::END_FILE_CHECKSUMS, 0, &[]).await?;

        // Phase 2: collect the client's answers.
        let mut reports = vec![ClientFileInfo::default(); index.entries().len()];
        loop {
            let Some(frame) = self.recv().await? else {
                return Ok(());
            };
            match frame.command {
                patch_cmd::FILE_INFORMATION => {
                    let mut r = PayloadReader::new(&frame.payload);
                    let request_id = r.get_u32()? as usize;
                    let crc32 = r.get_u32()?;
                    let size = r.get_u32()?;
                    if let Some(report) = reports.get_mut(request_id) {
                        *report = ClientFileInfo {
                            responded: true,
                            crc32,
                            size,
                        };
                    }
                }
                patch_cmd::FILE_INFORMATION_DONE => break,
                other => {
                    debug!(command = format_args!("{other:#04x}"), "Ignored during checksum phase");
                }
            }
        }

        // Phase 3: push everything that differs.
        let mismatched: Vec<usize> = index
            .entries()
            .iter()
            .enumerate()
            .filter(|(i, entry)| {
                let report = &reports[*i];
                !report.responded || report.crc32 != entry.crc32 || report.size != entry.size
            })
            .map(|(i, _)| i)
            .collect();
        let total_size: u64 = mismatched
            .iter()
            .map(|&i| index.entries()[i].size as u64)
            .sum();
        info!(
            files = mismatched.len(),
            bytes = total_size,
            "Patch summary"
        );
        let mut summary = Vec::with_capacity(8);
        summary.extend_from_slice(&(total_size as u32).to_le_bytes());
        summary.extend_from_slice(&(mismatched.len() as u32).to_le_bytes());
        self.transport
            .send(patch_cmd::START_FILE_DOWNLOADS, 0, &summary)
            .await?;

        let mut current_dirs: Vec<String> = Vec::new();
        for &entry_index in &mismatched {
            let entry = &index.entries()[entry_index];
            self.sync_directory(&mut current_dirs, &entry.directories).await?;

            let data = match entry.read() {
                Ok(data) => data,
                Err(e) => {
                    warn!(file = %entry.name, error = %e, "Patch file vanished; skipping");
                    continue;
                }
            };
            let mut open = Vec::with_capacity(0x38);
            open.extend_from_slice(&0u32.to_le_bytes());
            open.extend_from_slice(&entry.size.to_le_bytes());
            let mut name = entry.name.clone().into_bytes();
            name.resize(0x30, 0);
            open.extend_from_slice(&name);
            self.transport.send(patch_cmd::OPEN_FILE, 0, &open).await?;

            for (chunk_index, chunk) in data.chunks(WRITE_CHUNK).enumerate() {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(chunk);
                let mut payload = Vec::with_capacity(12 + chunk.len());
                payload.extend_from_slice(&(chunk_index as u32).to_le_bytes());
                payload.extend_from_slice(&hasher.finalize().to_le_bytes());
                payload.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
                payload.extend_from_slice(chunk);
                self.transport
                    .send(patch_cmd::WRITE_FILE, chunk_index as u32, &payload)
                    .await?;
            }
            self.transport.send(patch_cmd::CLOSE_FILE, 0, &[]).await?;
        }
        self.sync_directory(&mut current_dirs, &[]).await?;

        self.transport.send(patch_cmd::END_OF_UPDATE, 0, &[]).await?;
        info!("Patch session complete");
        Ok(())
    }

    /// Walk the sorted index, keeping the client's directory pointer in
    /// sync, and send one command per file through `make_command`.
    async fn walk_tree<F>(&mut self, index: &PatchFileIndex, make_command: F) -> anyhow::Result<()>
    where
        F: Fn(usize, &PatchFileEntry) -> (u16, u32, Vec<u8>),
    {
        let mut current_dirs: Vec<String> = Vec::new();
        for (request_id, entry) in index.entries().iter().enumerate() {
            self.sync_directory(&mut current_dirs, &entry.directories).await?;
            let (command, flag, payload) = make_command(request_id, entry);
            self.transport.send(command, flag, &payload).await?;
        }
        self.sync_directory(&mut current_dirs, &[]).await?;
        Ok(())
    }

    /// Exit and enter directories until the client's pointer matches
    /// `target`: pop to the common prefix, then push the rest.
    async fn sync_directory(
        &mut self,
        current: &mut Vec<String>,
        target: &[String],
    ) -> anyhow::Result<()> {
        let common = current
            .iter()
            .zip(target.iter())
            .take_while(|(a, b)| a == b)
            .count();
        while current.len() > common {
            current.pop();
            self.transport.send(patch_cmd::EXIT_DIRECTORY, 0, &[]).await?;
        }
        for dir in &target[common..] {
            let mut payload = dir.clone().into_bytes();
            payload.resize(0x40, 0);
            self.transport
                .send(patch_cmd::ENTER_DIRECTORY, 0, &payload)
                .await?;
            current.push(dir.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_sorts_and_checksums() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/b")).unwrap();
        std::fs::write(dir.path().join("root.txt"), b"root").unwrap();
        std::fs::write(dir.path().join("data/one.bin"), b"one").unwrap();
        std::fs::write(dir.path().join("data/b/two.bin"), b"two").unwrap();

        let index = PatchFileIndex::load(dir.path());
        assert_eq!(index.entries().len(), 3);
        // Sorted by directory path then name: root first, then data/,
        // then data/b/.
        assert_eq!(index.entries()[0].name, "root.txt");
        assert_eq!(index.entries()[1].directories, vec!["data".to_string()]);
        assert_eq!(
            index.entries()[2].directories,
            vec!["data".to_string(), "b".to_string()]
        );
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(b"root");
        assert_eq!(index.entries()[0].crc32, hasher.finalize());
        assert_eq!(index.entries()[0].size, 4);
    }

    #[test]
    fn missing_root_is_empty() {
        let index = PatchFileIndex::load(Path::new("/nonexistent/patch"));
        assert!(index.is_empty());
    }
}
