//! Integration test for the patch protocol: checksum exchange, the
//! directory walk, and chunked file delivery for mismatched files.

mod common;

use common::{TestClient, TestServer};
use ragol_proto::command::{patch_cmd, PayloadReader};
use ragol_proto::Version;

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[tokio::test]
async fn patch_session_pushes_only_mismatched_files() {
    let fresh_data = b"fresh content the client already has".to_vec();
    let stale_data = b"server-side content the client lacks, longer than one line".to_vec();
    let fresh_crc = crc32(&fresh_data);

    let _server = TestServer::spawn_prepared(
        "patch",
        &[16881],
        r#"
[[listen]]
name = "pc-patch"
addr = "127.0.0.1"
port = 16881
version = "patch"
behavior = "patch_server"

[patch]
directory = "%DATA%/patch"
"#,
        |data_dir| {
            let root = data_dir.join("patch");
            std::fs::create_dir_all(root.join("data"))?;
            std::fs::write(root.join("fresh.bin"), b"fresh content the client already has")?;
            std::fs::write(
                root.join("data").join("stale.bin"),
                b"server-side content the client lacks, longer than one line",
            )?;
            Ok(())
        },
    )
    .await
    .expect("server spawn");

    let mut client = TestClient::connect(16881, Version::Patch, None)
        .await
        .expect("connect");

    // Credentials are accepted without lookup by default.
    client.send(patch_cmd::LOGIN, 0, &[0u8; 0x2C]).await.unwrap();

    // Collect checksum requests until the end marker, remembering the
    // request ids and directory context.
    let mut requests: Vec<(u32, String, Vec<String>)> = Vec::new();
    let mut dirs: Vec<String> = Vec::new();
    loop {
        let frame = client
            .recv_timeout(std::time::Duration::from_secs(5))
            .await
            .expect("checksum phase frame");
        match frame.command {
            patch_cmd::ENTER_DIRECTORY => {
                let mut r = PayloadReader::new(&frame.payload);
                dirs.push(r.get_ascii(0x40).unwrap());
            }
            patch_cmd::EXIT_DIRECTORY => {
                dirs.pop();
            }
            patch_cmd::FILE_CHECKSUM_REQUEST => {
                let mut r = PayloadReader::new(&frame.payload);
                let request_id = r.get_u32().unwrap();
                let name = r.get_ascii(0x20).unwrap();
                requests.push((request_id, name, dirs.clone()));
            }
            patch_cmd::END_FILE_CHECKSUMS => break,
            _ => {}
        }
    }

    // Both files were offered; the root file sorts before the data/ one.
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].1, "fresh.bin");
    assert!(requests[0].2.is_empty());
    assert_eq!(requests[1].1, "stale.bin");
    assert_eq!(requests[1].2, vec!["data".to_string()]);

    // Report a match for fresh.bin and a mismatch for stale.bin.
    for (request_id, name, _) in &requests {
        let (reported_crc, reported_size) = if name == "fresh.bin" {
            (fresh_crc, fresh_data.len() as u32)
        } else {
            (0xBAD0_BAD0u32, 1)
        };
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&request_id.to_le_bytes());
        payload.extend_from_slice(&reported_crc.to_le_bytes());
        payload.extend_from_slice(&reported_size.to_le_bytes());
        client
            .send(patch_cmd::FILE_INFORMATION, 0, &payload)
            .await
            .unwrap();
    }
    client
        .send(patch_cmd::FILE_INFORMATION_DONE, 0, &[])
        .await
        .unwrap();

    // Summary announces exactly one file to download.
    let summary = client
        .expect_command(patch_cmd::START_FILE_DOWNLOADS)
        .await
        .expect("download summary");
    let mut r = PayloadReader::new(&summary.payload);
    let total_size = r.get_u32().unwrap();
    let num_files = r.get_u32().unwrap();
    assert_eq!(num_files, 1);
    assert_eq!(total_size as usize, stale_data.len());

    // The download navigates into data/, opens, writes, closes, then the
    // update ends.
    let open = client
        .expect_command(patch_cmd::OPEN_FILE)
        .await
        .expect("open file");
    let mut r = PayloadReader::new(&open.payload);
    let _pad = r.get_u32().unwrap();
    let size = r.get_u32().unwrap();
    let name = r.get_ascii(0x30).unwrap();
    assert_eq!(name, "stale.bin");
    assert_eq!(size as usize, stale_data.len());

    let mut received = Vec::new();
    loop {
        let frame = client
            .recv_timeout(std::time::Duration::from_secs(5))
            .await
            .expect("write phase frame");
        match frame.command {
            patch_cmd::WRITE_FILE => {
                let mut r = PayloadReader::new(&frame.payload);
                let _chunk_index = r.get_u32().unwrap();
                let chunk_crc = r.get_u32().unwrap();
                let chunk_size = r.get_u32().unwrap() as usize;
                let chunk = r.get_bytes(chunk_size).unwrap();
                assert_eq!(chunk_crc, crc32(chunk));
                received.extend_from_slice(chunk);
            }
            patch_cmd::CLOSE_FILE => break,
            _ => {}
        }
    }
    assert_eq!(received, stale_data);

    client
        .expect_command(patch_cmd::END_OF_UPDATE)
        .await
        .expect("end of update");
}
