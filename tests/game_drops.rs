//! Server-authoritative drops on Blue Burst: every player sees the same
//! item with the same id under the shared drop mode.

mod common;

use common::{TestClient, TestServer};
use ragol_proto::command::{
    cmd, subcmd, CreateGame, JoinHeader, LoginBb, MenuSelection, PlayerEntry, SubcommandHeader,
};
use ragol_proto::crypt::BbPrivateKey;
use ragol_proto::{Frame, Version};

async fn bb_login_and_join(
    port: u16,
    key: &BbPrivateKey,
    username: &str,
) -> (TestClient, JoinHeader) {
    let mut client = TestClient::connect(port, Version::BbV4, Some(key)).await.unwrap();
    let login = LoginBb {
        username: username.into(),
        password: "pw".into(),
        sub_version: 0x41,
        ..Default::default()
    };
    client.send(cmd::LOGIN_93, 0, &login.encode()).await.unwrap();
    client.expect_command(cmd::BB_SECURITY).await.expect("security blob");
    let upload = PlayerEntry {
        name: username.into(),
        level: 20,
        ..Default::default()
    };
    client.send(cmd::PLAYER_DATA, 0, &upload.encode()).await.unwrap();
    let join = client.expect_command(cmd::JOIN_LOBBY).await.expect("lobby join");
    let header = JoinHeader::parse(&join.payload).unwrap();
    (client, header)
}

/// The 0x60 enemy-drop request body after the sub-command header.
fn drop_request(entity_id: u16, floor: u8, x: f32, z: f32) -> Vec<u8> {
    let mut payload = SubcommandHeader {
        subcommand: subcmd::ENEMY_DROP_ITEM_REQUEST,
        size_units: 4,
        param: entity_id,
    }
    .encode()
    .to_vec();
    payload.push(floor);
    payload.push(0);
    payload.extend_from_slice(&entity_id.to_le_bytes());
    payload.extend_from_slice(&x.to_bits().to_le_bytes());
    payload.extend_from_slice(&z.to_bits().to_le_bytes());
    payload
}

fn floor_item_id(frame: &Frame) -> Option<u32> {
    let header = SubcommandHeader::parse(&frame.payload).ok()?;
    if header.subcommand != subcmd::CREATE_FLOOR_ITEM {
        return None;
    }
    let bytes = frame.payload.get(16..20)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[tokio::test]
async fn shared_drop_gives_every_player_the_same_item_id() {
    let key_table = BbPrivateKey::from_seed(11);
    let key_bytes = key_table.to_bytes();

    let _server = TestServer::spawn_prepared(
        "bb-drops",
        &[16871],
        r#"
[[listen]]
name = "bb-lobby"
addr = "127.0.0.1"
port = 16871
version = "bb-v4"
behavior = "lobby_server"
bb_key_file = "%DATA%/bb-key.bin"
"#,
        |data_dir| {
            std::fs::write(data_dir.join("bb-key.bin"), &key_bytes)?;
            Ok(())
        },
    )
    .await
    .expect("server spawn");

    let (mut alice, _) = bb_login_and_join(16871, &key_table, "alice").await;
    let (mut bob, _) = bb_login_and_join(16871, &key_table, "bob").await;
    alice.expect_command(cmd::ADD_LOBBY_PLAYER).await.unwrap();

    // Alice creates a game and Bob joins it.
    let create = CreateGame {
        name: "droptest".into(),
        episode: 1,
        difficulty: 0,
        ..Default::default()
    };
    alice.send(cmd::CREATE_GAME_BB, 0, &create.encode()).await.unwrap();
    alice.expect_command(cmd::JOIN_GAME).await.expect("game join");
    bob.expect_command(cmd::REMOVE_LOBBY_PLAYER).await.unwrap();

    bob.send(cmd::GAME_LIST_REQUEST, 0, &[]).await.unwrap();
    let list = bob.expect_command(cmd::MENU).await.expect("game list");
    let game_id = u32::from_le_bytes([
        list.payload[4],
        list.payload[5],
        list.payload[6],
        list.payload[7],
    ]);
    bob.send(
        cmd::MENU_SELECTION,
        0,
        &MenuSelection {
            menu_id: 0x22,
            item_id: game_id,
            password: Vec::new(),
        }
        .encode(),
    )
    .await
    .unwrap();
    bob.expect_command(cmd::JOIN_GAME).await.expect("bob in game");
    alice.expect_command(cmd::ADD_GAME_PLAYER).await.unwrap();

    // Kill-driven drop requests: the BB default mode is server-shared, so
    // both players must observe the same create with the same id. A single
    // roll may legitimately come up empty, so request a batch; the first
    // created item is the one compared.
    for n in 0..20u16 {
        alice
            .send(cmd::GAME_COMMAND, 0, &drop_request(n, 2, 100.0, 200.0))
            .await
            .unwrap();
    }

    let alice_frames = alice
        .recv_until(|f| floor_item_id(f).is_some())
        .await
        .expect("alice sees the drop");
    let bob_frames = bob
        .recv_until(|f| floor_item_id(f).is_some())
        .await
        .expect("bob sees the drop");

    let alice_id = alice_frames.last().and_then(floor_item_id).unwrap();
    let bob_id = bob_frames.last().and_then(floor_item_id).unwrap();
    assert_eq!(alice_id, bob_id, "shared drops must share one item id");
    // Server-generated ids come from the server's namespace.
    assert!(alice_id >= 0x0081_0000);
}
