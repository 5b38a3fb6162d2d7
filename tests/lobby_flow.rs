//! Integration tests for the lobby/game runtime: joins, deltas, player
//! departures, game creation, and empty-game destruction.

mod common;

use std::time::Duration;

use common::{TestClient, TestServer};
use ragol_proto::command::{
    cmd, CreateGame, JoinHeader, LoginV2, MenuSelection, PlayerEntry, PlayerLeave,
};
use ragol_proto::Version;

const CONFIG: &str = r#"
[[listen]]
name = "dc-lobby"
addr = "127.0.0.1"
port = 16841
version = "dc-v2"
behavior = "lobby_server"

[game]
empty_game_linger_secs = 0
"#;

async fn login_and_join(port: u16, serial: &str, name: &str) -> (TestClient, JoinHeader) {
    let mut client = TestClient::connect(port, Version::DcV2, None).await.unwrap();
    let login = LoginV2 {
        serial_number: serial.into(),
        access_key: "12345678".into(),
        character_name: name.into(),
        ..Default::default()
    };
    client.send(cmd::LOGIN_V2, 0, &login.encode()).await.unwrap();
    let upload = PlayerEntry {
        name: name.into(),
        level: 5,
        ..Default::default()
    };
    client.send(cmd::PLAYER_DATA, 0, &upload.encode()).await.unwrap();
    let join = client.expect_command(cmd::JOIN_LOBBY).await.expect("lobby join");
    let header = JoinHeader::parse(&join.payload).unwrap();
    (client, header)
}

#[tokio::test]
async fn lobby_join_delta_and_departure() {
    let _server = TestServer::spawn("lobby-join", &[16841], CONFIG)
        .await
        .expect("server spawn");

    let (mut alice, alice_header) = login_and_join(16841, "00000101", "Alice").await;
    assert_eq!(alice_header.client_id, 0);
    assert_eq!(alice_header.leader_id, 0);

    let (bob, bob_header) = login_and_join(16841, "00000102", "Bob").await;
    assert_eq!(bob_header.client_id, 1);

    // Alice sees Bob arrive.
    let delta = alice
        .expect_command(cmd::ADD_LOBBY_PLAYER)
        .await
        .expect("join delta");
    assert_eq!(delta.flag, 1);
    let entry = PlayerEntry::parse(&delta.payload[JoinHeader::SIZE..]).unwrap();
    assert_eq!(entry.name, "Bob");
    assert_eq!(entry.client_id, 1);

    // Bob's departure notifies Alice with the vacated slot.
    drop(bob);
    let leave = alice
        .expect_command(cmd::REMOVE_LOBBY_PLAYER)
        .await
        .expect("leave notice");
    let parsed = PlayerLeave::parse(&leave.payload).unwrap();
    assert_eq!(parsed.client_id, 1);
    assert_eq!(parsed.leader_id, 0);
}

#[tokio::test]
async fn game_create_join_and_empty_destruction() {
    let config = CONFIG.replace("16841", "16851");
    let _server = TestServer::spawn("game-flow", &[16851], &config)
        .await
        .expect("server spawn");

    let (mut alice, _) = login_and_join(16851, "00000201", "Alice").await;
    let (mut bob, _) = login_and_join(16851, "00000202", "Bob").await;
    // Drain Alice's view of Bob arriving.
    alice.expect_command(cmd::ADD_LOBBY_PLAYER).await.unwrap();

    // Alice creates a game; she leaves the lobby (Bob hears it) and joins
    // the fresh game as leader.
    let create = CreateGame {
        name: "testgame".into(),
        episode: 1,
        difficulty: 1,
        ..Default::default()
    };
    alice.send(cmd::CREATE_GAME, 0, &create.encode()).await.unwrap();
    let game_join = alice.expect_command(cmd::JOIN_GAME).await.expect("game join");
    let game_header = JoinHeader::parse(&game_join.payload).unwrap();
    assert_eq!(game_header.client_id, 0);
    assert_eq!(game_header.difficulty, 1);
    bob.expect_command(cmd::REMOVE_LOBBY_PLAYER).await.unwrap();

    // Bob finds the game in the list and joins it.
    bob.send(cmd::GAME_LIST_REQUEST, 0, &[]).await.unwrap();
    let list = bob.expect_command(cmd::MENU).await.expect("game list");
    assert!(!list.payload.is_empty(), "game list should show testgame");
    let game_id = u32::from_le_bytes([
        list.payload[4],
        list.payload[5],
        list.payload[6],
        list.payload[7],
    ]);
    let select = MenuSelection {
        menu_id: 0x22,
        item_id: game_id,
        password: Vec::new(),
    };
    bob.send(cmd::MENU_SELECTION, 0, &select.encode()).await.unwrap();
    bob.expect_command(cmd::JOIN_GAME).await.expect("bob joins game");
    alice.expect_command(cmd::ADD_GAME_PLAYER).await.expect("alice sees bob");

    // Both leave; the empty non-persistent game is destroyed after its
    // linger, observable through an empty game list.
    drop(alice);
    drop(bob);

    let (mut carol, _) = login_and_join(16851, "00000203", "Carol").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        carol.send(cmd::GAME_LIST_REQUEST, 0, &[]).await.unwrap();
        let list = carol.expect_command(cmd::MENU).await.expect("game list");
        if list.payload.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "empty game was never destroyed"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[tokio::test]
async fn chat_broadcasts_to_lobby() {
    let config = CONFIG.replace("16841", "16861");
    let _server = TestServer::spawn("chat", &[16861], &config)
        .await
        .expect("server spawn");

    let (mut alice, _) = login_and_join(16861, "00000301", "Alice").await;
    let (mut bob, _) = login_and_join(16861, "00000302", "Bob").await;
    alice.expect_command(cmd::ADD_LOBBY_PLAYER).await.unwrap();

    let mut payload = Vec::new();
    payload.extend_from_slice(&0x0001_0000u32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&ragol_proto::command::encode_text(
        Version::DcV2,
        "hello from alice",
    ));
    alice.send(cmd::CHAT, 0, &payload).await.unwrap();

    // Both sides see the line, sender included.
    let seen = alice.expect_command(cmd::CHAT).await.expect("alice echo");
    assert!(ragol_proto::command::decode_text(Version::DcV2, &seen.payload[8..])
        .contains("hello from alice"));
    let seen = bob.expect_command(cmd::CHAT).await.expect("bob receives");
    assert!(ragol_proto::command::decode_text(Version::DcV2, &seen.payload[8..])
        .contains("hello from alice"));
}
