//! Integration tests for the login phase: account creation, the ship
//! menu, reconnects, banned accounts, and shared-account Guild Card
//! derivation.

mod common;

use common::{TestClient, TestServer};
use ragol_proto::command::{
    cmd, JoinHeader, LoginBb, LoginV2, MenuSelection, PlayerEntry, Reconnect,
};
use ragol_proto::crypt::BbPrivateKey;
use ragol_proto::{fnv1a32, fnv1a32_with, Version};

#[tokio::test]
async fn pc_login_creates_account_and_reconnects_to_ship() {
    let server = TestServer::spawn(
        "pc-login",
        &[16801, 16802],
        r#"
[[listen]]
name = "pc-login"
addr = "127.0.0.1"
port = 16801
version = "pc-v2"
behavior = "login_server"

[[listen]]
name = "pc-lobby"
addr = "127.0.0.1"
port = 16802
version = "pc-v2"
behavior = "lobby_server"
"#,
    )
    .await
    .expect("server spawn");

    let mut client = TestClient::connect(16801, Version::PcV2, None)
        .await
        .expect("connect");
    let login = LoginV2 {
        player_tag: 0x0001_0000,
        serial_number: "00ABCDEF".into(),
        access_key: "12345678".into(),
        character_name: "Alice".into(),
        sub_version: 0x29,
        language: 1,
        ..Default::default()
    };
    client.send(cmd::LOGIN_V2, 0, &login.encode()).await.unwrap();

    // Ship menu with the one configured lobby listener.
    let menu = client.expect_command(cmd::MENU).await.expect("ship menu");
    assert!(!menu.payload.is_empty(), "menu should have entries");

    // The account persisted as ten decimal digits of 0x00ABCDEF.
    assert!(server.licenses_dir().join("0011259375.json").exists());

    // Selecting the ship redirects to the lobby port.
    let selection = MenuSelection {
        menu_id: 0x21,
        item_id: 1, // index of pc-lobby in the listen list
        password: Vec::new(),
    };
    client
        .send(cmd::MENU_SELECTION, 0, &selection.encode())
        .await
        .unwrap();
    let reconnect = client.expect_command(cmd::RECONNECT).await.expect("reconnect");
    let parsed = Reconnect::parse(&reconnect.payload).unwrap();
    assert_eq!(parsed.port, 16802);
    assert_eq!(parsed.address, std::net::Ipv4Addr::new(127, 0, 0, 1));
}

#[tokio::test]
async fn wrong_access_key_is_rejected_with_message_box() {
    let _server = TestServer::spawn(
        "pc-wrong-key",
        &[16811],
        r#"
[[listen]]
name = "pc-login"
addr = "127.0.0.1"
port = 16811
version = "pc-v2"
behavior = "login_server"
"#,
    )
    .await
    .expect("server spawn");

    // First login registers the account.
    let mut first = TestClient::connect(16811, Version::PcV2, None).await.unwrap();
    let login = LoginV2 {
        serial_number: "00000042".into(),
        access_key: "12345678".into(),
        character_name: "Alice".into(),
        ..Default::default()
    };
    first.send(cmd::LOGIN_V2, 0, &login.encode()).await.unwrap();
    first.expect_command(cmd::MENU).await.expect("menu");

    // Second login with a wrong key is refused and disconnected.
    let mut second = TestClient::connect(16811, Version::PcV2, None).await.unwrap();
    let bad = LoginV2 {
        serial_number: "00000042".into(),
        access_key: "87654321".into(),
        character_name: "Alice".into(),
        ..Default::default()
    };
    second.send(cmd::LOGIN_V2, 0, &bad.encode()).await.unwrap();
    second
        .expect_command(cmd::MESSAGE_BOX)
        .await
        .expect("reject message box");
    second.expect_close_without(cmd::MENU).await.unwrap();
}

#[tokio::test]
async fn bb_banned_account_gets_message_box_and_no_menu() {
    let key_table = BbPrivateKey::from_seed(7);
    let key_bytes = key_table.to_bytes();

    let far_future = chrono::Utc::now().timestamp() as u64 + 3600;
    let account_json = format!(
        r#"{{
            "FormatVersion": 1,
            "AccountID": "0x01000001",
            "BanEndTime": {far_future},
            "BBLicenses": [{{"UserName": "foo", "Password": "bar"}}]
        }}"#
    );

    let _server = TestServer::spawn_prepared(
        "bb-banned",
        &[16821],
        r#"
[[listen]]
name = "bb-login"
addr = "127.0.0.1"
port = 16821
version = "bb-v4"
behavior = "login_server"
bb_key_file = "%DATA%/bb-key.bin"
"#,
        |data_dir| {
            std::fs::write(data_dir.join("bb-key.bin"), &key_bytes)?;
            std::fs::write(
                data_dir.join("licenses").join("0016777217.json"),
                &account_json,
            )?;
            Ok(())
        },
    )
    .await
    .expect("server spawn");

    let mut client = TestClient::connect(16821, Version::BbV4, Some(&key_table))
        .await
        .expect("connect");
    let login = LoginBb {
        username: "foo".into(),
        password: "bar".into(),
        sub_version: 0x41,
        ..Default::default()
    };
    client.send(cmd::LOGIN_93, 0, &login.encode()).await.unwrap();

    client
        .expect_command(cmd::MESSAGE_BOX)
        .await
        .expect("ban message box");
    client.expect_close_without(cmd::MENU).await.unwrap();
}

#[tokio::test]
async fn shared_account_derives_distinct_guild_cards() {
    let account_json = r#"{
        "FormatVersion": 1,
        "AccountID": "0x02000002",
        "Flags": "0x80000000",
        "DCLicenses": [{"SerialNumber": 33554434, "AccessKey": "KEY12345"}]
    }"#;

    let _server = TestServer::spawn_prepared(
        "shared-account",
        &[16831],
        r#"
[[listen]]
name = "dc-lobby"
addr = "127.0.0.1"
port = 16831
version = "dc-v2"
behavior = "lobby_server"
"#,
        |data_dir| {
            std::fs::write(
                data_dir.join("licenses").join("0033554434.json"),
                account_json,
            )?;
            Ok(())
        },
    )
    .await
    .expect("server spawn");

    let join_as = |name: &'static str| async move {
        let mut client = TestClient::connect(16831, Version::DcV2, None).await.unwrap();
        let login = LoginV2 {
            serial_number: "02000002".into(),
            access_key: "KEY12345".into(),
            character_name: name.into(),
            ..Default::default()
        };
        client.send(cmd::LOGIN_V2, 0, &login.encode()).await.unwrap();
        let upload = PlayerEntry {
            name: name.into(),
            level: 10,
            ..Default::default()
        };
        client
            .send(cmd::PLAYER_DATA, 0, &upload.encode())
            .await
            .unwrap();
        let join = client.expect_command(cmd::JOIN_LOBBY).await.expect("join");
        // Our own entry is the one whose slot matches the header.
        let header = JoinHeader::parse(&join.payload).unwrap();
        let mut offset = JoinHeader::SIZE;
        let mut own = None;
        while offset + PlayerEntry::SIZE <= join.payload.len() {
            let entry = PlayerEntry::parse(&join.payload[offset..]).unwrap();
            if entry.client_id == header.client_id {
                own = Some(entry);
            }
            offset += PlayerEntry::SIZE;
        }
        (client, own.expect("own roster entry"))
    };

    let (_alice_conn, alice) = join_as("Alice").await;
    let (_bob_conn, bob) = join_as("Bob").await;

    let basis = fnv1a32(&0x0200_0002u32.to_le_bytes());
    assert_eq!(
        alice.guild_card_number,
        fnv1a32_with(b"KEY12345:Alice", basis)
    );
    assert_eq!(bob.guild_card_number, fnv1a32_with(b"KEY12345:Bob", basis));
    assert_ne!(alice.guild_card_number, bob.guild_card_number);
}
