//! Administrative paths: user updates, network updates, graceful stop.

mod common;

use common::{scratch_dir, test_config, FakeUpstream, TestClient, TestServer};
use pontoon::db::{self, Database};
use pontoon::user::Event;
use pontoon_proto::Message;

fn notice_containing<'a>(needle: &'a str) -> impl Fn(&Message) -> bool + 'a {
    move |msg: &Message| {
        msg.command == "NOTICE" && msg.param(1).is_some_and(|text| text.contains(needle))
    }
}

#[tokio::test]
async fn password_change_closes_downstreams() -> anyhow::Result<()> {
    let ts = TestServer::spawn(test_config()).await?;
    ts.create_user("alice", "pw").await?;

    let mut c1 = TestClient::connect(ts.addr, "alice", "pw", "alice", &[]).await?;
    let mut c2 = TestClient::connect(ts.addr, "alice@phone", "pw", "alice", &[]).await?;

    let events = ts
        .server
        .user_events("alice")
        .expect("user dispatcher running");
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    events
        .send(Event::UserUpdate {
            password: Some("hunter2".to_owned()),
            admin: None,
            done: done_tx,
        })
        .await
        .ok()
        .expect("dispatcher accepts events");

    done_rx.await?.expect("update succeeds");

    // Both clients are forced to re-authenticate.
    c1.expect_closed().await?;
    c2.expect_closed().await?;

    // The new password is persisted.
    let record = ts.db.get_user("alice").await?.expect("user exists");
    assert!(db::verify_password("hunter2", &record.password).is_ok());
    assert!(db::verify_password("pw", &record.password).is_err());

    // And works for a fresh connection.
    TestClient::connect(ts.addr, "alice", "hunter2", "alice", &[]).await?;
    Ok(())
}

#[tokio::test]
async fn network_limit_is_enforced() -> anyhow::Result<()> {
    let mut config = test_config();
    config.max_user_networks = 0;
    let ts = TestServer::spawn(config).await?;
    ts.create_user("alice", "pw").await?;

    let mut client = TestClient::connect(ts.addr, "alice", "pw", "alice", &[]).await?;
    client
        .send_line("PRIVMSG BouncerServ :network create -addr ircs://irc.example.org -name nope")
        .await?;
    client
        .recv_until(notice_containing("maximum number of networks"))
        .await?;

    client.send_line("PRIVMSG BouncerServ :network status").await?;
    client
        .recv_until(notice_containing("no networks configured"))
        .await?;
    Ok(())
}

#[tokio::test]
async fn update_network_rename_keeps_clients_and_moves_history() -> anyhow::Result<()> {
    let dir = scratch_dir("rename");
    let mut config = test_config();
    config.log_path = Some(dir.clone());
    let ts = TestServer::spawn(config).await?;
    ts.create_user("alice", "pw").await?;

    let fake = FakeUpstream::bind().await?;
    let mut admin = TestClient::connect(
        ts.addr,
        "alice",
        "pw",
        "alice",
        &["soju.im/bouncer-networks", "soju.im/bouncer-networks-notify"],
    )
    .await?;
    admin
        .send_line(&format!(
            "PRIVMSG BouncerServ :network create -addr {} -name liberachat",
            fake.url()
        ))
        .await?;
    admin
        .recv_until(notice_containing("created network"))
        .await?;
    let mut up = fake.accept().await?;
    admin
        .recv_until(|msg| {
            msg.command == "BOUNCER"
                && msg.param(2).is_some_and(|attrs| attrs.contains("state=connected"))
        })
        .await?;

    let mut bound = TestClient::connect(ts.addr, "alice/liberachat", "pw", "alice", &[]).await?;
    bound.send_line("JOIN #chan").await?;
    up.expect_join("#chan").await?;
    bound.recv_until(|msg| msg.command == "366").await?;

    // Produce some on-disk history under the old name.
    up.privmsg("bob", "#chan", "hello there").await?;
    bound
        .recv_until(|msg| msg.command == "PRIVMSG" && msg.param(1) == Some("hello there"))
        .await?;
    assert!(dir.join("alice").join("liberachat").exists());

    admin
        .send_line("PRIVMSG BouncerServ :network update liberachat -name libera")
        .await?;
    admin
        .recv_until(|msg| {
            msg.command == "BOUNCER"
                && msg.param(1).is_some()
                && msg.param(2).is_some_and(|attrs| attrs.contains("name=libera"))
        })
        .await?;

    // The on-disk tree followed the rename.
    assert!(dir.join("alice").join("libera").exists());
    assert!(!dir.join("alice").join("liberachat").exists());

    // The old connection is replaced by a fresh one.
    let _up2 = fake.accept().await?;

    // The bound client survived the update.
    bound.send_line("PING :still-here").await?;
    bound
        .recv_until(|msg| msg.command == "PONG" && msg.param(1) == Some("still-here"))
        .await?;

    Ok(())
}

#[tokio::test]
async fn graceful_stop_persists_delivery_receipts() -> anyhow::Result<()> {
    let dir = scratch_dir("stop");
    let db_path = dir.join("bouncer.db");
    let mut config = test_config();
    config.log_path = Some(dir.clone());
    let ts = TestServer::spawn_with_db(config, db_path.to_str().expect("utf-8 path")).await?;
    let user = ts.create_user("alice", "pw").await?;

    let fake = FakeUpstream::bind().await?;
    let mut admin = TestClient::connect(ts.addr, "alice", "pw", "alice", &[]).await?;
    admin
        .send_line(&format!(
            "PRIVMSG BouncerServ :network create -addr {} -name testnet",
            fake.url()
        ))
        .await?;
    admin
        .recv_until(notice_containing("created network"))
        .await?;
    let mut up = fake.accept().await?;
    admin
        .recv_until(notice_containing("connected to testnet"))
        .await?;

    let mut bound =
        TestClient::connect(ts.addr, "alice/testnet@phone", "pw", "alice", &[]).await?;
    bound.send_line("JOIN #a").await?;
    up.expect_join("#a").await?;
    bound.recv_until(|msg| msg.command == "366").await?;

    up.privmsg("bob", "#a", "remember me").await?;
    bound
        .recv_until(|msg| msg.command == "PRIVMSG" && msg.param(1) == Some("remember me"))
        .await?;

    ts.server.shutdown().await;
    bound.expect_closed().await?;
    admin.expect_closed().await?;

    // Every checkpoint that was in memory at Stop made it to storage.
    let db = Database::open(db_path.to_str().expect("utf-8 path")).await?;
    let networks = db.list_networks(user.id).await?;
    assert_eq!(networks.len(), 1);
    let receipts = db.list_delivery_receipts(networks[0].id).await?;
    let phone = receipts
        .iter()
        .find(|receipt| receipt.client == "phone" && receipt.target == "#a")
        .expect("receipt for the phone client on #a");
    assert!(!phone.internal_msg_id.is_empty());
    Ok(())
}
