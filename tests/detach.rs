//! Channel detach and attach: synthetic PART/JOIN, relay suppression while
//! detached, and backlog replay from the detach checkpoint.

mod common;

use std::time::Duration;

use common::{scratch_dir, test_config, FakeUpstream, TestClient, TestServer};
use pontoon_proto::Message;

fn notice_containing<'a>(needle: &'a str) -> impl Fn(&Message) -> bool + 'a {
    move |msg: &Message| {
        msg.command == "NOTICE" && msg.param(1).is_some_and(|text| text.contains(needle))
    }
}

#[tokio::test]
async fn detach_then_backlog_on_attach() -> anyhow::Result<()> {
    let mut config = test_config();
    config.log_path = Some(scratch_dir("detach"));
    let ts = TestServer::spawn(config).await?;
    ts.create_user("alice", "pw").await?;

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

    let mut c1 = TestClient::connect(ts.addr, "alice/testnet", "pw", "alice", &[]).await?;
    c1.send_line("JOIN #a").await?;
    up.expect_join("#a").await?;
    c1.recv_until(|msg| msg.command == "JOIN" && msg.param(0) == Some("#a"))
        .await?;
    c1.recv_until(|msg| msg.command == "366").await?;

    // Delivered history before the detach.
    up.privmsg("bob", "#a", "one").await?;
    up.privmsg("bob", "#a", "two").await?;
    c1.recv_until(|msg| msg.command == "PRIVMSG" && msg.param(1) == Some("two"))
        .await?;

    // Detach: synthetic PART with reason "Detach".
    c1.send_line("PRIVMSG BouncerServ :channel update #a -detached true")
        .await?;
    let part = c1
        .recv_until(|msg| msg.command == "PART" && msg.param(0) == Some("#a"))
        .await?;
    assert_eq!(part.param(1), Some("Detach"));
    c1.recv_until(notice_containing("updated channel")).await?;

    // Messages arriving while detached are recorded but not relayed.
    up.privmsg("bob", "#a", "eleven").await?;
    up.privmsg("bob", "#a", "twelve").await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Re-attach by joining again.
    c1.send_line("JOIN #a").await?;
    let upto_join = c1
        .collect_until(|msg| msg.command == "JOIN" && msg.param(0) == Some("#a"))
        .await?;
    let leaked = upto_join
        .iter()
        .filter(|msg| msg.command == "PRIVMSG")
        .count();
    assert_eq!(leaked, 0, "detached messages must not be relayed live");

    // Topic/names first, then the replay of what was missed, in order.
    c1.recv_until(|msg| msg.command == "366").await?;
    let first = c1.recv_until(|msg| msg.command == "PRIVMSG").await?;
    assert_eq!(first.param(0), Some("#a"));
    assert_eq!(first.param(1), Some("eleven"));
    let second = c1.recv_until(|msg| msg.command == "PRIVMSG").await?;
    assert_eq!(second.param(1), Some("twelve"));

    Ok(())
}

#[tokio::test]
async fn detached_highlights_still_relay() -> anyhow::Result<()> {
    let mut config = test_config();
    config.log_path = Some(scratch_dir("hl"));
    let ts = TestServer::spawn(config).await?;
    ts.create_user("alice", "pw").await?;

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

    let mut c1 = TestClient::connect(ts.addr, "alice/testnet", "pw", "alice", &[]).await?;
    c1.send_line("JOIN #a").await?;
    up.expect_join("#a").await?;
    c1.recv_until(|msg| msg.command == "366").await?;

    c1.send_line("PRIVMSG BouncerServ :channel update #a -detached true")
        .await?;
    c1.recv_until(notice_containing("updated channel")).await?;

    // The default policy relays highlights even while detached.
    up.privmsg("bob", "#a", "alice: you around?").await?;
    let hl = c1.recv_until(|msg| msg.command == "PRIVMSG").await?;
    assert_eq!(hl.param(1), Some("alice: you around?"));

    Ok(())
}
