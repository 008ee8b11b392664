//! Upstream reconnect behavior: bounded retries, de-duplicated error
//! notices, and the connected notice once the network comes up.

mod common;

use std::time::Duration;

use common::{test_config, FakeUpstream, TestClient, TestServer};
use pontoon_proto::Message;

fn notice_containing<'a>(needle: &'a str) -> impl Fn(&Message) -> bool + 'a {
    move |msg: &Message| {
        msg.command == "NOTICE" && msg.param(1).is_some_and(|text| text.contains(needle))
    }
}

#[tokio::test]
async fn reconnects_with_backoff_and_deduplicates_errors() -> anyhow::Result<()> {
    let ts = TestServer::spawn(test_config()).await?;
    ts.create_user("alice", "pw").await?;
    let mut client = TestClient::connect(ts.addr, "alice", "pw", "alice", &[]).await?;

    // Reserve a port, then close the listener so connects are refused.
    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let upstream_addr = reserved.local_addr()?;
    drop(reserved);

    client
        .send_line(&format!(
            "PRIVMSG BouncerServ :network create -addr irc+insecure://{upstream_addr} -name testnet"
        ))
        .await?;
    client
        .recv_until(notice_containing("created network"))
        .await?;

    // The first failure is reported...
    client
        .recv_until(notice_containing("failed connecting"))
        .await?;

    // ...and several more attempts happen while the port stays closed
    // (retry min is 50ms). Identical errors must stay silent.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Bring the upstream up on the reserved port; the loop reconnects.
    let listener = tokio::net::TcpListener::bind(upstream_addr).await?;
    let fake = FakeUpstream::from_listener(listener)?;
    let conn = fake.accept().await?;

    let seen = client
        .collect_until(notice_containing("connected to testnet"))
        .await?;
    let repeated_failures = seen
        .iter()
        .filter(|msg| notice_containing("failed connecting")(msg))
        .count();
    assert_eq!(
        repeated_failures, 0,
        "repeated identical connection errors must not produce notices"
    );

    drop(conn);
    Ok(())
}

#[tokio::test]
async fn disabled_networks_never_connect() -> anyhow::Result<()> {
    let ts = TestServer::spawn(test_config()).await?;
    ts.create_user("alice", "pw").await?;
    let mut client = TestClient::connect(ts.addr, "alice", "pw", "alice", &[]).await?;

    let fake = FakeUpstream::bind().await?;
    client
        .send_line(&format!(
            "PRIVMSG BouncerServ :network create -addr {} -name idle -enabled false",
            fake.url()
        ))
        .await?;
    client
        .recv_until(notice_containing("created network"))
        .await?;

    // Give a would-be reconnect loop ample time, then verify nothing
    // dialed in.
    tokio::time::sleep(Duration::from_millis(400)).await;
    client.send_line("PRIVMSG BouncerServ :network status").await?;
    let status = client
        .recv_until(notice_containing("idle"))
        .await?;
    assert!(status.param(1).is_some_and(|text| text.contains("disconnected")));
    Ok(())
}
