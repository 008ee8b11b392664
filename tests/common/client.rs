//! Line-level IRC test client.

use std::net::SocketAddr;

use anyhow::{bail, Context};
use futures_util::{SinkExt, StreamExt};
use pontoon_proto::Message;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

use super::RECV_TIMEOUT;

pub struct TestClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl TestClient {
    /// Connect and register against the bouncer. `username` may carry
    /// `/network` and `@client` suffixes; `caps` are requested verbatim.
    pub async fn connect(
        addr: SocketAddr,
        username: &str,
        password: &str,
        nick: &str,
        caps: &[&str],
    ) -> anyhow::Result<TestClient> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = TestClient {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(8192)),
        };

        if !caps.is_empty() {
            client.send_line("CAP LS 302").await?;
            client
                .recv_until(|msg| msg.command == "CAP" && msg.param(1) == Some("LS"))
                .await
                .context("waiting for CAP LS")?;
            client
                .send_line(&format!("CAP REQ :{}", caps.join(" ")))
                .await?;
            let reply = client
                .recv_until(|msg| {
                    msg.command == "CAP"
                        && (msg.param(1) == Some("ACK") || msg.param(1) == Some("NAK"))
                })
                .await?;
            if reply.param(1) == Some("NAK") {
                bail!("server refused caps {caps:?}");
            }
        }

        client.send_line(&format!("PASS {password}")).await?;
        client.send_line(&format!("NICK {nick}")).await?;
        client
            .send_line(&format!("USER {username} 0 * :Test User"))
            .await?;
        if !caps.is_empty() {
            client.send_line("CAP END").await?;
        }

        client
            .recv_until(|msg| msg.command == "376" || msg.command == "422")
            .await
            .context("waiting for end of welcome burst")?;
        Ok(client)
    }

    pub async fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.framed.send(line.to_owned()).await?;
        Ok(())
    }

    /// Next parsed message, within the test receive timeout.
    pub async fn recv(&mut self) -> anyhow::Result<Message> {
        loop {
            let line = timeout(RECV_TIMEOUT, self.framed.next())
                .await
                .context("timed out waiting for a message")?
                .context("connection closed")??;
            match line.parse::<Message>() {
                Ok(msg) => return Ok(msg),
                Err(_) => continue,
            }
        }
    }

    /// Read until a message matches, returning it. Non-matching messages
    /// are discarded.
    pub async fn recv_until(
        &mut self,
        pred: impl Fn(&Message) -> bool,
    ) -> anyhow::Result<Message> {
        Ok(self.collect_until(pred).await?.pop().expect("non-empty"))
    }

    /// Read until a message matches, returning everything read including
    /// the match (last element).
    pub async fn collect_until(
        &mut self,
        pred: impl Fn(&Message) -> bool,
    ) -> anyhow::Result<Vec<Message>> {
        let mut seen = Vec::new();
        loop {
            let msg = self.recv().await.with_context(|| {
                format!(
                    "while waiting for a match; saw: {:?}",
                    seen.iter().map(Message::to_string).collect::<Vec<_>>()
                )
            })?;
            let done = pred(&msg);
            seen.push(msg);
            if done {
                return Ok(seen);
            }
        }
    }

    /// Expect the server to close the connection.
    pub async fn expect_closed(&mut self) -> anyhow::Result<()> {
        loop {
            match timeout(RECV_TIMEOUT, self.framed.next())
                .await
                .context("timed out waiting for close")?
            {
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Ok(()),
            }
        }
    }
}
