//! Scripted fake IRC server, standing in for a remote network.

use std::net::SocketAddr;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use pontoon_proto::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

use super::RECV_TIMEOUT;

pub const FAKE_SERVER_NAME: &str = "fake.example.org";

pub struct FakeUpstream {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl FakeUpstream {
    pub async fn bind() -> anyhow::Result<FakeUpstream> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Self::from_listener(listener)
    }

    pub fn from_listener(listener: TcpListener) -> anyhow::Result<FakeUpstream> {
        let addr = listener.local_addr()?;
        Ok(FakeUpstream { listener, addr })
    }

    /// The `irc+insecure://` URL the bouncer should dial.
    pub fn url(&self) -> String {
        format!("irc+insecure://{}", self.addr)
    }

    /// Accept one connection from the bouncer and walk it through
    /// registration.
    pub async fn accept(&self) -> anyhow::Result<FakeUpstreamConn> {
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .context("timed out waiting for the bouncer to connect")??;
        let mut conn = FakeUpstreamConn {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(8192)),
            nick: String::new(),
        };
        conn.registration().await?;
        Ok(conn)
    }
}

pub struct FakeUpstreamConn {
    framed: Framed<TcpStream, LinesCodec>,
    pub nick: String,
}

impl FakeUpstreamConn {
    async fn registration(&mut self) -> anyhow::Result<()> {
        loop {
            let msg = self.recv().await.context("during registration")?;
            match msg.command.as_str() {
                "CAP" if msg.param(0) == Some("LS") => {
                    self.send_line(&format!(":{FAKE_SERVER_NAME} CAP * LS :"))
                        .await?;
                }
                "NICK" => {
                    self.nick = msg.param(0).unwrap_or_default().to_owned();
                }
                "USER" => {}
                "PASS" => {}
                "PING" => {
                    let token = msg.param(0).unwrap_or_default().to_owned();
                    self.send_line(&format!(":{FAKE_SERVER_NAME} PONG {FAKE_SERVER_NAME} :{token}"))
                        .await?;
                }
                "CAP" if msg.param(0) == Some("END") => {
                    let nick = self.nick.clone();
                    self.send_line(&format!(
                        ":{FAKE_SERVER_NAME} 001 {nick} :Welcome to FakeNet, {nick}"
                    ))
                    .await?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    pub async fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.framed.send(line.to_owned()).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<Message> {
        loop {
            let line = timeout(RECV_TIMEOUT, self.framed.next())
                .await
                .context("timed out waiting for the bouncer")?
                .context("bouncer closed the connection")??;
            match line.parse::<Message>() {
                Ok(msg) => return Ok(msg),
                Err(_) => continue,
            }
        }
    }

    pub async fn recv_until(
        &mut self,
        pred: impl Fn(&Message) -> bool,
    ) -> anyhow::Result<Message> {
        loop {
            let msg = self.recv().await?;
            if pred(&msg) {
                return Ok(msg);
            }
        }
    }

    /// Wait for the bouncer to JOIN `channel`, then confirm it with the
    /// usual burst.
    pub async fn expect_join(&mut self, channel: &str) -> anyhow::Result<()> {
        self.recv_until(|msg| msg.command == "JOIN" && msg.param(0) == Some(channel))
            .await
            .context("waiting for JOIN")?;
        let nick = self.nick.clone();
        self.send_line(&format!(":{nick}!u@{FAKE_SERVER_NAME} JOIN {channel}"))
            .await?;
        self.send_line(&format!(
            ":{FAKE_SERVER_NAME} 353 {nick} = {channel} :{nick} visitor"
        ))
        .await?;
        self.send_line(&format!(
            ":{FAKE_SERVER_NAME} 366 {nick} {channel} :End of /NAMES list"
        ))
        .await?;
        Ok(())
    }

    /// Deliver a channel or private message from some remote user.
    pub async fn privmsg(&mut self, from: &str, target: &str, text: &str) -> anyhow::Result<()> {
        self.send_line(&format!(
            ":{from}!u@{FAKE_SERVER_NAME} PRIVMSG {target} :{text}"
        ))
        .await
    }
}
