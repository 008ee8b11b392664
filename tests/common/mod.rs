//! Integration test infrastructure: an in-process bouncer, a line-level
//! test client, and a scripted fake IRC server standing in for upstreams.

#![allow(dead_code)]

pub mod client;
pub mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use pontoon::config::{Config, RetryPolicy};
use pontoon::db::{self, Database, UserRecord};
use pontoon::server::Server;
use tokio::net::TcpListener;

pub use client::TestClient;
pub use upstream::FakeUpstream;

/// How long test clients wait for an expected line before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// A fresh per-test scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "pontoon-test-{name}-{}-{}",
        std::process::id(),
        rand_suffix()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("failed to create scratch dir");
    dir
}

fn rand_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos()
}

/// A config suitable for tests: fast reconnects, no jitter.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryPolicy {
        min: Duration::from_millis(50),
        max: Duration::from_millis(200),
        jitter: Duration::ZERO,
    };
    config
}

pub struct TestServer {
    pub server: Server,
    pub addr: SocketAddr,
    pub db: Database,
}

impl TestServer {
    /// Spawn an in-process bouncer on a random port with an in-memory
    /// database.
    pub async fn spawn(config: Config) -> anyhow::Result<TestServer> {
        Self::spawn_with_db(config, ":memory:").await
    }

    pub async fn spawn_with_db(config: Config, db_path: &str) -> anyhow::Result<TestServer> {
        let db = Database::open(db_path).await?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = Server::new(config, db.clone());
        server.start().await?;
        server.listen(listener);
        Ok(TestServer { server, addr, db })
    }

    /// Create a user with the given password and start its dispatcher.
    pub async fn create_user(&self, username: &str, password: &str) -> anyhow::Result<UserRecord> {
        let record = UserRecord {
            username: username.to_owned(),
            password: db::hash_password(password)?,
            ..UserRecord::default()
        };
        self.server.create_user(record).await?;
        Ok(self
            .db
            .get_user(username)
            .await?
            .expect("user just created"))
    }
}
