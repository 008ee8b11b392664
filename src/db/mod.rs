//! Persistent storage.
//!
//! Async SQLite access through SQLx for the bouncer's durable state:
//! - user accounts
//! - network records and channel memberships
//! - delivery receipts
//! - Web Push subscriptions
//!
//! Runtime state (connections, delivered checkpoints in memory) never lives
//! here; the per-user dispatcher is the only writer of these tables while a
//! user is running.

mod records;

pub use records::{
    ChannelRecord, DeliveryReceipt, NetworkRecord, RelayPolicy, SaslConfig, UserRecord,
    WebPushSubscription,
};

use std::time::Duration;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("user {0:?} already exists")]
    UserExists(String),
    #[error("invalid password")]
    InvalidPassword,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL DEFAULT '',
    admin INTEGER NOT NULL DEFAULT 0,
    realname TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS networks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL DEFAULT '',
    addr TEXT NOT NULL,
    nick TEXT NOT NULL DEFAULT '',
    username TEXT NOT NULL DEFAULT '',
    realname TEXT NOT NULL DEFAULT '',
    pass TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    sasl_mechanism TEXT NOT NULL DEFAULT '',
    sasl_plain_username TEXT NOT NULL DEFAULT '',
    sasl_plain_password TEXT NOT NULL DEFAULT '',
    sasl_external_cert BLOB
);

CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network_id INTEGER NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    key TEXT NOT NULL DEFAULT '',
    detached INTEGER NOT NULL DEFAULT 0,
    detached_internal_msgid TEXT,
    relay_detached TEXT NOT NULL DEFAULT 'default',
    detach_after INTEGER NOT NULL DEFAULT 0,
    UNIQUE(network_id, name)
);

CREATE TABLE IF NOT EXISTS delivery_receipts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network_id INTEGER NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    target TEXT NOT NULL,
    client TEXT NOT NULL,
    internal_msgid TEXT NOT NULL,
    UNIQUE(network_id, target, client)
);

CREATE TABLE IF NOT EXISTS webpush_subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network_id INTEGER NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    endpoint TEXT NOT NULL,
    key_auth TEXT NOT NULL DEFAULT '',
    key_p256dh TEXT NOT NULL DEFAULT '',
    key_vapid TEXT NOT NULL DEFAULT ''
);
";

/// Database handle with connection pool. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connection acquire timeout, so a wedged pool cannot stall the
    /// dispatcher indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Open (creating if missing) and apply the schema.
    pub async fn open(path: &str) -> Result<Self, DbError> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::new()
                .filename("file::memory:")
                .shared_cache(true)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        }
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(if path == ":memory:" { 1 } else { 5 })
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!(path = %path, "database opened");

        Ok(Database { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub async fn list_users(&self) -> Result<Vec<UserRecord>, DbError> {
        let rows = sqlx::query("SELECT id, username, password, admin, realname FROM users")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<UserRecord>, DbError> {
        let row = sqlx::query(
            "SELECT id, username, password, admin, realname FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    /// Insert (id 0) or update a user record; the record's id is filled in
    /// on insert.
    pub async fn store_user(&self, user: &mut UserRecord) -> Result<(), DbError> {
        if user.id == 0 {
            let res = sqlx::query(
                "INSERT INTO users (username, password, admin, realname) VALUES (?, ?, ?, ?)",
            )
            .bind(&user.username)
            .bind(&user.password)
            .bind(user.admin)
            .bind(&user.realname)
            .execute(&self.pool)
            .await?;
            user.id = res.last_insert_rowid();
        } else {
            sqlx::query(
                "UPDATE users SET username = ?, password = ?, admin = ?, realname = ? WHERE id = ?",
            )
            .bind(&user.username)
            .bind(&user.password)
            .bind(user.admin)
            .bind(&user.realname)
            .bind(user.id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub async fn list_networks(&self, user_id: i64) -> Result<Vec<NetworkRecord>, DbError> {
        let rows = sqlx::query(
            "SELECT id, name, addr, nick, username, realname, pass, enabled, \
             sasl_mechanism, sasl_plain_username, sasl_plain_password, sasl_external_cert \
             FROM networks WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(network_from_row).collect())
    }

    pub async fn store_network(
        &self,
        user_id: i64,
        network: &mut NetworkRecord,
    ) -> Result<(), DbError> {
        if network.id == 0 {
            let res = sqlx::query(
                "INSERT INTO networks (user_id, name, addr, nick, username, realname, pass, \
                 enabled, sasl_mechanism, sasl_plain_username, sasl_plain_password, \
                 sasl_external_cert) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(&network.name)
            .bind(&network.addr)
            .bind(&network.nick)
            .bind(&network.username)
            .bind(&network.realname)
            .bind(&network.pass)
            .bind(network.enabled)
            .bind(&network.sasl.mechanism)
            .bind(&network.sasl.plain_username)
            .bind(&network.sasl.plain_password)
            .bind(&network.sasl.external_cert)
            .execute(&self.pool)
            .await?;
            network.id = res.last_insert_rowid();
        } else {
            sqlx::query(
                "UPDATE networks SET name = ?, addr = ?, nick = ?, username = ?, realname = ?, \
                 pass = ?, enabled = ?, sasl_mechanism = ?, sasl_plain_username = ?, \
                 sasl_plain_password = ?, sasl_external_cert = ? WHERE id = ? AND user_id = ?",
            )
            .bind(&network.name)
            .bind(&network.addr)
            .bind(&network.nick)
            .bind(&network.username)
            .bind(&network.realname)
            .bind(&network.pass)
            .bind(network.enabled)
            .bind(&network.sasl.mechanism)
            .bind(&network.sasl.plain_username)
            .bind(&network.sasl.plain_password)
            .bind(&network.sasl.external_cert)
            .bind(network.id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_network(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM networks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Channels
    // ========================================================================

    pub async fn list_channels(&self, network_id: i64) -> Result<Vec<ChannelRecord>, DbError> {
        let rows = sqlx::query(
            "SELECT id, name, key, detached, detached_internal_msgid, relay_detached, \
             detach_after FROM channels WHERE network_id = ?",
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(channel_from_row).collect())
    }

    pub async fn store_channel(
        &self,
        network_id: i64,
        channel: &mut ChannelRecord,
    ) -> Result<(), DbError> {
        if channel.id == 0 {
            let res = sqlx::query(
                "INSERT INTO channels (network_id, name, key, detached, \
                 detached_internal_msgid, relay_detached, detach_after) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(network_id, name) DO UPDATE SET key = excluded.key, \
                 detached = excluded.detached, \
                 detached_internal_msgid = excluded.detached_internal_msgid, \
                 relay_detached = excluded.relay_detached, \
                 detach_after = excluded.detach_after",
            )
            .bind(network_id)
            .bind(&channel.name)
            .bind(&channel.key)
            .bind(channel.detached)
            .bind(&channel.detached_internal_msg_id)
            .bind(channel.relay_detached.as_str())
            .bind(channel.detach_after.as_secs() as i64)
            .execute(&self.pool)
            .await?;
            channel.id = res.last_insert_rowid();
        } else {
            sqlx::query(
                "UPDATE channels SET name = ?, key = ?, detached = ?, \
                 detached_internal_msgid = ?, relay_detached = ?, detach_after = ? WHERE id = ?",
            )
            .bind(&channel.name)
            .bind(&channel.key)
            .bind(channel.detached)
            .bind(&channel.detached_internal_msg_id)
            .bind(channel.relay_detached.as_str())
            .bind(channel.detach_after.as_secs() as i64)
            .bind(channel.id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_channel(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Delivery receipts
    // ========================================================================

    pub async fn list_delivery_receipts(
        &self,
        network_id: i64,
    ) -> Result<Vec<DeliveryReceipt>, DbError> {
        let rows = sqlx::query(
            "SELECT target, client, internal_msgid FROM delivery_receipts WHERE network_id = ?",
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| DeliveryReceipt {
                target: row.get("target"),
                client: row.get("client"),
                internal_msg_id: row.get("internal_msgid"),
            })
            .collect())
    }

    /// Replace the full receipt set for `(network, client)` in one
    /// transaction.
    pub async fn store_client_delivery_receipts(
        &self,
        network_id: i64,
        client: &str,
        receipts: &[DeliveryReceipt],
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM delivery_receipts WHERE network_id = ? AND client = ?")
            .bind(network_id)
            .bind(client)
            .execute(&mut *tx)
            .await?;
        for receipt in receipts {
            sqlx::query(
                "INSERT INTO delivery_receipts (network_id, target, client, internal_msgid) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(network_id)
            .bind(&receipt.target)
            .bind(client)
            .bind(&receipt.internal_msg_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Web Push subscriptions
    // ========================================================================

    pub async fn list_webpush_subscriptions(
        &self,
        network_id: i64,
    ) -> Result<Vec<WebPushSubscription>, DbError> {
        let rows = sqlx::query(
            "SELECT id, endpoint, key_auth, key_p256dh, key_vapid FROM webpush_subscriptions \
             WHERE network_id = ?",
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| WebPushSubscription {
                id: row.get("id"),
                endpoint: row.get("endpoint"),
                key_auth: row.get("key_auth"),
                key_p256dh: row.get("key_p256dh"),
                key_vapid: row.get("key_vapid"),
            })
            .collect())
    }

    pub async fn delete_webpush_subscription(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM webpush_subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> UserRecord {
    UserRecord {
        id: row.get("id"),
        username: row.get("username"),
        password: row.get("password"),
        admin: row.get("admin"),
        realname: row.get("realname"),
    }
}

fn network_from_row(row: &sqlx::sqlite::SqliteRow) -> NetworkRecord {
    NetworkRecord {
        id: row.get("id"),
        name: row.get("name"),
        addr: row.get("addr"),
        nick: row.get("nick"),
        username: row.get("username"),
        realname: row.get("realname"),
        pass: row.get("pass"),
        enabled: row.get("enabled"),
        sasl: SaslConfig {
            mechanism: row.get("sasl_mechanism"),
            plain_username: row.get("sasl_plain_username"),
            plain_password: row.get("sasl_plain_password"),
            external_cert: row.get("sasl_external_cert"),
        },
    }
}

fn channel_from_row(row: &sqlx::sqlite::SqliteRow) -> ChannelRecord {
    let detach_after: i64 = row.get("detach_after");
    ChannelRecord {
        id: row.get("id"),
        name: row.get("name"),
        key: row.get("key"),
        detached: row.get("detached"),
        detached_internal_msg_id: row.get("detached_internal_msgid"),
        relay_detached: RelayPolicy::parse(row.get::<String, _>("relay_detached").as_str())
            .unwrap_or_default(),
        detach_after: Duration::from_secs(detach_after.max(0) as u64),
    }
}

/// Hash a password for storage, Argon2 with a fresh salt.
pub fn hash_password(password: &str) -> Result<String, DbError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| DbError::InvalidPassword)
}

/// Verify a password against a stored PHC hash.
pub fn verify_password(password: &str, hash: &str) -> Result<(), DbError> {
    let parsed = PasswordHash::new(hash).map_err(|_| DbError::InvalidPassword)?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| DbError::InvalidPassword)
}
