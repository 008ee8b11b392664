//! Filesystem-backed message store.
//!
//! Layout: `<log root>/<username>/<network name>/<target>.log`, one message
//! per line as `<id> <timestamp> <raw IRC line>`. IDs are fixed-width and
//! monotonic, so lexicographic comparison orders messages and range queries
//! need no index.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use pontoon_proto::Message;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::db::NetworkRecord;

use super::{MessageStore, StoreError};

pub struct FsMessageStore {
    root: PathBuf,
    counter: AtomicU64,
}

impl FsMessageStore {
    /// A store rooted at `<log_root>/<username>`.
    pub fn new(log_root: impl Into<PathBuf>, username: &str) -> Self {
        let mut root = log_root.into();
        root.push(escape_path_component(username));
        FsMessageStore {
            root,
            counter: AtomicU64::new(0),
        }
    }

    fn network_dir(&self, network: &NetworkRecord) -> PathBuf {
        self.root.join(escape_path_component(network.get_name()))
    }

    fn target_path(&self, network: &NetworkRecord, target: &str) -> PathBuf {
        self.network_dir(network)
            .join(format!("{}.log", escape_path_component(target)))
    }

    fn next_id(&self, now: DateTime<Utc>) -> String {
        let micros = now.timestamp_micros().max(0) as u64;
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{micros:016x}-{seq:08x}")
    }
}

/// Make a name safe to use as a single path component.
fn escape_path_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}

fn split_line(line: &str) -> Result<(&str, &str), StoreError> {
    let (id, rest) = line
        .split_once(' ')
        .ok_or_else(|| StoreError::Malformed(line.to_owned()))?;
    let (_timestamp, raw) = rest
        .split_once(' ')
        .ok_or_else(|| StoreError::Malformed(line.to_owned()))?;
    Ok((id, raw))
}

#[async_trait]
impl MessageStore for FsMessageStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn append(
        &self,
        network: &NetworkRecord,
        target: &str,
        msg: &Message,
    ) -> Result<Option<String>, StoreError> {
        let dir = self.network_dir(network);
        tokio::fs::create_dir_all(&dir).await?;

        let now = Utc::now();
        let id = self.next_id(now);
        let line = format!(
            "{} {} {}\n",
            id,
            now.to_rfc3339_opts(SecondsFormat::Micros, true),
            msg
        );

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.target_path(network, target))
            .await?;
        file.write_all(line.as_bytes()).await?;

        Ok(Some(id))
    }

    async fn last_msg_id(
        &self,
        network: &NetworkRecord,
        target: &str,
        _at: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let content = match tokio::fs::read_to_string(self.target_path(network, target)).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match content.lines().rev().find(|l| !l.is_empty()) {
            Some(line) => Ok(Some(split_line(line)?.0.to_owned())),
            None => Ok(None),
        }
    }

    async fn load_after(
        &self,
        network: &NetworkRecord,
        target: &str,
        after_id: &str,
        limit: usize,
    ) -> Result<Vec<(String, Message)>, StoreError> {
        let content = match tokio::fs::read_to_string(self.target_path(network, target)).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut out = Vec::new();
        for line in content.lines().filter(|l| !l.is_empty()) {
            let (id, raw) = split_line(line)?;
            if id <= after_id {
                continue;
            }
            match raw.parse::<Message>() {
                Ok(msg) => out.push((id.to_owned(), msg)),
                // A corrupt line should not make the whole backlog
                // unreadable.
                Err(err) => warn!(msg_target = %target, error = %err, "skipping unparsable log line"),
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn rename_network(
        &self,
        old: &NetworkRecord,
        new: &NetworkRecord,
    ) -> Result<(), StoreError> {
        let old_dir = self.network_dir(old);
        let new_dir = self.network_dir(new);
        match tokio::fs::rename(&old_dir, &new_dir).await {
            Ok(()) => Ok(()),
            // Nothing logged yet for this network.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pontoon-store-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn network(name: &str) -> NetworkRecord {
        NetworkRecord {
            name: name.to_owned(),
            addr: "ircs://irc.example.org".to_owned(),
            ..NetworkRecord::default()
        }
    }

    #[tokio::test]
    async fn append_then_query() {
        let store = FsMessageStore::new(test_root("append"), "alice");
        let net = network("libera");

        let mut ids = Vec::new();
        for i in 0..3 {
            let text = format!("msg {i}");
            let msg = Message::new("PRIVMSG", ["#chan", text.as_str()]);
            ids.push(store.append(&net, "#chan", &msg).await.unwrap().unwrap());
        }

        let last = store.last_msg_id(&net, "#chan", Utc::now()).await.unwrap();
        assert_eq!(last.as_deref(), Some(ids[2].as_str()));

        let backlog = store.load_after(&net, "#chan", &ids[0], 100).await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].0, ids[1]);
        assert_eq!(backlog[0].1.param(1), Some("msg 1"));
        assert_eq!(backlog[1].1.param(1), Some("msg 2"));
    }

    #[tokio::test]
    async fn load_after_respects_limit() {
        let store = FsMessageStore::new(test_root("limit"), "alice");
        let net = network("libera");
        let first = store
            .append(&net, "#chan", &Message::new("PRIVMSG", ["#chan", "a"]))
            .await
            .unwrap()
            .unwrap();
        for text in ["b", "c", "d"] {
            store
                .append(&net, "#chan", &Message::new("PRIVMSG", ["#chan", text]))
                .await
                .unwrap();
        }
        let backlog = store.load_after(&net, "#chan", &first, 2).await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].1.param(1), Some("b"));
    }

    #[tokio::test]
    async fn missing_target_is_empty() {
        let store = FsMessageStore::new(test_root("missing"), "alice");
        let net = network("libera");
        assert!(store
            .last_msg_id(&net, "#nope", Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .load_after(&net, "#nope", "0", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rename_moves_history() {
        let store = FsMessageStore::new(test_root("rename"), "alice");
        let old = network("liberachat");
        let new = network("libera");

        let id = store
            .append(&old, "#chan", &Message::new("PRIVMSG", ["#chan", "hi"]))
            .await
            .unwrap()
            .unwrap();
        store.rename_network(&old, &new).await.unwrap();

        let last = store.last_msg_id(&new, "#chan", Utc::now()).await.unwrap();
        assert_eq!(last.as_deref(), Some(id.as_str()));
        assert!(store
            .last_msg_id(&old, "#chan", Utc::now())
            .await
            .unwrap()
            .is_none());
    }
}
