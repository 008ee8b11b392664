//! Upstream ident derivation and the identd endpoint table.
//!
//! The ident is sent to upstream servers in clear text, so it must not leak
//! user metadata: it is the first 16 bytes of `SHA-256(LE64(user id))`,
//! hex-encoded, which is stable per user and otherwise opaque.

use dashmap::DashMap;
use sha2::{Digest, Sha256};

/// The per-user ident string exposed to upstream servers.
pub fn user_ident(user_id: i64) -> String {
    let mut buf = [0u8; 64];
    buf[..8].copy_from_slice(&(user_id as u64).to_le_bytes());
    let digest = Sha256::digest(buf);
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Table of live upstream connections for ident lookups, keyed by
/// `(remote address, local address)`.
#[derive(Default)]
pub struct IdentStore {
    entries: DashMap<(String, String), String>,
}

impl IdentStore {
    pub fn store(&self, remote: String, local: String, ident: String) {
        self.entries.insert((remote, local), ident);
    }

    pub fn delete(&self, remote: &str, local: &str) {
        self.entries
            .remove(&(remote.to_owned(), local.to_owned()));
    }

    pub fn lookup(&self, remote: &str, local: &str) -> Option<String> {
        self.entries
            .get(&(remote.to_owned(), local.to_owned()))
            .map(|e| e.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_is_stable_and_opaque() {
        let a = user_ident(1);
        let b = user_ident(1);
        let c = user_ident(2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn store_and_delete_endpoints() {
        let identd = IdentStore::default();
        identd.store("192.0.2.1:6697".into(), "198.51.100.7:50000".into(), "aabb".into());
        assert_eq!(
            identd.lookup("192.0.2.1:6697", "198.51.100.7:50000").as_deref(),
            Some("aabb")
        );
        identd.delete("192.0.2.1:6697", "198.51.100.7:50000");
        assert!(identd.lookup("192.0.2.1:6697", "198.51.100.7:50000").is_none());
    }
}
