//! Per-network delivery checkpoints.
//!
//! For every message target (channel or nick) the bouncer remembers, per
//! client name, the internal ID of the last message that client was sent.
//! On reconnect the gap between this checkpoint and the store's latest
//! message is the client's backlog.

use std::collections::{HashMap, HashSet};

use pontoon_proto::{CaseMap, Casemapping};

/// `target -> client name -> internal message ID`, with targets folded
/// under the network's active casemapping.
#[derive(Default)]
pub struct DeliveredStore {
    targets: CaseMap<HashMap<String, String>>,
}

impl DeliveredStore {
    pub fn new(casemapping: Casemapping) -> Self {
        DeliveredStore {
            targets: CaseMap::new(casemapping),
        }
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    /// The checkpoint for `(target, client)`, if any.
    pub fn load_id(&self, target: &str, client: &str) -> Option<&str> {
        self.targets
            .get(target)?
            .get(client)
            .map(String::as_str)
    }

    /// Record `msg_id` as the last ID delivered to `client` on `target`.
    pub fn store_id(
        &mut self,
        target: impl Into<String>,
        client: impl Into<String>,
        msg_id: impl Into<String>,
    ) {
        let target = target.into();
        match self.targets.get_mut(&target) {
            Some(clients) => {
                clients.insert(client.into(), msg_id.into());
            }
            None => {
                let mut clients = HashMap::new();
                clients.insert(client.into(), msg_id.into());
                self.targets.insert(target, clients);
            }
        }
    }

    /// Iterate over targets by their original (pre-folding) names.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.targets.keys()
    }

    /// Every distinct client name appearing on any target.
    pub fn client_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        for clients in self.targets.values() {
            for name in clients.keys() {
                seen.insert(name.clone());
            }
        }
        seen.into_iter().collect()
    }

    /// Refold target keys under a new casemapping. Client maps are
    /// untouched; targets that collide merge last-write-wins.
    pub fn set_casemapping(&mut self, casemapping: Casemapping) {
        self.targets.set_casemapping(casemapping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_load() {
        let mut ds = DeliveredStore::new(Casemapping::Rfc1459);
        assert!(!ds.has_target("#chan"));
        assert_eq!(ds.load_id("#chan", "laptop"), None);

        ds.store_id("#Chan", "laptop", "m1");
        ds.store_id("#Chan", "phone", "m2");
        assert!(ds.has_target("#chan"));
        assert_eq!(ds.load_id("#CHAN", "laptop"), Some("m1"));
        assert_eq!(ds.load_id("#chan", "phone"), Some("m2"));
    }

    #[test]
    fn targets_keep_original_spelling() {
        let mut ds = DeliveredStore::new(Casemapping::Rfc1459);
        ds.store_id("#Foo", "laptop", "m1");
        ds.store_id("#foo", "phone", "m2");
        assert_eq!(ds.targets().collect::<Vec<_>>(), vec!["#Foo"]);
    }

    #[test]
    fn client_names_union_across_targets() {
        let mut ds = DeliveredStore::new(Casemapping::Rfc1459);
        ds.store_id("#a", "laptop", "m1");
        ds.store_id("#b", "laptop", "m2");
        ds.store_id("#b", "phone", "m3");
        let mut names = ds.client_names();
        names.sort_unstable();
        assert_eq!(names, vec!["laptop", "phone"]);
    }

    #[test]
    fn casemapping_change_preserves_checkpoints() {
        let mut ds = DeliveredStore::new(Casemapping::Ascii);
        ds.store_id("#chan[1]", "laptop", "m9");
        ds.set_casemapping(Casemapping::Rfc1459);
        assert_eq!(ds.load_id("#chan{1}", "laptop"), Some("m9"));
        assert_eq!(ds.targets().collect::<Vec<_>>(), vec!["#chan[1]"]);
    }
}
