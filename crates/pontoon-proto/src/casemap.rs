//! IRC casemapping functions and casemapping-aware keyed maps.
//!
//! IRC equality folds some characters together (e.g. `[` and `{`). Which
//! characters fold is advertised by the server in `RPL_ISUPPORT` as the
//! `CASEMAPPING` token, so the folding in use can change at runtime.

use std::collections::HashMap;

/// A nickname/channel-name folding function, per the `CASEMAPPING`
/// ISUPPORT token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Casemapping {
    /// ASCII case folding plus `[]\~` → `{}|^`. The default mapping.
    #[default]
    Rfc1459,
    /// Like `rfc1459` but without the `~` → `^` fold.
    Rfc1459Strict,
    /// Plain ASCII case folding.
    Ascii,
}

impl Casemapping {
    /// Resolve an ISUPPORT `CASEMAPPING` value. Unknown values yield `None`
    /// so the caller can keep its current mapping.
    pub fn from_isupport(value: &str) -> Option<Casemapping> {
        match value {
            "rfc1459" => Some(Casemapping::Rfc1459),
            "rfc1459-strict" => Some(Casemapping::Rfc1459Strict),
            "ascii" => Some(Casemapping::Ascii),
            _ => None,
        }
    }

    /// Fold a single character.
    pub const fn fold_char(self, c: char) -> char {
        match (self, c) {
            (_, 'A'..='Z') => (c as u8 + 32) as char,
            (Casemapping::Ascii, _) => c,
            (_, '[') => '{',
            (_, ']') => '}',
            (_, '\\') => '|',
            (Casemapping::Rfc1459, '~') => '^',
            _ => c,
        }
    }

    /// Fold a whole string.
    pub fn fold(self, s: &str) -> String {
        s.chars().map(|c| self.fold_char(c)).collect()
    }

    /// Casemapping-aware equality.
    pub fn eq(self, a: &str, b: &str) -> bool {
        a.len() == b.len()
            && a.chars()
                .zip(b.chars())
                .all(|(ca, cb)| self.fold_char(ca) == self.fold_char(cb))
    }
}

struct Entry<V> {
    original: String,
    value: V,
}

/// A map keyed by IRC names, folded under a switchable [`Casemapping`].
///
/// Lookups fold the key; iteration yields the original (pre-folding)
/// spelling each entry was first inserted under. [`CaseMap::set_casemapping`]
/// refolds every key in place; if two keys collide under the new mapping,
/// one entry survives (last write wins).
pub struct CaseMap<V> {
    casemapping: Casemapping,
    inner: HashMap<String, Entry<V>>,
}

impl<V> Default for CaseMap<V> {
    fn default() -> Self {
        CaseMap::new(Casemapping::default())
    }
}

impl<V> CaseMap<V> {
    /// An empty map using the given casemapping.
    pub fn new(casemapping: Casemapping) -> Self {
        CaseMap {
            casemapping,
            inner: HashMap::new(),
        }
    }

    /// The casemapping currently applied to keys.
    pub fn casemapping(&self) -> Casemapping {
        self.casemapping
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(&self.casemapping.fold(key))
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.inner
            .get(&self.casemapping.fold(key))
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.inner
            .get_mut(&self.casemapping.fold(key))
            .map(|e| &mut e.value)
    }

    /// Insert or replace. The original spelling of the key is kept from the
    /// first insertion.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        let original = key.into();
        let folded = self.casemapping.fold(&original);
        match self.inner.get_mut(&folded) {
            Some(entry) => Some(std::mem::replace(&mut entry.value, value)),
            None => {
                self.inner.insert(folded, Entry { original, value });
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.inner
            .remove(&self.casemapping.fold(key))
            .map(|e| e.value)
    }

    /// Iterate over `(original key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.inner.values().map(|e| (e.original.as_str(), &e.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut V)> {
        self.inner
            .values_mut()
            .map(|e| (e.original.as_str(), &mut e.value))
    }

    /// Iterate over original keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.values().map(|e| e.original.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values().map(|e| &e.value)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.inner.values_mut().map(|e| &mut e.value)
    }

    /// Refold every key under a new casemapping. Values are preserved; keys
    /// that collide under the new mapping are merged last-write-wins.
    pub fn set_casemapping(&mut self, casemapping: Casemapping) {
        self.casemapping = casemapping;
        let entries: Vec<Entry<V>> = self.inner.drain().map(|(_, e)| e).collect();
        for entry in entries {
            self.inner.insert(casemapping.fold(&entry.original), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_rfc1459() {
        assert_eq!(Casemapping::Rfc1459.fold("#Chan[1]~"), "#chan{1}^");
        assert_eq!(Casemapping::Rfc1459.fold("Nick\\Away"), "nick|away");
    }

    #[test]
    fn fold_variants_differ_on_specials() {
        assert_eq!(Casemapping::Rfc1459Strict.fold("a~b"), "a~b");
        assert_eq!(Casemapping::Ascii.fold("[A]"), "[a]");
        assert_eq!(Casemapping::Rfc1459.fold("[A]"), "{a}");
    }

    #[test]
    fn from_isupport_values() {
        assert_eq!(
            Casemapping::from_isupport("ascii"),
            Some(Casemapping::Ascii)
        );
        assert_eq!(
            Casemapping::from_isupport("rfc1459-strict"),
            Some(Casemapping::Rfc1459Strict)
        );
        assert_eq!(Casemapping::from_isupport("rfc7613"), None);
    }

    #[test]
    fn casemap_lookup_folds_keys() {
        let mut m = CaseMap::new(Casemapping::Rfc1459);
        m.insert("#Foo", 1);
        assert_eq!(m.get("#foo"), Some(&1));
        assert_eq!(m.get("#FOO"), Some(&1));
        assert!(m.contains_key("#fOo"));
    }

    #[test]
    fn casemap_iteration_keeps_original_keys() {
        let mut m = CaseMap::new(Casemapping::Rfc1459);
        m.insert("#Foo", 1);
        m.insert("#BAR", 2);
        let mut keys: Vec<&str> = m.keys().collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["#BAR", "#Foo"]);
    }

    #[test]
    fn casemap_replace_keeps_first_spelling() {
        let mut m = CaseMap::new(Casemapping::Rfc1459);
        m.insert("#Foo", 1);
        assert_eq!(m.insert("#FOO", 2), Some(1));
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["#Foo"]);
        assert_eq!(m.get("#foo"), Some(&2));
    }

    #[test]
    fn set_casemapping_refolds_and_preserves_values() {
        let mut m = CaseMap::new(Casemapping::Ascii);
        m.insert("#chan[1]", 7);
        assert!(m.get("#chan{1}").is_none());

        m.set_casemapping(Casemapping::Rfc1459);
        assert_eq!(m.get("#chan{1}"), Some(&7));
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["#chan[1]"]);
    }
}
