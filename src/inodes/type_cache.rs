//! Per-directory cache of child-name to type mappings.
//!
//! A fresh entry lets `lookup` stat only the recorded variant of a name
//! instead of racing a file stat, a placeholder stat and a prefix listing.
//! Negative entries are recorded only when the mount enables them.
use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildType {
    File,
    ExplicitDir,
    ImplicitDir,
    Symlink,
    Nonexistent,
}

#[derive(Default)]
pub struct TypeCache {
    entries: HashMap<String, (ChildType, SystemTime)>,
}

impl TypeCache {
    /// Record `base -> t` until `expires`.
    pub fn insert(&mut self, base: &str, t: ChildType, expires: SystemTime) {
        self.entries.insert(base.to_string(), (t, expires));
    }

    /// A fresh entry for `base`, if any. Expired entries are dropped.
    pub fn get(&mut self, base: &str, now: SystemTime) -> Option<ChildType> {
        match self.entries.get(base) {
            Some((t, expires)) if *expires > now => Some(*t),
            Some(_) => {
                self.entries.remove(base);
                None
            }
            None => None,
        }
    }

    pub fn remove(&mut self, base: &str) {
        self.entries.remove(base);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expiry() {
        let mut c = TypeCache::default();
        let t0 = SystemTime::UNIX_EPOCH;
        c.insert("a", ChildType::File, t0 + Duration::from_secs(10));
        assert_eq!(c.get("a", t0), Some(ChildType::File));
        assert_eq!(c.get("a", t0 + Duration::from_secs(10)), None);
        // The expired entry is gone.
        assert_eq!(c.get("a", t0), None);
    }

    #[test]
    fn removal() {
        let mut c = TypeCache::default();
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        c.insert("a", ChildType::Nonexistent, later);
        c.remove("a");
        assert_eq!(c.get("a", SystemTime::UNIX_EPOCH), None);
    }
}
