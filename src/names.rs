//! Bucket-relative object names as exposed through the filesystem.
//!
//! An object name ending in `/` denotes a directory; the empty name is the
//! mount root. A file and a directory may share a plain name (`foo` and
//! `foo/`); listings and lookups then expose the file under the plain name
//! plus [`CONFLICT_SUFFIX`], which is illegal in object names.

/// Appended to a file's base name when a directory with the same name exists.
pub const CONFLICT_SUFFIX: char = '\n';

/// A structured object name. Ordering is the raw byte ordering of the
/// underlying string, which matches the store's listing order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

impl Name {
    /// The mount root.
    pub fn root() -> Self {
        Name(String::new())
    }

    /// A directory name; a trailing slash is appended if missing.
    pub fn directory(s: impl Into<String>) -> Self {
        let mut s = s.into();
        if !s.is_empty() && !s.ends_with('/') {
            s.push('/');
        }
        Name(s)
    }

    /// A file or symlink name. The input must not end in a slash.
    pub fn file(s: impl Into<String>) -> Self {
        let s = s.into();
        debug_assert!(!s.ends_with('/'));
        Name(s)
    }

    /// Classify a raw object name by its trailing slash.
    pub fn from_object(s: impl Into<String>) -> Self {
        Name(s.into())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_dir(&self) -> bool {
        self.is_root() || self.0.ends_with('/')
    }

    /// The raw object name, as sent to the store.
    pub fn object_name(&self) -> &str {
        &self.0
    }

    /// Last path component, without the trailing slash for directories.
    pub fn base_name(&self) -> &str {
        let s = self.0.strip_suffix('/').unwrap_or(&self.0);
        match s.rfind('/') {
            Some(i) => &s[i + 1..],
            None => s,
        }
    }

    /// Child file name under a directory. Panics if `self` is not a directory.
    pub fn child_file(&self, base: &str) -> Name {
        assert!(self.is_dir());
        Name(format!("{}{}", self.0, base))
    }

    /// Child directory name under a directory.
    pub fn child_dir(&self, base: &str) -> Name {
        assert!(self.is_dir());
        Name(format!("{}{}/", self.0, base))
    }
}

impl std::fmt::Debug for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", if self.is_root() { "/" } else { &self.0 })
    }
}

/// Strip the conflict suffix from a base name, if present.
pub fn strip_conflict_suffix(base: &str) -> Option<&str> {
    base.strip_suffix(CONFLICT_SUFFIX)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root() {
        let root = Name::root();
        assert!(root.is_root());
        assert!(root.is_dir());
        assert_eq!(root.object_name(), "");
    }

    #[test]
    fn classification() {
        assert!(Name::from_object("a/b/").is_dir());
        assert!(!Name::from_object("a/b").is_dir());
        assert_eq!(Name::directory("a/b").object_name(), "a/b/");
        assert_eq!(Name::directory("a/b/").object_name(), "a/b/");
    }

    #[test]
    fn base_names() {
        assert_eq!(Name::file("a/b/c").base_name(), "c");
        assert_eq!(Name::directory("a/b").base_name(), "b");
        assert_eq!(Name::file("c").base_name(), "c");
    }

    #[test]
    fn children() {
        let d = Name::directory("a");
        assert_eq!(d.child_file("f").object_name(), "a/f");
        assert_eq!(d.child_dir("d").object_name(), "a/d/");
        assert_eq!(Name::root().child_file("f").object_name(), "f");
    }

    #[test]
    fn conflict_suffix() {
        assert_eq!(strip_conflict_suffix("foo\n"), Some("foo"));
        assert_eq!(strip_conflict_suffix("foo"), None);
    }
}
