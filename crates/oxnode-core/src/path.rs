//! Mount-relative paths.
//!
//! A [`VirtualPath`] names an entry as clients of the mount see it. It uses `/`
//! as the separator regardless of the host OS and never carries a leading or
//! trailing slash, so `"/run/app.sock"` and `"run/app.sock/"` are the same path.

use relative_path::{RelativePath, RelativePathBuf};
use std::fmt;

/// Path of an entry inside the mount namespace.
///
/// The root directory of the mount is the empty path.
///
/// # Examples
///
/// ```
/// use oxnode_core::VirtualPath;
///
/// let path = VirtualPath::new("/run/example.sock");
/// assert_eq!(path.file_name(), Some("example.sock"));
/// assert_eq!(path.parent().unwrap().as_str(), "run");
/// assert_eq!(path, VirtualPath::new("run/example.sock"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath(RelativePathBuf);

impl VirtualPath {
    /// The root of the mount.
    #[inline]
    pub fn root() -> Self {
        VirtualPath(RelativePathBuf::new())
    }

    /// Create a path from a string, stripping surrounding slashes and
    /// resolving `.` and `..` components.
    pub fn new(path: impl AsRef<str>) -> Self {
        let s = path.as_ref().trim_matches('/');
        VirtualPath(RelativePath::new(s).normalize())
    }

    /// Check if this is the mount root.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Join a single component (or a relative sub-path) onto this path.
    pub fn join(&self, component: impl AsRef<str>) -> Self {
        VirtualPath::new(self.0.join(component.as_ref().trim_matches('/')).as_str())
    }

    /// Parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_root() {
            return None;
        }
        self.0.parent().map(|p| VirtualPath(p.to_relative_path_buf()))
    }

    /// Final component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.components().map(|c| c.as_str())
    }

    /// Split into parent directory and final component.
    pub fn split(&self) -> Option<(VirtualPath, &str)> {
        let parent = self.parent()?;
        let name = self.file_name()?;
        Some((parent, name))
    }

    /// Returns true if `self` is the direct parent of `child`.
    pub fn is_parent_of(&self, child: &VirtualPath) -> bool {
        child.parent().is_some_and(|p| &p == self)
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for VirtualPath {
    fn from(s: &str) -> Self {
        VirtualPath::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_root() {
        let root = VirtualPath::root();
        assert!(root.is_root());
        assert!(root.parent().is_none());
        assert!(root.file_name().is_none());
        assert_eq!(VirtualPath::new("/"), root);
        assert_eq!(root.to_string(), "/");
    }

    #[test]
    fn test_slashes_are_normalized() {
        assert_eq!(VirtualPath::new("/a/b/"), VirtualPath::new("a/b"));
        assert_eq!(VirtualPath::new("a/./b"), VirtualPath::new("a/b"));
        assert_eq!(VirtualPath::new("a/c/../b"), VirtualPath::new("a/b"));
    }

    #[test]
    fn test_top_level_parent_is_root() {
        let path = VirtualPath::new("example.sock");
        assert_eq!(path.parent(), Some(VirtualPath::root()));
        assert!(VirtualPath::root().is_parent_of(&path));
    }

    #[test]
    fn test_join_and_split() {
        let dir = VirtualPath::new("run");
        let sock = dir.join("app.sock");
        assert_eq!(sock.as_str(), "run/app.sock");
        let (parent, name) = sock.split().unwrap();
        assert_eq!(parent, dir);
        assert_eq!(name, "app.sock");
        assert!(dir.is_parent_of(&sock));
        assert!(!VirtualPath::root().is_parent_of(&sock));
    }

    #[test]
    fn test_components() {
        let path = VirtualPath::new("a/b/c");
        assert_eq!(path.components().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    proptest! {
        #[test]
        fn prop_join_then_split_roundtrips(
            dir in "[a-z]{1,8}(/[a-z]{1,8}){0,3}",
            name in "[a-zA-Z0-9_.-]{1,12}",
        ) {
            prop_assume!(name != "." && name != "..");
            let parent = VirtualPath::new(&dir);
            let child = parent.join(&name);
            let (p, n) = child.split().unwrap();
            prop_assert_eq!(p, parent);
            prop_assert_eq!(n, name.as_str());
        }
    }
}
