//! Tree paths
//!
//! Every directory in the tree is addressed by an absolute
//! slash-delimited path ("/", "/app/settings"). Paths are validated at
//! construction so a malformed path can never enter the tree; remote
//! operations carrying one are rejected at the deserialization
//! boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DirectoryError;

/// Separator between directory names in a path
pub const PATH_SEPARATOR: char = '/';

/// Absolute path of a directory within the tree
///
/// Invariants: leading separator, no empty segments, the root is
/// spelled `/`. Ancestry tests are segment-aware: `/ab` is not under
/// `/a`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TreePath(String);

impl TreePath {
    /// The root path `/`
    pub fn root() -> Self {
        TreePath(String::from("/"))
    }

    /// Parse and validate an absolute path
    pub fn parse(raw: &str) -> Result<Self, DirectoryError> {
        if raw == "/" {
            return Ok(Self::root());
        }
        if !raw.starts_with(PATH_SEPARATOR) || raw.ends_with(PATH_SEPARATOR) {
            return Err(DirectoryError::InvalidPath(raw.to_string()));
        }
        if raw[1..].split(PATH_SEPARATOR).any(str::is_empty) {
            return Err(DirectoryError::InvalidPath(raw.to_string()));
        }
        Ok(TreePath(raw.to_string()))
    }

    /// Validate a single directory name
    pub fn validate_name(name: &str) -> Result<(), DirectoryError> {
        if name.is_empty() || name.contains(PATH_SEPARATOR) {
            return Err(DirectoryError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path of the named child directory
    pub fn join(&self, name: &str) -> Result<TreePath, DirectoryError> {
        Self::validate_name(name)?;
        let mut joined = self.0.clone();
        if !self.is_root() {
            joined.push(PATH_SEPARATOR);
        }
        joined.push_str(name);
        Ok(TreePath(joined))
    }

    /// Parent path, or None at the root
    pub fn parent(&self) -> Option<TreePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(PATH_SEPARATOR) {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(TreePath(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Final segment, or None at the root
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rfind(PATH_SEPARATOR).map(|idx| &self.0[idx + 1..])
    }

    /// The path's segments below the root, outermost first
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split(PATH_SEPARATOR).filter(|s| !s.is_empty())
    }

    /// Number of segments below the root
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Whether `self` is `ancestor` or lies beneath it
    pub fn is_under(&self, ancestor: &TreePath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        if self.0 == ancestor.0 {
            return true;
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(ancestor.0.as_str())
            && self.0.as_bytes()[ancestor.0.len()] == PATH_SEPARATOR as u8
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({})", self.0)
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TreePath {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TreePath {
    type Error = DirectoryError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<TreePath> for String {
    fn from(path: TreePath) -> String {
        path.0
    }
}
