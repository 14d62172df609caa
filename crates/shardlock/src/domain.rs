//! Domain namespace tree.
//!
//! Domains are slash-separated paths (`/a/b`). The root always exists and is
//! never created explicitly. A domain can only be inserted when its immediate
//! parent already exists, and domains are never removed.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Parsed domain path as a list of segments; the root is the empty list.
///
/// Serialized in its `/a/b` text form so it can key JSON maps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DomainPath(Vec<String>);

impl DomainPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse `/seg/seg`. Empty segments and missing leading slash are
    /// rejected; `/` parses to the root.
    pub fn parse(path: &str) -> Result<Self, LockError> {
        let rest = path.strip_prefix('/').ok_or(LockError::InvalidDomain)?;
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in rest.split('/') {
            if segment.is_empty() || segment.contains(';') {
                return Err(LockError::InvalidDomain);
            }
            segments.push(segment.to_string());
        }
        Ok(Self(segments))
    }

    /// Domain that a lock name falls under syntactically: every segment but
    /// the last. Names without a leading slash live in the root.
    pub fn enclosing(lock: &str) -> Self {
        let Some(rest) = lock.strip_prefix('/') else {
            return Self::root();
        };
        let mut segments = rest
            .split('/')
            .map(str::to_string)
            .collect::<Vec<_>>();
        segments.pop();
        if segments.iter().any(String::is_empty) {
            return Self::root();
        }
        Self(segments)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    fn prefix(&self, len: usize) -> Self {
        Self(self.0[..len.min(self.0.len())].to_vec())
    }
}

impl fmt::Display for DomainPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl From<DomainPath> for String {
    fn from(path: DomainPath) -> Self {
        path.to_string()
    }
}

impl TryFrom<String> for DomainPath {
    type Error = LockError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DomainPath::parse(&value)
    }
}

/// Set of explicitly created domains.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTree {
    domains: BTreeSet<DomainPath>,
}

impl DomainTree {
    pub fn contains(&self, domain: &DomainPath) -> bool {
        domain.is_root() || self.domains.contains(domain)
    }

    pub fn insert(&mut self, domain: DomainPath) -> Result<(), LockError> {
        let parent = domain.parent().ok_or(LockError::InvalidDomain)?;
        if self.domains.contains(&domain) {
            return Err(LockError::DomainExists);
        }
        if !self.contains(&parent) {
            return Err(LockError::ParentDomainMissing);
        }
        self.domains.insert(domain);
        Ok(())
    }

    /// Deepest existing domain that encloses `lock`.
    pub fn domain_of(&self, lock: &str) -> DomainPath {
        let enclosing = DomainPath::enclosing(lock);
        (1..=enclosing.depth())
            .rev()
            .map(|len| enclosing.prefix(len))
            .find(|candidate| self.domains.contains(candidate))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> DomainPath {
        DomainPath::parse(p).expect("valid domain path")
    }

    #[test]
    fn parse_rejects_malformed_paths() {
        for bad in ["", "a", "a/b", "//", "/a//b", "/a/", "/a;b"] {
            assert_eq!(DomainPath::parse(bad), Err(LockError::InvalidDomain), "{bad}");
        }
        assert!(path("/").is_root());
        assert_eq!(path("/a/b").to_string(), "/a/b");
    }

    #[test]
    fn insert_follows_parent_rules() {
        let mut tree = DomainTree::default();
        assert_eq!(tree.insert(DomainPath::root()), Err(LockError::InvalidDomain));
        tree.insert(path("/a")).expect("child of root");
        tree.insert(path("/a/b")).expect("child of /a");
        assert_eq!(tree.insert(path("/a")), Err(LockError::DomainExists));
        assert_eq!(tree.insert(path("/a/c/d")), Err(LockError::ParentDomainMissing));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn locks_map_to_deepest_existing_domain() {
        let mut tree = DomainTree::default();
        tree.insert(path("/a")).expect("insert /a");
        tree.insert(path("/a/b")).expect("insert /a/b");
        assert_eq!(tree.domain_of("/a/b/L"), path("/a/b"));
        assert_eq!(tree.domain_of("/a/x/L"), path("/a"));
        assert_eq!(tree.domain_of("/a"), DomainPath::root());
        assert_eq!(tree.domain_of("plain"), DomainPath::root());
        assert_eq!(tree.domain_of("/z/L"), DomainPath::root());
    }
}
