use std::path::Path;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::VcsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VcsRef {
    pub name: String,
    pub kind: RefKind,
}

impl VcsRef {
    pub fn branch(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RefKind::Branch,
        }
    }

    pub fn tag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RefKind::Tag,
        }
    }

    /// Whether a user-supplied ref spelling names this ref.
    ///
    /// Accepts the bare name as well as `tags/<name>`, `heads/<name>`,
    /// `origin/<name>` and the same forms under `refs/`.
    pub fn matches(&self, requested: &str) -> bool {
        let requested = requested.trim();
        let requested = requested.strip_prefix("refs/").unwrap_or(requested);

        if let Some(rest) = requested.strip_prefix("tags/") {
            return self.kind == RefKind::Tag && self.name == rest;
        }
        let branch = requested
            .strip_prefix("heads/")
            .or_else(|| requested.strip_prefix("remotes/origin/"))
            .or_else(|| requested.strip_prefix("origin/"));
        if let Some(rest) = branch {
            return self.kind == RefKind::Branch && self.name == rest;
        }
        self.name == requested
    }
}

impl std::fmt::Display for VcsRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            RefKind::Branch => write!(f, "heads/{}", self.name),
            RefKind::Tag => write!(f, "tags/{}", self.name),
        }
    }
}

/// Source-control operations the engine needs.
///
/// `list_refs` returns the default branch first, then tags in the order they
/// were created upstream, then any other branches. `checkout` must leave the
/// working directory holding exactly the tree of the ref, with no leftovers
/// from whatever was checked out before.
pub trait Vcs: Send + Sync {
    fn clone_repo<'a>(&'a self, source: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<(), VcsError>>;

    fn list_refs<'a>(&'a self, dest: &'a Path) -> BoxFuture<'a, Result<Vec<VcsRef>, VcsError>>;

    fn checkout<'a>(&'a self, dest: &'a Path, reference: &'a VcsRef) -> BoxFuture<'a, Result<(), VcsError>>;

    fn fetch_refs<'a>(&'a self, dest: &'a Path) -> BoxFuture<'a, Result<(), VcsError>>;
}
