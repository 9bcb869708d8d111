//! In-memory [`Vcs`] driver.
//!
//! Origins live in memory and are addressed by an arbitrary source string.
//! Clones are written to disk like a real checkout, so callers can inspect the
//! working tree without a git binary.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures_util::{FutureExt, future::BoxFuture};

use crate::error::VcsError;
use crate::vcs::{Vcs, VcsRef};

/// Relative path to file contents.
pub type Tree = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct Origin {
    default_branch: String,
    branches: BTreeMap<String, Tree>,
    tags: Vec<(String, Tree)>,
}

impl Origin {
    fn refs(&self) -> Vec<(VcsRef, Tree)> {
        let mut out = Vec::new();
        if let Some(tree) = self.branches.get(&self.default_branch) {
            out.push((VcsRef::branch(self.default_branch.clone()), tree.clone()));
        }
        for (name, tree) in &self.tags {
            out.push((VcsRef::tag(name.clone()), tree.clone()));
        }
        for (name, tree) in &self.branches {
            if *name != self.default_branch {
                out.push((VcsRef::branch(name.clone()), tree.clone()));
            }
        }
        out
    }
}

#[derive(Debug)]
struct Checkout {
    source: String,
    refs: Vec<(VcsRef, Tree)>,
}

#[derive(Debug, Default)]
struct State {
    origins: HashMap<String, Origin>,
    clones: HashMap<PathBuf, Checkout>,
    failing: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryVcs {
    state: Mutex<State>,
    gate: tokio::sync::Mutex<()>,
    checkouts_started: AtomicUsize,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates an empty origin whose default branch is `default_branch`.
    pub fn create_origin(&self, source: &str, default_branch: &str) {
        let mut branches = BTreeMap::new();
        branches.insert(default_branch.to_string(), Tree::new());
        self.state().origins.insert(
            source.to_string(),
            Origin {
                default_branch: default_branch.to_string(),
                branches,
                tags: Vec::new(),
            },
        );
    }

    /// Writes `path` on `branch` of the origin, creating the branch from the
    /// default branch if needed.
    pub fn commit(&self, source: &str, branch: &str, path: &str, contents: &str) {
        let mut state = self.state();
        let Some(origin) = state.origins.get_mut(source) else {
            return;
        };
        let base = origin
            .branches
            .get(&origin.default_branch)
            .cloned()
            .unwrap_or_default();
        origin
            .branches
            .entry(branch.to_string())
            .or_insert(base)
            .insert(path.to_string(), contents.to_string());
    }

    /// Tags the current head of the origin's default branch.
    pub fn tag(&self, source: &str, name: &str) {
        let mut state = self.state();
        let Some(origin) = state.origins.get_mut(source) else {
            return;
        };
        let tree = origin
            .branches
            .get(&origin.default_branch)
            .cloned()
            .unwrap_or_default();
        origin.tags.retain(|(n, _)| n != name);
        origin.tags.push((name.to_string(), tree));
    }

    /// Makes every checkout of a ref named `name` fail halfway through.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_checkouts_of(&self, name: &str) {
        self.state().failing.insert(name.to_string());
    }

    /// Holds every checkout until the returned guard is dropped.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn pause_checkouts(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn checkouts_started(&self) -> usize {
        self.checkouts_started.load(Ordering::SeqCst)
    }
}

impl Vcs for MemoryVcs {
    fn clone_repo<'a>(&'a self, source: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<(), VcsError>> {
        async move {
            let refs = {
                let state = self.state();
                let origin = state.origins.get(source).ok_or_else(|| VcsError::Command {
                    command: format!("clone {source}"),
                    message: "repository not found".to_string(),
                })?;
                origin.refs()
            };
            let Some((_, head)) = refs.first() else {
                return Err(VcsError::EmptyRepository);
            };
            write_tree(dest, head, None).await?;

            self.state().clones.insert(
                dest.to_path_buf(),
                Checkout {
                    source: source.to_string(),
                    refs,
                },
            );
            Ok(())
        }
        .boxed()
    }

    fn list_refs<'a>(&'a self, dest: &'a Path) -> BoxFuture<'a, Result<Vec<VcsRef>, VcsError>> {
        async move {
            let state = self.state();
            let clone = state.clones.get(dest).ok_or_else(|| not_a_clone(dest))?;
            Ok(clone.refs.iter().map(|(r, _)| r.clone()).collect())
        }
        .boxed()
    }

    fn checkout<'a>(&'a self, dest: &'a Path, reference: &'a VcsRef) -> BoxFuture<'a, Result<(), VcsError>> {
        async move {
            self.checkouts_started.fetch_add(1, Ordering::SeqCst);
            let _gate = self.gate.lock().await;

            let (tree, failing) = {
                let state = self.state();
                let clone = state.clones.get(dest).ok_or_else(|| not_a_clone(dest))?;
                let tree = clone
                    .refs
                    .iter()
                    .find(|(r, _)| r == reference)
                    .map(|(_, t)| t.clone())
                    .ok_or_else(|| VcsError::UnknownRef(reference.to_string()))?;
                (tree, state.failing.contains(&reference.name))
            };

            if failing {
                write_tree(dest, &tree, Some(1)).await?;
                return Err(VcsError::Command {
                    command: format!("checkout {reference}"),
                    message: "simulated failure".to_string(),
                });
            }
            write_tree(dest, &tree, None).await
        }
        .boxed()
    }

    fn fetch_refs<'a>(&'a self, dest: &'a Path) -> BoxFuture<'a, Result<(), VcsError>> {
        async move {
            let mut state = self.state();
            let source = state
                .clones
                .get(dest)
                .map(|c| c.source.clone())
                .ok_or_else(|| not_a_clone(dest))?;
            let refs = state
                .origins
                .get(&source)
                .map(Origin::refs)
                .ok_or_else(|| VcsError::Command {
                    command: format!("fetch {source}"),
                    message: "repository not found".to_string(),
                })?;
            if let Some(clone) = state.clones.get_mut(dest) {
                clone.refs = refs;
            }
            Ok(())
        }
        .boxed()
    }
}

fn not_a_clone(dest: &Path) -> VcsError {
    VcsError::Command {
        command: "status".to_string(),
        message: format!("{} is not a repository", dest.display()),
    }
}

/// Replaces the contents of `dest` with `tree`. `limit` stops after that many
/// files, leaving a partial tree behind.
async fn write_tree(dest: &Path, tree: &Tree, limit: Option<usize>) -> Result<(), VcsError> {
    let io = |e: std::io::Error| VcsError::Command {
        command: format!("write {}", dest.display()),
        message: e.to_string(),
    };

    tokio::fs::create_dir_all(dest).await.map_err(io)?;
    let mut entries = tokio::fs::read_dir(dest).await.map_err(io)?;
    while let Some(entry) = entries.next_entry().await.map_err(io)? {
        let path = entry.path();
        if entry.file_type().await.map_err(io)?.is_dir() {
            tokio::fs::remove_dir_all(&path).await.map_err(io)?;
        } else {
            tokio::fs::remove_file(&path).await.map_err(io)?;
        }
    }

    for (rel, contents) in tree.iter().take(limit.unwrap_or(usize::MAX)) {
        let path = dest.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::write(&path, contents).await.map_err(io)?;
    }
    Ok(())
}
