//! Versioned application checkouts.
//!
//! The [`DeploymentEngine`] owns every application directory under its root and
//! keeps each one equal to the tree of exactly one ref. Source control is reached
//! through the [`Vcs`] trait; [`GitCli`] drives the `git` binary and
//! [`MemoryVcs`] keeps repositories in memory.

pub mod engine;
pub mod error;
pub mod git;
pub mod memory;
pub mod store;
pub mod vcs;

pub use engine::{Application, DeploymentEngine};
pub use error::{DeployError, DeployResult, VcsError};
pub use git::GitCli;
pub use memory::MemoryVcs;
pub use vcs::{RefKind, Vcs, VcsRef};
