//! `agentfs` is a copy-on-write overlay filesystem for sandboxed agent
//! workspaces.
//!
//! A read-only base layer exposes a host directory tree while a delta layer
//! captures every mutation as durable records in a SQLite store. The merged
//! view behaves like a normal POSIX tree: deletions of base paths become
//! whiteouts and first writes copy the base entity up into the delta. The
//! result is surfaced to a sandbox through FUSE, leaving the host untouched.

#![warn(missing_docs)]

mod basefs;
mod defaults;
mod deltafs;
mod error;
mod filesystem;
mod overlayfs;
mod stats;
mod whiteout;

pub mod fuse;
pub mod path;
pub mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use basefs::*;
pub use defaults::*;
pub use deltafs::*;
pub use error::*;
pub use filesystem::*;
pub use overlayfs::*;
pub use stats::*;
pub use whiteout::*;
