//! Transactional persistence for the delta layer.
//!
//! The store is the source of truth for everything the overlay has changed:
//! inodes, directory entries, chunked file data, symlink targets, whiteouts
//! and copy-on-write origin mappings. Each entity family lives in its own
//! module; every operation comes in an auto-committing flavor and a
//! transaction-scoped `_tx` flavor.

mod data;
mod db;
mod dentry;
mod inode;
mod origin;
mod symlink;
mod whiteout;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use db::*;
pub use dentry::*;
pub use inode::*;
