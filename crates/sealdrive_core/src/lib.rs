//! # SealDrive Core
//!
//! Data model and local state of the SealDrive synchronization engine.
//!
//! This crate provides:
//! - Identifiers ([`EntryId`], [`AuthorId`], [`BlockId`], [`Timestamp`])
//! - The manifest model for files and folders ([`Manifest`])
//! - Sealing and verification of manifests ([`crypto`])
//! - Chunking and sealing of file content ([`blocks`])
//! - The pure three-way merge ([`merge()`]) and [`ConflictRecord`]s
//! - The local cache of confirmed and pending state ([`LocalCache`])
//!
//! Nothing here talks to the network; see `sealdrive_sync`.
//!
//! ## Example
//!
//! ```rust
//! use sealdrive_core::{
//!     AuthorId, EntryId, FolderManifest, LocalCache, Manifest, ManifestContent, Timestamp,
//! };
//!
//! let cache = LocalCache::in_memory();
//! let root = EntryId::new();
//! let manifest = Manifest::new(
//!     root,
//!     None,
//!     ManifestContent::Folder(FolderManifest::new()),
//!     AuthorId::new("alice@laptop"),
//!     Timestamp::now(),
//! );
//!
//! cache.stage_edit(root, 0, manifest).unwrap();
//! assert!(cache.get_entry(root).unwrap().is_placeholder());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod blocks;
mod cache;
mod codec;
mod config;
mod conflict;
pub mod crypto;
mod error;
mod manifest;
pub mod merge;
mod types;

pub use blocks::{open_block, Chunker, SealedBlock, DEFAULT_BLOCK_SIZE};
pub use cache::{LocalCache, VersionedEntry};
pub use codec::{from_cbor, sha256, to_cbor};
pub use config::CacheConfig;
pub use conflict::{ConflictRecord, Resolution};
pub use crypto::{SecretKey, SigningIdentity, VerifyingKey};
pub use error::{
    BlockError, CacheError, CacheResult, CoreError, CoreResult, VerificationError,
};
pub use manifest::{
    conflict_name, validate_name, BlockRef, FileManifest, FolderManifest, Manifest,
    ManifestContent, Precedence, MAX_NAME_LEN,
};
pub use merge::{merge, MergeContext, MergeOutcome, PreservedContent};
pub use types::{AuthorId, BlockId, EntryId, Timestamp, Version};
