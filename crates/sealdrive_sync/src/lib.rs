//! # SealDrive Sync
//!
//! Keeps a [`LocalCache`](sealdrive_core::LocalCache) in step with an
//! untrusted, versioned remote store.
//!
//! This crate provides:
//! - [`RemoteStore`]: the append-only remote, and [`InMemoryRemote`]
//! - [`RemoteHistoryClient`]: seals outgoing and verifies incoming manifests
//! - [`Synchronizer`]: the per-entry pull, merge and push cycle
//! - [`Drive`]: path-level operations and the background worker
//!
//! ## Example
//!
//! ```rust,no_run
//! use sealdrive_core::{AuthorId, EntryId, LocalCache, SecretKey, SigningIdentity};
//! use sealdrive_sync::{
//!     Credentials, Drive, InMemoryRemote, Keyring, RemoteHistoryClient, SyncConfig,
//!     Synchronizer,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = SigningIdentity::generate(AuthorId::new("alice@laptop"));
//! let keyring = Arc::new(Keyring::new());
//! keyring.register(identity.author().clone(), identity.verifying_key());
//!
//! let client = RemoteHistoryClient::new(
//!     Arc::new(InMemoryRemote::new()),
//!     keyring,
//!     Credentials::new(identity, SecretKey::generate()),
//! );
//! let sync = Arc::new(Synchronizer::new(
//!     SyncConfig::default(),
//!     Arc::new(LocalCache::in_memory()),
//!     client,
//! ));
//!
//! let drive = Drive::new(sync, EntryId::new())?;
//! drive.create_workspace()?;
//! let docs = drive.create_folder(drive.root(), "docs")?;
//! drive.create_file(docs, "notes.txt", b"hello")?;
//! drive.sync().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod drive;
mod edit;
mod engine;
mod error;
mod events;
mod keys;
mod remote;
mod state;

pub use config::{RetryConfig, SyncConfig};
pub use drive::Drive;
pub use engine::Synchronizer;
pub use error::{RemoteError, RemoteResult, SyncError, SyncResult};
pub use events::SyncEvent;
pub use keys::{AuthorKey, Credentials, KeyProvider, Keyring};
pub use remote::{InMemoryRemote, RemoteHistoryClient, RemoteObject, RemoteStore};
pub use state::{SyncOutcome, SyncReport, SyncState, SyncStats};
