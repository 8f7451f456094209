//! # SealDrive Storage
//!
//! Crash-safe record journals used to persist the SealDrive local cache.
//!
//! A journal is an append-only sequence of checksummed frames. Each frame
//! carries one opaque record; the journal never interprets the records it
//! stores. Higher layers write a full snapshot of the state they mutate in a
//! single frame, so a record is either entirely durable or entirely absent.
//!
//! ## Recovery rules
//!
//! - A truncated tail frame (crash mid-append) ends replay cleanly
//! - A checksum failure on the final frame is treated the same way
//! - A damaged frame followed by further data is reported as corruption
//!
//! ## Available Backends
//!
//! - [`MemoryJournal`] - For testing and ephemeral caches
//! - [`FileJournal`] - Persistent journal with an exclusive file lock
//!
//! ## Example
//!
//! ```rust
//! use sealdrive_storage::{JournalBackend, MemoryJournal};
//!
//! let mut journal = MemoryJournal::new();
//! journal.append(b"first").unwrap();
//! journal.append(b"second").unwrap();
//! journal.flush().unwrap();
//!
//! let records = journal.replay().unwrap();
//! assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod frame;
mod memory;

pub use backend::JournalBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileJournal;
pub use frame::{compute_crc32, decode_frames, encode_frame, Replay, FRAME_MAGIC};
pub use memory::MemoryJournal;
