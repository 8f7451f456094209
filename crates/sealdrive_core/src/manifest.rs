//! The manifest model: versioned snapshots of files and folders.
//!
//! A [`Manifest`] is immutable once constructed. Every mutation goes
//! through [`Manifest::successor`], which produces a new manifest at
//! `version + 1`.

use crate::codec::FieldHasher;
use crate::error::{CoreError, CoreResult};
use crate::types::{AuthorId, BlockId, EntryId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Longest child name accepted in a folder, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Reference to one encrypted block of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    /// Content address of the sealed block.
    pub id: BlockId,
    /// Offset of the block's plaintext in the file.
    pub offset: u64,
    /// Plaintext length.
    pub size: u64,
    /// SHA-256 of the plaintext.
    pub digest: [u8; 32],
}

/// Content of a regular file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileManifest {
    /// Blocks in file order.
    pub blocks: Vec<BlockRef>,
    /// Total plaintext size.
    pub size: u64,
    /// Block size used when chunking.
    pub block_size: u64,
}

impl FileManifest {
    /// Creates an empty file.
    #[must_use]
    pub fn empty(block_size: u64) -> Self {
        Self {
            blocks: Vec::new(),
            size: 0,
            block_size,
        }
    }

    /// Checks that blocks tile `0..size` in order without gaps.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] describing the first defect.
    pub fn validate(&self) -> CoreResult<()> {
        let mut expected_offset = 0u64;
        for block in &self.blocks {
            if block.offset != expected_offset {
                return Err(CoreError::invalid_operation(format!(
                    "block {} starts at {}, expected {expected_offset}",
                    block.id, block.offset
                )));
            }
            if block.size == 0 || block.size > self.block_size {
                return Err(CoreError::invalid_operation(format!(
                    "block {} has size {} with block size {}",
                    block.id, block.size, self.block_size
                )));
            }
            expected_offset = expected_offset.checked_add(block.size).ok_or_else(|| {
                CoreError::invalid_operation(format!("block {} overflows the file size", block.id))
            })?;
        }
        if expected_offset != self.size {
            return Err(CoreError::invalid_operation(format!(
                "blocks cover {expected_offset} bytes, file size is {}",
                self.size
            )));
        }
        Ok(())
    }
}

/// Content of a folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderManifest {
    /// Live children by name. Names are case-sensitive.
    pub children: BTreeMap<String, EntryId>,
    /// Names whose deletion has been recorded. Only ever grows.
    pub tombstones: BTreeSet<String>,
}

impl FolderManifest {
    /// Creates an empty folder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a child by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<EntryId> {
        self.children.get(name).copied()
    }

    /// Finds the name under which an entry is linked.
    #[must_use]
    pub fn name_of(&self, id: EntryId) -> Option<&str> {
        self.children
            .iter()
            .find(|(_, child)| **child == id)
            .map(|(name, _)| name.as_str())
    }

    /// Returns a copy with `name` linked to `id`.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid or already taken.
    pub fn with_child(&self, name: &str, id: EntryId) -> CoreResult<Self> {
        validate_name(name)?;
        if self.children.contains_key(name) {
            return Err(CoreError::invalid_operation(format!(
                "name already exists: {name}"
            )));
        }
        let mut next = self.clone();
        next.children.insert(name.to_string(), id);
        Ok(next)
    }

    /// Returns a copy with `name` unlinked and tombstoned.
    ///
    /// # Errors
    ///
    /// Fails if no child has that name.
    pub fn without_child(&self, name: &str) -> CoreResult<(Self, EntryId)> {
        let mut next = self.clone();
        let id = next
            .children
            .remove(name)
            .ok_or_else(|| CoreError::invalid_operation(format!("no such child: {name}")))?;
        next.tombstones.insert(name.to_string());
        Ok((next, id))
    }

    /// Returns a copy with a child renamed.
    ///
    /// # Errors
    ///
    /// Fails if `from` is missing or `to` is invalid or taken.
    pub fn renamed(&self, from: &str, to: &str) -> CoreResult<Self> {
        let (without, id) = self.without_child(from)?;
        without.with_child(to, id)
    }

    /// Checks every child name.
    ///
    /// # Errors
    ///
    /// Returns the first invalid name.
    pub fn validate(&self) -> CoreResult<()> {
        self.children.keys().try_for_each(|name| validate_name(name))
    }
}

/// Checks that a string can be used as a child name.
///
/// # Errors
///
/// Rejects empty names, `.` and `..`, names with `/` or NUL, and names
/// longer than [`MAX_NAME_LEN`] bytes.
pub fn validate_name(name: &str) -> CoreResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
        || name.len() > MAX_NAME_LEN;
    if invalid {
        return Err(CoreError::invalid_operation(format!(
            "invalid entry name: {name:?}"
        )));
    }
    Ok(())
}

/// Room left for a ` (n)` disambiguation suffix.
const SUFFIX_RESERVE: usize = 8;

/// Longest author segment kept in a conflict name, in bytes.
const CONFLICT_AUTHOR_LEN: usize = 64;

/// Name given to a preserved or renamed entry after a conflict.
///
/// The author and the original name are shortened if needed so the result
/// stays a valid child name.
#[must_use]
pub fn conflict_name(original: &str, author: &AuthorId, timestamp: Timestamp) -> String {
    let author: String = author
        .as_str()
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    let author = truncate(&author, CONFLICT_AUTHOR_LEN);
    let suffix = format!(" (conflict - {author} - {timestamp})");

    let budget = MAX_NAME_LEN.saturating_sub(SUFFIX_RESERVE + suffix.len());
    format!("{}{suffix}", truncate(original, budget))
}

fn truncate(s: &str, max: usize) -> &str {
    let mut cut = s.len().min(max);
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

/// Content carried by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManifestContent {
    /// A regular file.
    File(FileManifest),
    /// A folder.
    Folder(FolderManifest),
}

impl ManifestContent {
    fn hash_into(&self, hasher: &mut FieldHasher) {
        match self {
            Self::File(file) => {
                hasher
                    .tag(0)
                    .u64(file.size)
                    .u64(file.block_size)
                    .u64(file.blocks.len() as u64);
                for block in &file.blocks {
                    hasher
                        .bytes(block.id.as_bytes())
                        .u64(block.offset)
                        .u64(block.size)
                        .bytes(&block.digest);
                }
            }
            Self::Folder(folder) => {
                hasher.tag(1).u64(folder.children.len() as u64);
                for (name, id) in &folder.children {
                    hasher.bytes(name.as_bytes()).bytes(id.as_bytes());
                }
                hasher.u64(folder.tombstones.len() as u64);
                for name in &folder.tombstones {
                    hasher.bytes(name.as_bytes());
                }
            }
        }
    }
}

/// Versioned snapshot of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Manifest {
    /// Entry this manifest describes.
    pub entry_id: EntryId,
    /// Version, starting at 1.
    pub version: Version,
    /// Author of this version.
    pub author: AuthorId,
    /// Time claimed by the author.
    pub timestamp: Timestamp,
    /// Containing folder; `None` only for the workspace root.
    pub parent: Option<EntryId>,
    /// File or folder content.
    pub content: ManifestContent,
}

impl Manifest {
    /// Creates the first version of a new entry.
    #[must_use]
    pub fn new(
        entry_id: EntryId,
        parent: Option<EntryId>,
        content: ManifestContent,
        author: AuthorId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            entry_id,
            version: 1,
            author,
            timestamp,
            parent,
            content,
        }
    }

    /// Creates the next version of this entry.
    ///
    /// # Errors
    ///
    /// Fails if the version counter is exhausted.
    pub fn successor(
        &self,
        parent: Option<EntryId>,
        content: ManifestContent,
        author: AuthorId,
        timestamp: Timestamp,
    ) -> CoreResult<Self> {
        let version = self.version.checked_add(1).ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "no version after v{} of {}",
                self.version, self.entry_id
            ))
        })?;
        Ok(Self {
            entry_id: self.entry_id,
            version,
            author,
            timestamp,
            parent,
            content,
        })
    }

    /// Returns the folder content, if this is a folder.
    #[must_use]
    pub fn as_folder(&self) -> Option<&FolderManifest> {
        match &self.content {
            ManifestContent::Folder(folder) => Some(folder),
            ManifestContent::File(_) => None,
        }
    }

    /// Returns the file content, if this is a file.
    #[must_use]
    pub fn as_file(&self) -> Option<&FileManifest> {
        match &self.content {
            ManifestContent::File(file) => Some(file),
            ManifestContent::Folder(_) => None,
        }
    }

    /// Returns true if this manifest describes a folder.
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.as_folder().is_some()
    }

    /// Returns true if both manifests describe the same tree state,
    /// ignoring version, author and timestamp.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        self.parent == other.parent && self.content == other.content
    }

    /// Deterministic digest over every field.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = FieldHasher::default();
        hasher
            .bytes(self.entry_id.as_bytes())
            .u64(self.version)
            .bytes(self.author.as_str().as_bytes())
            .u64(self.timestamp.as_micros() as u64);
        match self.parent {
            Some(parent) => hasher.tag(1).bytes(parent.as_bytes()),
            None => hasher.tag(0),
        };
        self.content.hash_into(&mut hasher);
        hasher.finish()
    }

    /// Ordering key used to pick a winner between concurrent versions.
    #[must_use]
    pub fn precedence(&self) -> Precedence<'_> {
        Precedence {
            timestamp: self.timestamp,
            author: &self.author,
            digest: self.digest(),
        }
    }

    /// Checks structural validity of the content.
    ///
    /// # Errors
    ///
    /// Returns the first defect found.
    pub fn validate(&self) -> CoreResult<()> {
        if self.version == 0 {
            return Err(CoreError::invalid_operation("manifest version 0"));
        }
        if self.parent == Some(self.entry_id) {
            return Err(CoreError::invalid_operation("entry is its own parent"));
        }
        match &self.content {
            ManifestContent::File(file) => file.validate(),
            ManifestContent::Folder(folder) => {
                if folder.children.values().any(|id| *id == self.entry_id) {
                    return Err(CoreError::invalid_operation("folder contains itself"));
                }
                folder.validate()
            }
        }
    }
}

/// Strict total order over manifests: `(timestamp, author, digest)`.
///
/// Two different manifests never compare equal, which makes every merge
/// decision deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precedence<'a> {
    timestamp: Timestamp,
    author: &'a AuthorId,
    digest: [u8; 32],
}

impl Ord for Precedence<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.author.cmp(other.author))
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for Precedence<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
