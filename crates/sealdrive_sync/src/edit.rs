//! Read-modify-write of local entries.

use crate::error::{SyncError, SyncResult};
use sealdrive_core::{
    AuthorId, CacheError, CoreError, EntryId, FolderManifest, LocalCache, Manifest, ManifestContent,
    Timestamp,
};

const MAX_EDIT_ATTEMPTS: usize = 16;

/// New parent and content for an entry, plus a value for the caller.
pub(crate) type Change<T> = (Option<EntryId>, ManifestContent, T);

/// Applies `f` to the current state of `id` and stages the result as the
/// pending edit. Retries when the entry changes underneath.
pub(crate) fn update_entry<T>(
    cache: &LocalCache,
    author: &AuthorId,
    id: EntryId,
    mut f: impl FnMut(&Manifest) -> SyncResult<Change<T>>,
) -> SyncResult<(Manifest, T)> {
    for _ in 0..MAX_EDIT_ATTEMPTS {
        let seen = cache.get_entry(id).ok_or(SyncError::NotFound(id))?;
        let current = seen.current().ok_or(SyncError::NotFound(id))?;
        let (parent, content, value) = f(current)?;
        let manifest = seen
            .derive_pending(parent, content, author.clone(), Timestamp::now())
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "no version after v{} of {id}",
                    seen.base_version
                ))
            })?;

        match cache.revise_pending(id, &seen, manifest.clone()) {
            Ok(()) => return Ok((manifest, value)),
            Err(CacheError::StaleBase { .. } | CacheError::PendingChanged(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(SyncError::EditContended(id))
}

/// Like [`update_entry`] for folders: `f` gets the current children.
pub(crate) fn update_folder<T>(
    cache: &LocalCache,
    author: &AuthorId,
    id: EntryId,
    mut f: impl FnMut(&FolderManifest) -> SyncResult<(FolderManifest, T)>,
) -> SyncResult<(Manifest, T)> {
    update_entry(cache, author, id, |current| {
        let folder = current.as_folder().ok_or(SyncError::NotAFolder(id))?;
        let (next, value) = f(folder)?;
        Ok((current.parent, ManifestContent::Folder(next), value))
    })
}

/// `name`, or `name (n)` for the smallest free `n`.
pub(crate) fn unique_name(folder: &FolderManifest, name: &str) -> String {
    if folder.get(name).is_none() {
        return name.to_string();
    }
    (1u32..)
        .map(|n| format!("{name} ({n})"))
        .find(|candidate| folder.get(candidate).is_none())
        .unwrap_or_else(|| name.to_string())
}
