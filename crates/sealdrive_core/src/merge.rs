//! Deterministic three-way merge of concurrent manifest versions.
//!
//! [`merge`] is a pure, total function of `(base, a, b)` plus a
//! [`MergeContext`]. Swapping `a` and `b` yields the same outcome: every
//! decision that cannot be taken by comparing against the base is settled
//! by [`Manifest::precedence`], never by argument position.
//!
//! Rules:
//!
//! - Fields changed on one side only take that side's value.
//! - File content changed on both sides keeps the higher-precedence
//!   content and hands back the other as [`PreservedContent`].
//! - Folder children merge name by name. Additions union, a delete
//!   concurrent with an edit of the same child keeps the child, and two
//!   entries claiming one name keep the higher side's entry while the
//!   other is renamed with [`conflict_name`].
//! - Tombstones union and never shrink.

use crate::conflict::Resolution;
use crate::manifest::{conflict_name, FileManifest, FolderManifest, Manifest, ManifestContent};
use crate::types::{AuthorId, EntryId, Timestamp};
use std::collections::{BTreeMap, BTreeSet};

/// Facts about the rest of the tree the merge may consult.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeContext {
    edited: BTreeSet<EntryId>,
}

impl MergeContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context from the set of children edited concurrently.
    pub fn with_edited(edited: impl IntoIterator<Item = EntryId>) -> Self {
        Self {
            edited: edited.into_iter().collect(),
        }
    }

    /// Records that `id` was edited concurrently with the merge.
    pub fn mark_edited(&mut self, id: EntryId) {
        self.edited.insert(id);
    }

    /// Returns true if `id` was edited concurrently.
    #[must_use]
    pub fn is_edited(&self, id: EntryId) -> bool {
        self.edited.contains(&id)
    }
}

/// File content that lost a merge and must be re-linked as a sibling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservedContent {
    /// The losing content.
    pub content: FileManifest,
    /// Author of the losing version.
    pub author: AuthorId,
    /// Timestamp of the losing version.
    pub timestamp: Timestamp,
}

impl PreservedContent {
    /// Name for the sibling holding this content.
    #[must_use]
    pub fn sibling_name(&self, original: &str) -> String {
        conflict_name(original, &self.author, self.timestamp)
    }
}

/// Result of merging two versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Merged parent.
    pub parent: Option<EntryId>,
    /// Merged content.
    pub content: ManifestContent,
    /// Losing file content, if file contents forked.
    pub preserved: Option<PreservedContent>,
    /// Decisions taken that were not plain one-sided changes.
    pub resolutions: Vec<Resolution>,
}

impl MergeOutcome {
    /// Returns true if both sides' changes combined without any decision.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.resolutions.is_empty()
    }
}

/// Merges two versions of one entry that both extend `base`.
///
/// `base` is `None` when the entry had no common ancestor (both sides are
/// first versions).
#[must_use]
pub fn merge(
    base: Option<&Manifest>,
    a: &Manifest,
    b: &Manifest,
    ctx: &MergeContext,
) -> MergeOutcome {
    let a_wins = a.precedence() >= b.precedence();
    let (winner, loser) = if a_wins { (a, b) } else { (b, a) };
    let mut resolutions = Vec::new();

    let parent = three_way(base.map(|m| m.parent), a.parent, b.parent).unwrap_or_else(|| {
        resolutions.push(Resolution::ChoseParent {
            parent: winner.parent,
        });
        winner.parent
    });

    let (content, preserved) = match (&a.content, &b.content) {
        (ManifestContent::Folder(fa), ManifestContent::Folder(fb)) => {
            let side = FolderSides {
                a: fa,
                b: fb,
                a_wins,
                loser,
            };
            let merged = side.merge(base.and_then(Manifest::as_folder), ctx, &mut resolutions);
            (ManifestContent::Folder(merged), None)
        }
        _ => merge_opaque(base.map(|m| &m.content), a, b, winner, loser, &mut resolutions),
    };

    MergeOutcome {
        parent,
        content,
        preserved,
        resolutions,
    }
}

/// One-sided change detection. `None` means both sides changed the value
/// differently.
fn three_way<T: PartialEq + Clone>(base: Option<T>, a: T, b: T) -> Option<T> {
    if a == b {
        Some(a)
    } else if base.as_ref() == Some(&a) {
        Some(b)
    } else if base.as_ref() == Some(&b) {
        Some(a)
    } else {
        None
    }
}

fn merge_opaque(
    base: Option<&ManifestContent>,
    a: &Manifest,
    b: &Manifest,
    winner: &Manifest,
    loser: &Manifest,
    resolutions: &mut Vec<Resolution>,
) -> (ManifestContent, Option<PreservedContent>) {
    if let Some(content) = three_way(base, &a.content, &b.content) {
        return (content.clone(), None);
    }

    resolutions.push(Resolution::KeptNewerContent {
        kept_author: winner.author.clone(),
        kept_timestamp: winner.timestamp,
        preserved_author: loser.author.clone(),
        preserved_timestamp: loser.timestamp,
    });
    let preserved = loser.as_file().map(|file| PreservedContent {
        content: file.clone(),
        author: loser.author.clone(),
        timestamp: loser.timestamp,
    });
    (winner.content.clone(), preserved)
}

/// Where a link in the merged folder came from. Lower ranks win when one
/// entry ends up linked under several names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Origin {
    Both,
    Winner,
    Loser,
    Rescued,
}

#[derive(Debug, Clone)]
struct Link {
    id: EntryId,
    origin: Origin,
    note: Option<Resolution>,
}

struct FolderSides<'a> {
    a: &'a FolderManifest,
    b: &'a FolderManifest,
    a_wins: bool,
    loser: &'a Manifest,
}

impl FolderSides<'_> {
    fn origin_of_a(&self) -> Origin {
        if self.a_wins {
            Origin::Winner
        } else {
            Origin::Loser
        }
    }

    fn origin_of_b(&self) -> Origin {
        if self.a_wins {
            Origin::Loser
        } else {
            Origin::Winner
        }
    }

    fn merge(
        &self,
        base: Option<&FolderManifest>,
        ctx: &MergeContext,
        resolutions: &mut Vec<Resolution>,
    ) -> FolderManifest {
        let empty = FolderManifest::new();
        let base = base.unwrap_or(&empty);

        let mut tombstones: BTreeSet<String> = base
            .tombstones
            .iter()
            .chain(&self.a.tombstones)
            .chain(&self.b.tombstones)
            .cloned()
            .collect();

        let names: BTreeSet<&String> = base
            .children
            .keys()
            .chain(self.a.children.keys())
            .chain(self.b.children.keys())
            .collect();

        let mut links: BTreeMap<String, Link> = BTreeMap::new();
        let mut displaced: Vec<(String, EntryId)> = Vec::new();

        for name in names {
            let o = base.get(name);
            let x = self.a.get(name);
            let y = self.b.get(name);

            let link = if x == y {
                x.map(|id| Link {
                    id,
                    origin: Origin::Both,
                    note: None,
                })
            } else if x == o {
                self.take_change(name, o, y, self.origin_of_b(), ctx)
            } else if y == o {
                self.take_change(name, o, x, self.origin_of_a(), ctx)
            } else {
                match (x, y) {
                    (Some(x), Some(y)) => {
                        let (kept, lost, origin) = if self.a_wins {
                            (x, y, self.origin_of_a())
                        } else {
                            (y, x, self.origin_of_b())
                        };
                        displaced.push((name.clone(), lost));
                        Some(Link {
                            id: kept,
                            origin,
                            note: None,
                        })
                    }
                    // Deleted on one side, replaced on the other: the edit wins.
                    (None, Some(id)) => Some(kept_edited(name, id, self.origin_of_b())),
                    (Some(id), None) => Some(kept_edited(name, id, self.origin_of_a())),
                    (None, None) => None,
                }
            };

            match link {
                Some(link) => {
                    if link.note.is_some() || (o.is_some() && o != Some(link.id)) {
                        tombstones.insert(name.clone());
                    }
                    links.insert(name.clone(), link);
                }
                None => {
                    if o.is_some() {
                        tombstones.insert(name.clone());
                    }
                }
            }
        }

        for (name, id) in displaced {
            let renamed_to = free_name(
                &links,
                &conflict_name(&name, &self.loser.author, self.loser.timestamp),
            );
            links.insert(
                renamed_to.clone(),
                Link {
                    id,
                    origin: Origin::Loser,
                    note: Some(Resolution::RenamedChild {
                        name,
                        entry_id: id,
                        renamed_to,
                    }),
                },
            );
        }

        let children = dedupe(links, resolutions);
        FolderManifest {
            children,
            tombstones,
        }
    }

    /// Takes the changed side's value for `name`, unless the change is a
    /// delete of a child that was edited concurrently.
    fn take_change(
        &self,
        name: &str,
        base: Option<EntryId>,
        changed: Option<EntryId>,
        origin: Origin,
        ctx: &MergeContext,
    ) -> Option<Link> {
        match (base, changed) {
            (Some(id), None) if ctx.is_edited(id) => Some(Link {
                id,
                origin: Origin::Rescued,
                note: Some(Resolution::KeptEditedChild {
                    name: name.to_string(),
                    entry_id: id,
                }),
            }),
            (_, changed) => changed.map(|id| Link {
                id,
                origin,
                note: None,
            }),
        }
    }
}

fn kept_edited(name: &str, id: EntryId, origin: Origin) -> Link {
    Link {
        id,
        origin,
        note: Some(Resolution::KeptEditedChild {
            name: name.to_string(),
            entry_id: id,
        }),
    }
}

fn free_name(links: &BTreeMap<String, Link>, candidate: &str) -> String {
    if !links.contains_key(candidate) {
        return candidate.to_string();
    }
    (2u64..)
        .map(|n| format!("{candidate} ({n})"))
        .find(|name| !links.contains_key(name))
        .unwrap_or_else(|| candidate.to_string())
}

/// Keeps one name per entry: the lowest origin rank, then the smallest name.
fn dedupe(
    links: BTreeMap<String, Link>,
    resolutions: &mut Vec<Resolution>,
) -> BTreeMap<String, EntryId> {
    let mut best: BTreeMap<EntryId, (Origin, &String)> = BTreeMap::new();
    for (name, link) in &links {
        let candidate = (link.origin, name);
        best.entry(link.id)
            .and_modify(|current| {
                if candidate < *current {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    let mut children = BTreeMap::new();
    let mut notes = Vec::new();
    for (name, link) in &links {
        let keep = best.get(&link.id).is_some_and(|(_, kept)| *kept == name);
        if keep {
            children.insert(name.clone(), link.id);
            notes.extend(link.note.clone());
        } else if link.origin != Origin::Rescued {
            notes.push(Resolution::DroppedDuplicateLink {
                name: name.clone(),
                entry_id: link.id,
            });
        }
    }
    resolutions.extend(notes);
    children
}
