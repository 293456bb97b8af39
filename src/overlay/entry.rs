//! The entry store: the in-memory map of paths whose content or metadata
//! diverges from the base tree.
//!
//! Keys are absolute-from-mount path strings with `/` as the separator.
//! Identity is exact string equality; no `.`/`..`/trailing-separator
//! normalization happens here (the kernel adapter hands us clean paths).

use std::collections::HashMap;

/// Path separator used for all entry keys.
pub const SEP: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Deleted,
    File,
    Directory,
    Link,
}

/// File metadata, integer seconds since epoch for all timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// A partial stat update. Fields left `None` retain their current value
/// when merged onto an existing stat.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatPatch {
    pub mode: Option<u32>,
    pub nlink: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
    pub ctime: Option<i64>,
}

impl StatPatch {
    /// A patch carrying every field of `stat`, for freshly created entries.
    pub fn full(stat: Stat) -> Self {
        StatPatch {
            mode: Some(stat.mode),
            nlink: Some(stat.nlink),
            uid: Some(stat.uid),
            gid: Some(stat.gid),
            size: Some(stat.size),
            atime: Some(stat.atime),
            mtime: Some(stat.mtime),
            ctime: Some(stat.ctime),
        }
    }

    pub fn mode(mode: u32) -> Self {
        StatPatch {
            mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn times(atime: i64, mtime: i64) -> Self {
        StatPatch {
            atime: Some(atime),
            mtime: Some(mtime),
            ..Default::default()
        }
    }

    /// Patch for content changes: new size plus touched mtime/atime.
    pub fn content(size: u64, now: i64) -> Self {
        StatPatch {
            size: Some(size),
            atime: Some(now),
            mtime: Some(now),
            ..Default::default()
        }
    }

    /// Merge onto an existing stat: patched fields overwrite, the rest are
    /// retained.
    pub fn apply(&self, stat: Stat) -> Stat {
        Stat {
            mode: self.mode.unwrap_or(stat.mode),
            nlink: self.nlink.unwrap_or(stat.nlink),
            uid: self.uid.unwrap_or(stat.uid),
            gid: self.gid.unwrap_or(stat.gid),
            size: self.size.unwrap_or(stat.size),
            atime: self.atime.unwrap_or(stat.atime),
            mtime: self.mtime.unwrap_or(stat.mtime),
            ctime: self.ctime.unwrap_or(stat.ctime),
        }
    }

    /// Turn the patch into a complete stat. `None` if any of the eight
    /// fields is missing; the caller treats that as an invariant violation,
    /// not a user-facing failure.
    pub fn into_stat(self) -> Option<Stat> {
        Some(Stat {
            mode: self.mode?,
            nlink: self.nlink?,
            uid: self.uid?,
            gid: self.gid?,
            size: self.size?,
            atime: self.atime?,
            mtime: self.mtime?,
            ctime: self.ctime?,
        })
    }
}

/// Overlay payload: file bytes, or a symlink target. Directories and
/// tombstones carry no content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Bytes(Vec<u8>),
    Target(String),
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub entry_type: EntryType,
    pub content: Option<Content>,
    pub stat: Option<Stat>,
}

impl Entry {
    /// A deletion marker masking a base-tree path.
    pub fn tombstone() -> Self {
        Entry {
            entry_type: EntryType::Deleted,
            content: None,
            stat: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.entry_type != EntryType::Deleted
    }
}

/// Join a child name onto a directory path, special-casing the root so the
/// separator is never doubled.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}{SEP}{name}")
    }
}

/// Map from overlay path to entry. Process-wide state, initialized empty at
/// mount time and discarded at unmount; callers serialize access.
#[derive(Debug, Default)]
pub struct EntryStore {
    entries: HashMap<String, Entry>,
}

impl EntryStore {
    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn insert(&mut self, path: &str, entry: Entry) {
        self.entries.insert(path.to_string(), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(path)
    }

    /// Get the entry for `path`, inserting a blank slot first if none
    /// exists. The caller is expected to fill in type/stat before the
    /// store is observed again.
    pub fn slot(&mut self, path: &str, entry_type: EntryType) -> &mut Entry {
        self.entries
            .entry(path.to_string())
            .or_insert_with(|| Entry {
                entry_type,
                content: None,
                stat: None,
            })
    }

    /// Immediate overlay children of `dir`, live or not.
    ///
    /// The prefix check requires a separator boundary so siblings sharing a
    /// name prefix (`/foo` vs `/foobar`) never match each other, and the
    /// remainder must contain no further separator (direct children only).
    /// A linear scan over all entries: the overlay is expected to stay
    /// small relative to a full filesystem.
    pub fn children<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a str, &'a Entry)> + 'a {
        let prefix = if dir == "/" {
            dir.to_string()
        } else {
            format!("{dir}{SEP}")
        };
        self.entries.iter().filter_map(move |(path, entry)| {
            let rest = path.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains(SEP)).then_some((rest, entry))
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_with_size(size: u64) -> Stat {
        Stat {
            mode: 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size,
            atime: 10,
            mtime: 20,
            ctime: 30,
        }
    }

    #[test]
    fn patch_merge_overwrites_only_patched_fields() {
        let merged = StatPatch {
            size: Some(99),
            mtime: Some(777),
            ..Default::default()
        }
        .apply(stat_with_size(5));

        assert_eq!(merged.size, 99);
        assert_eq!(merged.mtime, 777);
        assert_eq!(merged.mode, 0o644);
        assert_eq!(merged.atime, 10);
    }

    #[test]
    fn incomplete_patch_cannot_become_a_stat() {
        assert!(StatPatch::mode(0o755).into_stat().is_none());
        assert!(StatPatch::full(stat_with_size(0)).into_stat().is_some());
    }

    #[test]
    fn join_path_handles_root() {
        assert_eq!(join_path("/", "a.txt"), "/a.txt");
        assert_eq!(join_path("/dir", "a.txt"), "/dir/a.txt");
    }

    #[test]
    fn children_respects_separator_boundary() {
        let mut store = EntryStore::default();
        store.insert("/foo/a", Entry::tombstone());
        store.insert("/foobar/b", Entry::tombstone());
        store.insert("/foo/deep/c", Entry::tombstone());
        store.insert("/foo", Entry::tombstone());

        let mut names: Vec<&str> = store.children("/foo").map(|(n, _)| n).collect();
        names.sort_unstable();
        assert_eq!(names, ["a"]);
    }

    #[test]
    fn children_of_root_are_not_doubled() {
        let mut store = EntryStore::default();
        store.insert("/top", Entry::tombstone());
        store.insert("/top/inner", Entry::tombstone());

        let names: Vec<&str> = store.children("/").map(|(n, _)| n).collect();
        assert_eq!(names, ["top"]);
    }
}
