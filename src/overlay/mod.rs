//! The overlay core: a copy-on-write view over a base directory tree.
//!
//! Mutations land in an in-memory entry store keyed by path; reads fall
//! through to the base accessor until a path has been overlaid. Deletions
//! of base-tree paths leave a tombstone entry that masks them.

pub mod entry;
pub mod handle;
pub mod splice;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::base::{BaseAccessor, BaseHandle, FsUsage, NodeKind};
use crate::error::{FsError, Result};
use entry::{join_path, Content, Entry, EntryStore, EntryType, Stat, StatPatch};
use handle::HandleTable;

/// Current time in whole seconds since the epoch.
fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Shared mutable overlay state, serialized by a single lock.
///
/// Overlay-only work is cheap (map lookups, buffer slicing), so one
/// coarse lock per operation is enough for the low-concurrency sandboxing
/// this targets. The lock is never held across a base-accessor call.
#[derive(Default)]
struct OverlayState {
    entries: EntryStore,
    handles: HandleTable,
}

/// Where a non-overlaid read should be routed.
enum ReadRoute {
    Handle(BaseHandle),
    Path,
}

pub struct Overlay {
    base: Arc<dyn BaseAccessor>,
    state: Mutex<OverlayState>,
    uid: u32,
    gid: u32,
}

impl Overlay {
    pub fn new(base: Arc<dyn BaseAccessor>) -> Self {
        Overlay {
            base,
            state: Mutex::new(OverlayState::default()),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    /// Stat for a newly created entry: requested mode, owned by the
    /// mounting user, empty, all timestamps now.
    fn fresh_stat(&self, mode: u32) -> Stat {
        let now = unix_now();
        Stat {
            mode,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    // Path resolution
    // ===============

    /// A path exists if it has a live overlay entry, or has no overlay
    /// entry and the base tree has it.
    pub fn exists(&self, path: &str) -> bool {
        {
            let st = self.state.lock();
            if let Some(entry) = st.entries.get(path) {
                return entry.is_live();
            }
        }
        self.base.exists(path)
    }

    pub fn getattr(&self, path: &str) -> Result<Stat> {
        {
            let st = self.state.lock();
            if let Some(entry) = st.entries.get(path) {
                return if entry.is_live() {
                    entry.stat.ok_or_else(|| {
                        FsError::InvariantViolation(format!("entry {path} has no stat"))
                    })
                } else {
                    Err(FsError::NotFound(path.to_string()))
                };
            }
        }
        self.base.stat(path)
    }

    /// Node kind at `path`: overlay entry type if overlaid, else probed
    /// from the base tree.
    pub fn kind_of(&self, path: &str) -> Result<NodeKind> {
        {
            let st = self.state.lock();
            if let Some(entry) = st.entries.get(path) {
                return match entry.entry_type {
                    EntryType::Deleted => Err(FsError::NotFound(path.to_string())),
                    EntryType::File => Ok(NodeKind::File),
                    EntryType::Directory => Ok(NodeKind::Directory),
                    EntryType::Link => Ok(NodeKind::Link),
                };
            }
        }
        self.base.probe_kind(path)
    }

    // Entry store mutators
    // ====================

    /// Ensure an overlay entry exists for `path` and fold the supplied
    /// type/content/stat-patch into it.
    ///
    /// With no explicit type, the kind (and starting stat) are inferred
    /// from the base tree, which must hold the path. File and link content
    /// is materialized from the base at most once per path; later calls
    /// only see the in-memory copy. Base fetches happen with the lock
    /// released; the commit re-checks the entry so a concurrent
    /// materialization is not overwritten.
    fn ensure_entry(
        &self,
        path: &str,
        ty: Option<EntryType>,
        content: Option<Content>,
        patch: StatPatch,
    ) -> Result<()> {
        let (known_type, known_content) = {
            let st = self.state.lock();
            match st.entries.get(path) {
                Some(e) => (Some(e.entry_type), e.content.is_some()),
                None => (None, false),
            }
        };

        let mut inferred_stat = None;
        let effective = match ty.or(known_type) {
            Some(t) => t,
            None => {
                let t = match self.base.probe_kind(path)? {
                    NodeKind::File => EntryType::File,
                    NodeKind::Directory => EntryType::Directory,
                    NodeKind::Link => EntryType::Link,
                    NodeKind::Other => {
                        return Err(FsError::InvariantViolation(format!(
                            "unsupported base node kind at {path}"
                        )))
                    }
                };
                // First divergence of a base entry: adopt its stat as the
                // starting point for the patch merge.
                inferred_stat = Some(self.base.stat(path)?);
                t
            }
        };

        if effective == EntryType::Deleted {
            let mut st = self.state.lock();
            st.entries.slot(path, EntryType::Deleted).entry_type = EntryType::Deleted;
            return Ok(());
        }

        let fetched = if content.is_none() && !known_content {
            match effective {
                EntryType::File => {
                    tracing::debug!("materializing {} from base tree", path);
                    Some(Content::Bytes(self.base.read_all(path)?))
                }
                EntryType::Link => Some(Content::Target(self.base.readlink(path)?)),
                _ => None,
            }
        } else {
            None
        };

        let mut st = self.state.lock();

        // Merge the stat before touching the entry: a failed completeness
        // check must leave the store exactly as it was.
        let prior_stat = st.entries.get(path).and_then(|e| e.stat);
        let merged = match prior_stat.or(inferred_stat) {
            Some(s) => patch.apply(s),
            None => patch.into_stat().ok_or_else(|| {
                FsError::InvariantViolation(format!("incomplete stat for new entry {path}"))
            })?,
        };

        let slot = st.entries.slot(path, effective);
        slot.entry_type = effective;
        if let Some(c) = content {
            slot.content = Some(c);
        } else if slot.content.is_none() {
            if let Some(f) = fetched {
                slot.content = Some(f);
            }
        }
        slot.stat = Some(merged);
        Ok(())
    }

    /// Remove visibility of `path`: tombstone it if the base tree holds
    /// it, otherwise drop the entry outright. Callers have already
    /// confirmed existence.
    fn delete_entry(&self, path: &str) {
        let in_base = self.base.exists(path);
        let mut st = self.state.lock();
        if in_base {
            st.entries.insert(path, Entry::tombstone());
        } else {
            st.entries.remove(path);
        }
    }

    // Metadata & naming operations
    // ============================

    /// Check the requested read/write/execute bits for overlaid entries
    /// against the owner permission bits: the owning identity is assumed
    /// to equal the caller's. Non-overlaid paths get the base verdict.
    pub fn access(&self, path: &str, mode: u32) -> Result<()> {
        {
            let st = self.state.lock();
            if let Some(entry) = st.entries.get(path) {
                if !entry.is_live() {
                    return Err(FsError::PermissionDenied(path.to_string()));
                }
                let bits = entry
                    .stat
                    .ok_or_else(|| {
                        FsError::InvariantViolation(format!("entry {path} has no stat"))
                    })?
                    .mode;
                let checks = [
                    (libc::R_OK as u32, libc::S_IRUSR as u32),
                    (libc::W_OK as u32, libc::S_IWUSR as u32),
                    (libc::X_OK as u32, libc::S_IXUSR as u32),
                ];
                for (req, owner_bit) in checks {
                    if mode & req != 0 && bits & owner_bit == 0 {
                        return Err(FsError::PermissionDenied(path.to_string()));
                    }
                }
                return Ok(());
            }
        }
        self.base.access(path, mode)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        tracing::debug!("chmod {} {:o}", path, mode);
        self.ensure_entry(path, None, None, StatPatch::mode(mode))
    }

    pub fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> Result<()> {
        Err(FsError::NotSupported("chown"))
    }

    pub fn utimens(&self, path: &str, times: Option<(i64, i64)>) -> Result<()> {
        let (atime, mtime) = times.unwrap_or_else(|| {
            let now = unix_now();
            (now, now)
        });
        self.ensure_entry(path, None, None, StatPatch::times(atime, mtime))
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        if self.exists(path) {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        self.ensure_entry(
            path,
            Some(EntryType::Directory),
            None,
            StatPatch::full(self.fresh_stat(mode)),
        )
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        tracing::debug!("unlink {}", path);
        if !self.exists(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        self.delete_entry(path);
        Ok(())
    }

    /// Recursively remove a directory, then mask the directory itself.
    ///
    /// Child removal goes through the public operations so the overlay
    /// lock is never held across the recursion.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        tracing::debug!("rmdir {}", path);
        if !self.exists(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        for name in self.readdir(path)? {
            let child = join_path(path, &name);
            match self.kind_of(&child)? {
                NodeKind::Directory => self.rmdir(&child)?,
                _ => self.unlink(&child)?,
            }
        }
        self.delete_entry(path);
        Ok(())
    }

    pub fn symlink(&self, target: &str, path: &str) -> Result<()> {
        tracing::debug!("symlink {} <- {}", target, path);
        if self.exists(path) {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let mode =
            libc::S_IFLNK as u32 | libc::S_IXUSR as u32 | libc::S_IXGRP as u32 | libc::S_IXOTH as u32;
        self.ensure_entry(
            path,
            Some(EntryType::Link),
            Some(Content::Target(target.to_string())),
            StatPatch::full(self.fresh_stat(mode)),
        )
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        {
            let st = self.state.lock();
            if let Some(entry) = st.entries.get(path) {
                return match (&entry.entry_type, &entry.content) {
                    (EntryType::Link, Some(Content::Target(t))) => Ok(t.clone()),
                    (EntryType::Link, _) => Err(FsError::InvariantViolation(format!(
                        "link entry {path} has no target"
                    ))),
                    _ => Err(FsError::TypeMismatch {
                        path: path.to_string(),
                        expected: "symbolic link",
                    }),
                };
            }
        }
        self.base.readlink(path)
    }

    /// Move `old` to `new`: pull `old` into the overlay, copy its entry to
    /// the new key, then delete the old one. The copy is independent; the
    /// two keys never share backing storage.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        tracing::debug!("rename {} -> {}", old, new);
        if !self.exists(old) {
            return Err(FsError::NotFound(old.to_string()));
        }
        self.ensure_entry(old, None, None, StatPatch::default())?;
        {
            let mut st = self.state.lock();
            let copied = st.entries.get(old).cloned().ok_or_else(|| {
                FsError::InvariantViolation(format!("rename source {old} vanished"))
            })?;
            st.entries.insert(new, copied);
        }
        self.delete_entry(old);
        Ok(())
    }

    pub fn link(&self, _target: &str, _path: &str) -> Result<()> {
        Err(FsError::NotSupported("hard links"))
    }

    pub fn mknod(&self, _path: &str, _mode: u32, _rdev: u64) -> Result<()> {
        Err(FsError::NotSupported("device nodes"))
    }

    /// Space accounting comes straight from the base tree; the overlay has
    /// no independent model of it.
    pub fn statfs(&self, path: &str) -> Result<FsUsage> {
        self.base.statfs(path)
    }

    // Directory merging
    // =================

    /// Union listing of a directory: base children not shadowed by any
    /// overlay entry, plus live overlay children. Order is unspecified.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let base_children = match self.base.list_children(path) {
            Ok(names) => names,
            // The directory may exist only in the overlay.
            Err(FsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let st = self.state.lock();
        let mut names: Vec<String> = base_children
            .into_iter()
            .filter(|name| !st.entries.contains(&join_path(path, name)))
            .collect();
        for (name, entry) in st.entries.children(path) {
            if entry.is_live() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    // File handles & content
    // ======================

    pub fn open(&self, path: &str, flags: i32) -> Result<u64> {
        tracing::debug!("open {} {:#x}", path, flags);
        {
            let mut st = self.state.lock();
            if st.entries.contains(path) {
                return Ok(st.handles.issue(None));
            }
        }
        let base_handle = self.base.open(path, flags)?;
        let mut st = self.state.lock();
        Ok(st.handles.issue(Some(base_handle)))
    }

    pub fn create(&self, path: &str, mode: u32) -> Result<u64> {
        tracing::debug!("create {} {:o}", path, mode);
        if self.exists(path) {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        self.ensure_entry(
            path,
            Some(EntryType::File),
            Some(Content::Bytes(Vec::new())),
            StatPatch::full(self.fresh_stat(mode)),
        )?;
        Ok(self.state.lock().handles.issue(None))
    }

    /// Read existing bytes: an overlaid file answers from its in-memory
    /// buffer (clipped); otherwise the base accessor serves the range via
    /// the handle mapping, or by path when the handle is purely virtual.
    fn read_slice(&self, path: &str, length: usize, offset: u64, fh: Option<u64>) -> Result<Vec<u8>> {
        let route = {
            let st = self.state.lock();
            if let Some(entry) = st.entries.get(path) {
                return match (&entry.entry_type, &entry.content) {
                    (EntryType::File, Some(Content::Bytes(data))) => {
                        Ok(splice::clip(data, offset, length).to_vec())
                    }
                    (EntryType::File, _) => Err(FsError::InvariantViolation(format!(
                        "file entry {path} has no content"
                    ))),
                    (EntryType::Deleted, _) => Err(FsError::NotFound(path.to_string())),
                    _ => Err(FsError::TypeMismatch {
                        path: path.to_string(),
                        expected: "regular file",
                    }),
                };
            }
            match fh.and_then(|fh| st.handles.get(fh)) {
                Some(Some(base_handle)) => ReadRoute::Handle(base_handle),
                _ => ReadRoute::Path,
            }
        };
        match route {
            ReadRoute::Handle(base_handle) => self.base.read_at(base_handle, length, offset),
            ReadRoute::Path => self.base.read_path_at(path, length, offset),
        }
    }

    fn check_handle(&self, fh: u64) -> Result<()> {
        if self.state.lock().handles.contains(fh) {
            Ok(())
        } else {
            Err(FsError::NotFound(format!("file handle {fh}")))
        }
    }

    pub fn read(&self, path: &str, length: usize, offset: u64, fh: u64) -> Result<Vec<u8>> {
        tracing::debug!("read {} [{}, +{}]", path, offset, length);
        self.check_handle(fh)?;
        if !self.exists(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        // atime is deliberately left alone: a read must not force a copy
        // of the file into the overlay.
        self.read_slice(path, length, offset, Some(fh))
    }

    /// Write `buf` at `offset`, reconstructing the full content around it.
    /// Accepts the whole buffer; partial writes are not modeled.
    pub fn write(&self, path: &str, buf: &[u8], offset: u64, fh: u64) -> Result<usize> {
        tracing::debug!("write {} [{}, +{}]", path, offset, buf.len());
        self.check_handle(fh)?;
        if !self.exists(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        {
            let st = self.state.lock();
            if let Some(entry) = st.entries.get(path) {
                if entry.entry_type != EntryType::File {
                    return Err(FsError::TypeMismatch {
                        path: path.to_string(),
                        expected: "regular file",
                    });
                }
            }
        }

        let size = self.getattr(path)?.size;
        let existing = self.read_slice(path, size as usize, 0, Some(fh))?;
        let merged = splice::splice(&existing, offset, buf);
        let new_size = merged.len() as u64;

        self.ensure_entry(
            path,
            None,
            Some(Content::Bytes(merged)),
            StatPatch::content(new_size, unix_now()),
        )?;
        self.release_base_mapping(fh)?;
        Ok(buf.len())
    }

    /// Clamp content to `length` bytes. Never grows the file: a length
    /// beyond the current size leaves it at the smaller original size.
    pub fn truncate(&self, path: &str, length: u64, fh: Option<u64>) -> Result<()> {
        tracing::debug!("truncate {} to {}", path, length);
        let size = self.getattr(path)?.size;
        let new_len = size.min(length);
        let data = if length == 0 {
            Vec::new()
        } else {
            self.read_slice(path, new_len as usize, 0, fh)?
        };
        let new_size = data.len() as u64;

        self.ensure_entry(
            path,
            None,
            Some(Content::Bytes(data)),
            StatPatch::content(new_size, unix_now()),
        )?;
        if let Some(fh) = fh {
            self.release_base_mapping(fh)?;
        }
        Ok(())
    }

    /// Once a path is overlaid its base handle is dead weight; drop the
    /// mapping and close the base side, keeping the synthetic handle live.
    fn release_base_mapping(&self, fh: u64) -> Result<()> {
        let released = self.state.lock().handles.downgrade(fh);
        match released {
            Some(base_handle) => self.base.release(base_handle),
            None => Ok(()),
        }
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        let mapped = self.state.lock().handles.get(fh).flatten();
        match mapped {
            Some(base_handle) => self.base.flush(base_handle),
            None => Ok(()),
        }
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let mapped = self.state.lock().handles.get(fh).flatten();
        match mapped {
            Some(base_handle) => self.base.fsync(base_handle, datasync),
            None => Ok(()),
        }
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        let removed = self.state.lock().handles.remove(fh);
        match removed {
            Some(Some(base_handle)) => self.base.release(base_handle),
            _ => Ok(()),
        }
    }

    #[cfg(test)]
    pub fn tombstoned(&self, path: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(path)
            .is_some_and(|e| !e.is_live())
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}
