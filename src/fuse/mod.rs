//! Kernel-facing FUSE adapter.
//!
//! fuser speaks inodes; the overlay core is keyed by path strings. This
//! adapter owns the inode-to-path table, hands each verb to the core with
//! a path, and translates typed failures into errno replies.

mod convert;
pub mod mount;

pub use mount::{mount, MountOptions};

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};

use crate::error::Result;
use crate::overlay::entry::join_path;
use crate::overlay::Overlay;
use convert::{errno_of, stat_to_fileattr, time_or_now_to_secs};

/// Bidirectional inode/path bookkeeping for the kernel protocol.
///
/// Inode numbers are allocated once per path and kept for the lifetime of
/// the mount; the overlay is expected to stay small, so the table is never
/// evicted.
struct InodeMap {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    next_ino: u64,
}

impl InodeMap {
    fn new() -> Self {
        let mut map = InodeMap {
            paths: HashMap::new(),
            inos: HashMap::new(),
            // Inode 1 is reserved by FUSE for the root directory.
            next_ino: FUSE_ROOT_ID + 1,
        };
        map.paths.insert(FUSE_ROOT_ID, "/".to_string());
        map.inos.insert("/".to_string(), FUSE_ROOT_ID);
        map
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_string());
        self.inos.insert(path.to_string(), ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn drop_path(&mut self, path: &str) {
        if let Some(ino) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    /// Re-key a path after rename, keeping its inode number. If the
    /// destination already had an inode, that mapping is displaced.
    fn remap(&mut self, old: &str, new: &str) {
        if let Some(ino) = self.inos.remove(old) {
            if let Some(displaced) = self.inos.insert(new.to_string(), ino) {
                self.paths.remove(&displaced);
            }
            self.paths.insert(ino, new.to_string());
        }
    }
}

pub struct ScratchFs {
    overlay: Overlay,
    inodes: InodeMap,
    /// Attribute and entry cache timeout handed to the kernel. Short,
    /// because overlay state can change under concurrent handles.
    ttl: Duration,
}

impl ScratchFs {
    pub fn new(overlay: Overlay) -> Self {
        ScratchFs {
            overlay,
            inodes: InodeMap::new(),
            ttl: Duration::from_secs(1),
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.inodes.path_of(parent)?;
        Some(join_path(&parent_path, &name.to_string_lossy()))
    }

    fn parent_path(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &path[..idx],
        }
    }

    fn attr_of(&mut self, path: &str) -> Result<FileAttr> {
        let stat = self.overlay.getattr(path)?;
        let kind = self.overlay.kind_of(path)?;
        let ino = self.inodes.ino_for(path);
        Ok(stat_to_fileattr(&stat, ino, kind))
    }
}

impl Filesystem for ScratchFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("scratch overlay initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("scratch overlay destroyed; all overlay state discarded");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_of(&path) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_of(&path) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Some(mode) = mode {
            if let Err(e) = self.overlay.chmod(&path, mode) {
                reply.error(errno_of(&e));
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = self
                .overlay
                .chown(&path, uid.unwrap_or_default(), gid.unwrap_or_default())
            {
                reply.error(errno_of(&e));
                return;
            }
        }
        if let Some(size) = size {
            if let Err(e) = self.overlay.truncate(&path, size, fh) {
                reply.error(errno_of(&e));
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let times = (
                atime.map(time_or_now_to_secs),
                mtime.map(time_or_now_to_secs),
            );
            let filled = match times {
                (Some(a), Some(m)) => Some((a, m)),
                (Some(a), None) => Some((a, time_or_now_to_secs(TimeOrNow::Now))),
                (None, Some(m)) => Some((time_or_now_to_secs(TimeOrNow::Now), m)),
                (None, None) => None,
            };
            if let Err(e) = self.overlay.utimens(&path, filled) {
                reply.error(errno_of(&e));
                return;
            }
        }

        match self.attr_of(&path) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.mknod(&path, mode, rdev as u64) {
            Err(e) => reply.error(errno_of(&e)),
            Ok(()) => reply.error(libc::ENOSYS),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Err(e) = self.overlay.mkdir(&path, mode) {
            reply.error(errno_of(&e));
            return;
        }
        match self.attr_of(&path) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.unlink(&path) {
            Ok(()) => {
                self.inodes.drop_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.rmdir(&path) {
            Ok(()) => {
                self.inodes.drop_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let target = link.to_string_lossy();
        if let Err(e) = self.overlay.symlink(&target, &path) {
            reply.error(errno_of(&e));
            return;
        }
        match self.attr_of(&path) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old), Some(new)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.rename(&old, &new) {
            Ok(()) => {
                self.inodes.remap(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(path), Some(new_path)) =
            (self.inodes.path_of(ino), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.link(&path, &new_path) {
            Err(e) => reply.error(errno_of(&e)),
            Ok(()) => reply.error(libc::ENOSYS),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fh = match self.overlay.create(&path, mode) {
            Ok(fh) => fh,
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };
        match self.attr_of(&path) {
            Ok(attr) => reply.created(&self.ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self
            .overlay
            .read(&path, size as usize, offset.max(0) as u64, fh)
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.write(&path, data, offset.max(0) as u64, fh) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.overlay.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.overlay.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.overlay.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::debug!("readdir(ino={}, offset={})", ino, offset);
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mut names = match self.overlay.readdir(&path) {
            Ok(names) => names,
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };
        // The merge is unordered; sort so readdir offsets stay stable
        // across calls.
        names.sort_unstable();

        let parent_ino = self.inodes.ino_for(Self::parent_path(&path));
        let mut entries: Vec<(u64, fuser::FileType, String)> = vec![
            (ino, fuser::FileType::Directory, ".".to_string()),
            (parent_ino, fuser::FileType::Directory, "..".to_string()),
        ];
        for name in names {
            let child = join_path(&path, &name);
            // A child can vanish between the merge and this probe; skip it.
            let Ok(kind) = self.overlay.kind_of(&child) else {
                continue;
            };
            let mode = self.overlay.getattr(&child).map(|s| s.mode).unwrap_or(0);
            let child_ino = self.inodes.ino_for(&child);
            entries.push((child_ino, convert::kind_to_filetype(kind, mode), name));
        }

        for (idx, (child_ino, file_type, name)) in
            entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(child_ino, (idx + 1) as i64, file_type, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.statfs(&path) {
            Ok(usage) => reply.statfs(
                usage.blocks,
                usage.blocks_free,
                usage.blocks_available,
                usage.files,
                usage.files_free,
                usage.block_size,
                usage.name_max,
                usage.fragment_size,
            ),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.access(&path, mask as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }
}
