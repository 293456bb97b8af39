//! Base-tree access: the capability interface the overlay core holds, plus
//! the real-filesystem implementation backing a mount.
//!
//! All operations are path-relative to the base directory. The overlay core
//! never performs raw disk I/O itself, and nothing here mutates the base
//! tree: the accessor surface is reads, metadata, and handle lifecycle.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::statvfs::statvfs;
use nix::unistd::{access, AccessFlags};
use parking_lot::RwLock;

use crate::error::{FsError, Result};
use crate::overlay::entry::Stat;

/// Handle issued by a base accessor `open`, consumed by its handle-based
/// operations. Decoupled from the synthetic handles the overlay issues.
pub type BaseHandle = u64;

/// Node kind as probed from the base tree. `Other` covers device nodes,
/// sockets and pipes, which the overlay refuses to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Link,
    Other,
}

/// Filesystem usage numbers for `statfs`, in the shape FUSE replies want.
#[derive(Debug, Clone, Copy)]
pub struct FsUsage {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

/// Read-plus-lifecycle access to the tree the overlay is mounted over.
pub trait BaseAccessor: Send + Sync {
    fn exists(&self, path: &str) -> bool;
    fn stat(&self, path: &str) -> Result<Stat>;
    fn probe_kind(&self, path: &str) -> Result<NodeKind>;
    fn open(&self, path: &str, flags: i32) -> Result<BaseHandle>;
    fn read_at(&self, handle: BaseHandle, length: usize, offset: u64) -> Result<Vec<u8>>;
    fn read_path_at(&self, path: &str, length: usize, offset: u64) -> Result<Vec<u8>>;
    /// Entire file content, for one-time materialization into the overlay.
    fn read_all(&self, path: &str) -> Result<Vec<u8>>;
    fn readlink(&self, path: &str) -> Result<String>;
    fn list_children(&self, path: &str) -> Result<Vec<String>>;
    fn access(&self, path: &str, mode: u32) -> Result<()>;
    fn statfs(&self, path: &str) -> Result<FsUsage>;
    fn flush(&self, handle: BaseHandle) -> Result<()>;
    fn release(&self, handle: BaseHandle) -> Result<()>;
    fn fsync(&self, handle: BaseHandle, datasync: bool) -> Result<()>;
}

/// Map an I/O failure into the overlay taxonomy, keeping the path context.
fn io_to_fs(path: &str, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_string()),
        _ => FsError::Io(e),
    }
}

fn errno_to_fs(path: &str, errno: nix::errno::Errno) -> FsError {
    match errno {
        nix::errno::Errno::ENOENT => FsError::NotFound(path.to_string()),
        nix::errno::Errno::EACCES => FsError::PermissionDenied(path.to_string()),
        e => FsError::Io(io::Error::from_raw_os_error(e as i32)),
    }
}

/// `BaseAccessor` over a real on-disk directory tree.
pub struct DiskAccessor {
    root: PathBuf,
    next_handle: AtomicU64,
    open_files: RwLock<HashMap<BaseHandle, Arc<File>>>,
}

impl DiskAccessor {
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.is_dir() {
            return Err(FsError::NotFound(root.to_string_lossy().into_owned()));
        }
        Ok(DiskAccessor {
            root,
            next_handle: AtomicU64::new(1),
            open_files: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve a mount-relative path to an absolute path under the base
    /// directory.
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Clone out the file for `handle` so no lock is held during I/O.
    fn file_for(&self, handle: BaseHandle) -> Result<Arc<File>> {
        self.open_files
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("base handle {handle}")))
    }
}

impl BaseAccessor for DiskAccessor {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).symlink_metadata().is_ok()
    }

    fn stat(&self, path: &str) -> Result<Stat> {
        let meta = self
            .resolve(path)
            .symlink_metadata()
            .map_err(|e| io_to_fs(path, e))?;
        Ok(Stat {
            mode: meta.mode(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
            atime: meta.atime(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
        })
    }

    fn probe_kind(&self, path: &str) -> Result<NodeKind> {
        let meta = self
            .resolve(path)
            .symlink_metadata()
            .map_err(|e| io_to_fs(path, e))?;
        let ft = meta.file_type();
        Ok(if ft.is_symlink() {
            NodeKind::Link
        } else if ft.is_dir() {
            NodeKind::Directory
        } else if ft.is_file() {
            NodeKind::File
        } else {
            NodeKind::Other
        })
    }

    fn open(&self, path: &str, _flags: i32) -> Result<BaseHandle> {
        // Base handles only ever serve COW read-back; mutation never reaches
        // the base tree. Open read-only regardless of the caller's flags so
        // an O_TRUNC or O_WRONLY open cannot touch base content.
        let file = File::open(self.resolve(path)).map_err(|e| io_to_fs(path, e))?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.open_files.write().insert(handle, Arc::new(file));
        Ok(handle)
    }

    fn read_at(&self, handle: BaseHandle, length: usize, offset: u64) -> Result<Vec<u8>> {
        let file = self.file_for(handle)?;
        let mut buf = vec![0u8; length];
        let n = file.read_at(&mut buf, offset).map_err(FsError::Io)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn read_path_at(&self, path: &str, length: usize, offset: u64) -> Result<Vec<u8>> {
        let file = File::open(self.resolve(path)).map_err(|e| io_to_fs(path, e))?;
        let mut buf = vec![0u8; length];
        let n = file.read_at(&mut buf, offset).map_err(FsError::Io)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.resolve(path)).map_err(|e| io_to_fs(path, e))
    }

    fn readlink(&self, path: &str) -> Result<String> {
        let target = fs::read_link(self.resolve(path)).map_err(|e| io_to_fs(path, e))?;
        target.into_os_string().into_string().map_err(|_| {
            FsError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("non-UTF-8 symlink target at {path}"),
            ))
        })
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for dirent in fs::read_dir(self.resolve(path)).map_err(|e| io_to_fs(path, e))? {
            let dirent = dirent.map_err(FsError::Io)?;
            names.push(dirent.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn access(&self, path: &str, mode: u32) -> Result<()> {
        let flags = AccessFlags::from_bits_truncate(mode as i32);
        access(&self.resolve(path), flags).map_err(|e| errno_to_fs(path, e))
    }

    fn statfs(&self, path: &str) -> Result<FsUsage> {
        let vfs = statvfs(&self.resolve(path)).map_err(|e| errno_to_fs(path, e))?;
        Ok(FsUsage {
            blocks: vfs.blocks() as u64,
            blocks_free: vfs.blocks_free() as u64,
            blocks_available: vfs.blocks_available() as u64,
            files: vfs.files() as u64,
            files_free: vfs.files_free() as u64,
            block_size: vfs.block_size() as u32,
            name_max: vfs.name_max() as u32,
            fragment_size: vfs.fragment_size() as u32,
        })
    }

    fn flush(&self, handle: BaseHandle) -> Result<()> {
        // Read-only handles have nothing buffered; just verify liveness.
        self.file_for(handle).map(|_| ())
    }

    fn release(&self, handle: BaseHandle) -> Result<()> {
        self.open_files.write().remove(&handle);
        Ok(())
    }

    fn fsync(&self, handle: BaseHandle, datasync: bool) -> Result<()> {
        let file = self.file_for(handle)?;
        if datasync {
            file.sync_data().map_err(FsError::Io)
        } else {
            file.sync_all().map_err(FsError::Io)
        }
    }
}
