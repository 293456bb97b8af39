//! Conversions between the overlay core's types and the FUSE wire types:
//! stat structs to `FileAttr`, typed failures to errno.

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, TimeOrNow};

use crate::base::NodeKind;
use crate::error::FsError;
use crate::overlay::entry::Stat;

/// Map std::io::Error to a libc error code, preferring the raw OS code
/// when one is available.
pub(crate) fn io_error_to_errno(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }
    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

/// Translate an overlay failure into the single errno the kernel sees.
pub(crate) fn errno_of(e: &FsError) -> i32 {
    match e {
        FsError::NotFound(_) => libc::ENOENT,
        FsError::AlreadyExists(_) => libc::EEXIST,
        FsError::PermissionDenied(_) => libc::EACCES,
        FsError::NotSupported(_) => libc::ENOSYS,
        FsError::TypeMismatch { .. } => libc::EINVAL,
        FsError::InvariantViolation(_) => libc::EIO,
        FsError::Io(err) => io_error_to_errno(err),
    }
}

fn secs_to_systemtime(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

pub(crate) fn time_or_now_to_secs(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(st) => st
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        TimeOrNow::Now => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
    }
}

fn mode_to_filetype(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        x if x == libc::S_IFDIR as u32 => FileType::Directory,
        x if x == libc::S_IFLNK as u32 => FileType::Symlink,
        x if x == libc::S_IFBLK as u32 => FileType::BlockDevice,
        x if x == libc::S_IFCHR as u32 => FileType::CharDevice,
        x if x == libc::S_IFIFO as u32 => FileType::NamedPipe,
        x if x == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

pub(crate) fn kind_to_filetype(kind: NodeKind, mode: u32) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Directory => FileType::Directory,
        NodeKind::Link => FileType::Symlink,
        // Base-tree specials pass through; their mode carries the type.
        NodeKind::Other => mode_to_filetype(mode),
    }
}

pub(crate) fn stat_to_fileattr(stat: &Stat, ino: u64, kind: NodeKind) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: secs_to_systemtime(stat.atime),
        mtime: secs_to_systemtime(stat.mtime),
        ctime: secs_to_systemtime(stat.ctime),
        crtime: secs_to_systemtime(stat.ctime),
        kind: kind_to_filetype(kind, stat.mode),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_the_taxonomy() {
        assert_eq!(errno_of(&FsError::NotFound("x".into())), libc::ENOENT);
        assert_eq!(errno_of(&FsError::AlreadyExists("x".into())), libc::EEXIST);
        assert_eq!(
            errno_of(&FsError::PermissionDenied("x".into())),
            libc::EACCES
        );
        assert_eq!(errno_of(&FsError::NotSupported("chown")), libc::ENOSYS);
        assert_eq!(
            errno_of(&FsError::TypeMismatch {
                path: "x".into(),
                expected: "symbolic link"
            }),
            libc::EINVAL
        );
        assert_eq!(
            errno_of(&FsError::InvariantViolation("x".into())),
            libc::EIO
        );
        assert_eq!(
            errno_of(&FsError::Io(io::Error::from_raw_os_error(libc::ENOTDIR))),
            libc::ENOTDIR
        );
    }

    #[test]
    fn overlay_created_entries_get_their_kind_from_the_entry_type() {
        // mkdir/create store bare permission bits; the entry type decides.
        let stat = Stat {
            mode: 0o755,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        };
        let attr = stat_to_fileattr(&stat, 5, NodeKind::Directory);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);
    }
}
