use std::path::{Path, PathBuf};
use std::sync::Arc;

use scratchfs::{DiskAccessor, Overlay};
use tempfile::TempDir;

/// A scratch overlay mounted (in-process) over a throwaway base tree.
/// The tempdir is held so the base survives for the test's lifetime.
pub struct Fixture {
    pub base_path: PathBuf,
    pub fs: Overlay,
    _base: TempDir,
}

/// Build an overlay over a fresh base tree populated by `setup`.
pub fn overlay_with(setup: impl FnOnce(&Path)) -> Fixture {
    let base = TempDir::new().unwrap();
    setup(base.path());
    let accessor = DiskAccessor::new(base.path().to_path_buf()).unwrap();
    Fixture {
        base_path: base.path().to_path_buf(),
        fs: Overlay::new(Arc::new(accessor)),
        _base: base,
    }
}

/// Open-write-release in one step.
#[allow(dead_code)]
pub fn write_at(fs: &Overlay, path: &str, offset: u64, data: &[u8]) -> usize {
    let fh = fs.open(path, libc::O_WRONLY).unwrap();
    let written = fs.write(path, data, offset, fh).unwrap();
    fs.release(fh).unwrap();
    written
}

/// Read the full current content of `path` through the overlay.
#[allow(dead_code)]
pub fn read_to_vec(fs: &Overlay, path: &str) -> Vec<u8> {
    let size = fs.getattr(path).unwrap().size as usize;
    let fh = fs.open(path, libc::O_RDONLY).unwrap();
    let data = fs.read(path, size, 0, fh).unwrap();
    fs.release(fh).unwrap();
    data
}
