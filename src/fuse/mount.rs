//! Foreground mount entry point.

use std::path::Path;
use std::sync::Arc;

use fuser::MountOption;

use crate::base::DiskAccessor;
use crate::error::{FsError, Result};
use crate::fuse::ScratchFs;
use crate::overlay::Overlay;

#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    pub allow_root: bool,
    pub auto_unmount: bool,
}

/// Mount a scratch overlay of `base_dir` at `mountpoint` and serve it until
/// unmounted. The overlay lives in memory only; unmounting discards it and
/// leaves the base tree exactly as it was.
pub fn mount(base_dir: &Path, mountpoint: &Path, opts: MountOptions) -> Result<()> {
    if !mountpoint.is_dir() {
        return Err(FsError::NotFound(mountpoint.to_string_lossy().into_owned()));
    }

    let accessor = DiskAccessor::new(base_dir.to_path_buf())?;
    let overlay = Overlay::new(Arc::new(accessor));
    let fs = ScratchFs::new(overlay);

    let mut options = vec![MountOption::FSName("scratchfs".to_string())];
    if opts.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if opts.allow_root {
        options.push(MountOption::AllowRoot);
    }

    tracing::info!(
        "mounting scratch overlay of {} at {}",
        base_dir.display(),
        mountpoint.display()
    );
    fuser::mount2(fs, mountpoint, &options).map_err(FsError::Io)
}
