//! Metadata and naming operations: stat resolution, permissions, rename,
//! links, and the unsupported verbs.

mod common;

use common::{overlay_with, read_to_vec, write_at};
use rstest::rstest;
use scratchfs::FsError;
use std::fs;

#[test]
fn getattr_prefers_the_overlay_stat() {
    let fx = overlay_with(|base| fs::write(base.join("a.txt"), "12345").unwrap());

    let before = fx.fs.getattr("/a.txt").unwrap();
    assert_eq!(before.size, 5);

    fx.fs.chmod("/a.txt", 0o600).unwrap();
    let after = fx.fs.getattr("/a.txt").unwrap();
    assert_eq!(after.mode, 0o600);
    assert_eq!(after.size, 5);
}

#[test]
fn utimens_patches_only_the_times() {
    let fx = overlay_with(|base| fs::write(base.join("a.txt"), "12345").unwrap());

    fx.fs.utimens("/a.txt", Some((111, 222))).unwrap();
    let stat = fx.fs.getattr("/a.txt").unwrap();
    assert_eq!((stat.atime, stat.mtime), (111, 222));
    assert_eq!(stat.size, 5);
}

#[test]
fn rename_moves_content_and_stat() {
    let fx = overlay_with(|base| fs::write(base.join("old.txt"), "payload").unwrap());

    let before = fx.fs.getattr("/old.txt").unwrap();
    fx.fs.rename("/old.txt", "/new.txt").unwrap();

    assert!(!fx.fs.exists("/old.txt"));
    assert!(matches!(
        fx.fs.getattr("/old.txt"),
        Err(FsError::NotFound(_))
    ));
    let after = fx.fs.getattr("/new.txt").unwrap();
    assert_eq!(after.size, before.size);
    assert_eq!(read_to_vec(&fx.fs, "/new.txt"), b"payload");
    // Disk still holds the original name only.
    assert!(fx.base_path.join("old.txt").exists());
    assert!(!fx.base_path.join("new.txt").exists());
}

#[test]
fn rename_carries_overlay_edits() {
    let fx = overlay_with(|base| fs::write(base.join("old.txt"), "aaaa").unwrap());

    write_at(&fx.fs, "/old.txt", 0, b"edit");
    fx.fs.rename("/old.txt", "/renamed.txt").unwrap();

    assert_eq!(read_to_vec(&fx.fs, "/renamed.txt"), b"edit");
    let names = fx.fs.readdir("/").unwrap();
    assert_eq!(names, ["renamed.txt"]);
}

#[test]
fn rename_of_missing_path_is_reported() {
    let fx = overlay_with(|_| {});
    assert!(matches!(
        fx.fs.rename("/ghost", "/elsewhere"),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn mkdir_refuses_existing_paths() {
    let fx = overlay_with(|base| fs::create_dir(base.join("d")).unwrap());

    assert!(matches!(
        fx.fs.mkdir("/d", 0o755),
        Err(FsError::AlreadyExists(_))
    ));
    fx.fs.mkdir("/other", 0o755).unwrap();
    assert!(matches!(
        fx.fs.mkdir("/other", 0o755),
        Err(FsError::AlreadyExists(_))
    ));
}

#[test]
fn create_refuses_existing_paths() {
    let fx = overlay_with(|base| fs::write(base.join("a.txt"), "x").unwrap());

    assert!(matches!(
        fx.fs.create("/a.txt", 0o644),
        Err(FsError::AlreadyExists(_))
    ));
}

#[test]
fn symlink_round_trips_its_target() {
    let fx = overlay_with(|_| {});

    fx.fs.symlink("target/elsewhere", "/ln").unwrap();
    assert_eq!(fx.fs.readlink("/ln").unwrap(), "target/elsewhere");

    // Overlay-created symlinks carry executable bits for all classes.
    let mode = fx.fs.getattr("/ln").unwrap().mode;
    assert_eq!(
        mode & 0o111,
        0o111,
        "symlink mode should include x bits for user/group/other"
    );
}

#[test]
fn readlink_on_a_file_is_a_type_mismatch() {
    let fx = overlay_with(|_| {});

    fx.fs.create("/plain.txt", 0o644).unwrap();
    assert!(matches!(
        fx.fs.readlink("/plain.txt"),
        Err(FsError::TypeMismatch { .. })
    ));
}

#[test]
fn base_symlinks_resolve_through_the_accessor() {
    let fx = overlay_with(|base| {
        fs::write(base.join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink("real.txt", base.join("ln")).unwrap();
    });

    assert_eq!(fx.fs.readlink("/ln").unwrap(), "real.txt");
}

#[rstest]
#[case::read_denied(0o200, libc::R_OK, false)]
#[case::read_allowed(0o400, libc::R_OK, true)]
#[case::write_denied(0o400, libc::W_OK, false)]
#[case::write_allowed(0o600, libc::W_OK, true)]
#[case::exec_denied(0o600, libc::X_OK, false)]
#[case::exec_allowed(0o700, libc::X_OK, true)]
fn access_checks_owner_bits_of_overlaid_entries(
    #[case] mode: u32,
    #[case] requested: i32,
    #[case] allowed: bool,
) {
    let fx = overlay_with(|base| fs::write(base.join("a.txt"), "x").unwrap());

    fx.fs.chmod("/a.txt", mode).unwrap();
    let verdict = fx.fs.access("/a.txt", requested as u32);
    if allowed {
        verdict.unwrap();
    } else {
        assert!(matches!(verdict, Err(FsError::PermissionDenied(_))));
    }
}

#[test]
fn access_denies_tombstoned_paths() {
    let fx = overlay_with(|base| fs::write(base.join("a.txt"), "x").unwrap());

    fx.fs.unlink("/a.txt").unwrap();
    assert!(matches!(
        fx.fs.access("/a.txt", libc::R_OK as u32),
        Err(FsError::PermissionDenied(_))
    ));
}

#[test]
fn unsupported_operations_say_so() {
    let fx = overlay_with(|base| fs::write(base.join("a.txt"), "x").unwrap());

    assert!(matches!(
        fx.fs.chown("/a.txt", 0, 0),
        Err(FsError::NotSupported(_))
    ));
    assert!(matches!(
        fx.fs.link("/a.txt", "/hard"),
        Err(FsError::NotSupported(_))
    ));
    assert!(matches!(
        fx.fs.mknod("/dev-ish", 0o600, 7),
        Err(FsError::NotSupported(_))
    ));
}

#[test]
fn statfs_reports_the_base_filesystem() {
    let fx = overlay_with(|_| {});

    let usage = fx.fs.statfs("/").unwrap();
    assert!(usage.blocks > 0);
    assert!(usage.block_size > 0);
}
