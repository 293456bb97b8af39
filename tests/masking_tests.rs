//! Deletion masking and directory merging.

mod common;

use common::{overlay_with, write_at};
use scratchfs::FsError;
use std::fs;

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort_unstable();
    names
}

#[test]
fn unlinked_base_file_disappears_without_touching_disk() {
    let fx = overlay_with(|base| {
        fs::write(base.join("keep.txt"), "k").unwrap();
        fs::write(base.join("gone.txt"), "g").unwrap();
    });

    fx.fs.unlink("/gone.txt").unwrap();

    assert!(!fx.fs.exists("/gone.txt"));
    assert!(matches!(
        fx.fs.getattr("/gone.txt"),
        Err(FsError::NotFound(_))
    ));
    assert_eq!(sorted(fx.fs.readdir("/").unwrap()), ["keep.txt"]);
    // The base tree is untouched.
    assert!(fx.base_path.join("gone.txt").exists());
}

#[test]
fn unlink_of_missing_path_is_reported() {
    let fx = overlay_with(|_| {});
    assert!(matches!(
        fx.fs.unlink("/nothing"),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn overridden_base_child_lists_exactly_once() {
    let fx = overlay_with(|base| {
        fs::write(base.join("a.txt"), "base").unwrap();
        fs::write(base.join("b.txt"), "base").unwrap();
    });

    write_at(&fx.fs, "/b.txt", 0, b"overlay");
    fx.fs.unlink("/a.txt").unwrap();

    let names = fx.fs.readdir("/").unwrap();
    assert_eq!(sorted(names), ["b.txt"]);
}

#[test]
fn merge_unions_base_and_overlay_children() {
    let fx = overlay_with(|base| {
        fs::create_dir(base.join("dir")).unwrap();
        fs::write(base.join("dir/base.txt"), "b").unwrap();
    });

    fx.fs.create("/dir/fresh.txt", 0o644).unwrap();
    fx.fs.mkdir("/dir/sub", 0o755).unwrap();

    assert_eq!(
        sorted(fx.fs.readdir("/dir").unwrap()),
        ["base.txt", "fresh.txt", "sub"]
    );
}

#[test]
fn overlay_only_directories_list_their_children() {
    let fx = overlay_with(|_| {});

    fx.fs.mkdir("/new", 0o755).unwrap();
    fx.fs.create("/new/inside.txt", 0o644).unwrap();

    assert_eq!(sorted(fx.fs.readdir("/new").unwrap()), ["inside.txt"]);
}

/// Sibling paths sharing a name prefix must not leak into each other's
/// listings.
#[test]
fn prefix_sharing_siblings_stay_separate() {
    let fx = overlay_with(|base| {
        fs::create_dir(base.join("foo")).unwrap();
        fs::create_dir(base.join("foobar")).unwrap();
    });

    fx.fs.create("/foo/one.txt", 0o644).unwrap();
    fx.fs.create("/foobar/two.txt", 0o644).unwrap();

    assert_eq!(fx.fs.readdir("/foo").unwrap(), ["one.txt"]);
    assert_eq!(fx.fs.readdir("/foobar").unwrap(), ["two.txt"]);
}

#[test]
fn rmdir_removes_a_populated_tree() {
    let fx = overlay_with(|base| {
        fs::create_dir_all(base.join("top/nested")).unwrap();
        fs::write(base.join("top/file.txt"), "f").unwrap();
        fs::write(base.join("top/nested/deep.txt"), "d").unwrap();
    });

    fx.fs.rmdir("/top").unwrap();

    assert!(!fx.fs.exists("/top"));
    assert!(!fx.fs.exists("/top/file.txt"));
    assert!(!fx.fs.exists("/top/nested/deep.txt"));
    assert!(fx.fs.readdir("/").unwrap().is_empty());
    // Everything is still on disk.
    assert!(fx.base_path.join("top/nested/deep.txt").exists());
}

#[test]
fn rmdir_of_missing_directory_is_reported() {
    let fx = overlay_with(|_| {});
    assert!(matches!(fx.fs.rmdir("/nope"), Err(FsError::NotFound(_))));
}

#[test]
fn deleted_directory_can_be_recreated_empty() {
    let fx = overlay_with(|base| {
        fs::create_dir(base.join("d")).unwrap();
        fs::write(base.join("d/old.txt"), "o").unwrap();
    });

    fx.fs.rmdir("/d").unwrap();
    fx.fs.mkdir("/d", 0o755).unwrap();

    assert!(fx.fs.exists("/d"));
    assert!(fx.fs.readdir("/d").unwrap().is_empty());
}
