#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use common::{errno, mount_with, name};
use esdfs::fs::ROOT_INO;

#[test]
fn lookups_are_counted_until_forgotten() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("DCIM")).unwrap();
    });
    let baseline = m.fs.cached_inodes();

    let first = m.fs.lookup(ROOT_INO, name("DCIM")).unwrap();
    let second = m.fs.lookup(ROOT_INO, name("dcim")).unwrap();
    assert_eq!(first.addr, second.addr);
    assert_eq!(m.fs.lookup_count(first.addr), 2);
    assert_eq!(m.fs.cached_inodes(), baseline + 1);

    m.fs.forget(first.addr, 1);
    assert_eq!(m.fs.lookup_count(first.addr), 1);
    m.fs.getattr(first.addr).unwrap();

    m.fs.forget(first.addr, 1);
    assert_eq!(m.fs.lookup_count(first.addr), 0);
    assert_eq!(m.fs.cached_inodes(), baseline);
    assert_eq!(errno(m.fs.getattr(first.addr)), libc::ENOENT);
}

#[test]
fn evicted_objects_are_interposed_afresh() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::write(lower.join("a.txt"), b"a").unwrap();
    });
    let before = m.fs.lookup(ROOT_INO, name("a.txt")).unwrap();
    m.fs.forget(before.addr, 1);

    let after = m.fs.lookup(ROOT_INO, name("a.txt")).unwrap();
    assert_ne!(before.addr, after.addr);
    assert_eq!(after.size, 1);
}

#[test]
fn forgetting_more_than_was_looked_up_evicts_once() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::write(lower.join("a.txt"), b"a").unwrap();
    });
    let file = m.fs.lookup(ROOT_INO, name("a.txt")).unwrap();
    m.fs.forget(file.addr, 10);
    m.fs.forget(file.addr, 1);
    assert_eq!(m.fs.lookup_count(file.addr), 0);
}

#[test]
fn the_root_is_never_evicted() {
    let m = mount_with("derive=unified", |_| {});
    m.fs.forget(ROOT_INO, 1);
    m.fs.getattr(ROOT_INO).unwrap();
    assert_eq!(m.fs.cached_inodes(), 1);
}

#[test]
fn hard_links_share_one_inode_until_the_last_name_goes() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::write(lower.join("one"), b"x").unwrap();
        std::fs::hard_link(lower.join("one"), lower.join("two")).unwrap();
    });
    let one = m.fs.lookup(ROOT_INO, name("one")).unwrap();
    let two = m.fs.lookup(ROOT_INO, name("two")).unwrap();
    assert_eq!(one.addr, two.addr);
    assert_eq!(one.nlink, 2);

    m.fs
        .unlink(esdfs::fs::Caller::ROOT, ROOT_INO, name("one"))
        .unwrap();
    assert_eq!(m.fs.lookup(ROOT_INO, name("two")).unwrap().addr, two.addr);
}
