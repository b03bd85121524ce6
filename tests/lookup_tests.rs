#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use common::{UPPER_UID, errno, mount, mount_with, name};
use esdfs::fs::{AccessMask, Caller, INodeType, InodePerms, ROOT_INO, UNKNOWN_INO};
use esdfs::pkgdb::{AID_SDCARD_R, AID_SDCARD_ALL};

const PACKAGES: &str = "com.example.app 10050 0 0 0 1015";

fn perms(mode: u32) -> InodePerms {
    InodePerms::from_mode(mode)
}

#[test]
fn android_tree_is_presented_with_derived_owners() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("Android/data/com.example.app/files")).unwrap();
        std::fs::create_dir_all(lower.join("DCIM")).unwrap();
    });
    m.push_packages(PACKAGES);

    let root = m.fs.getattr(ROOT_INO).unwrap();
    assert_eq!((root.uid, root.gid), (UPPER_UID, AID_SDCARD_R));
    assert_eq!(root.permissions, perms(0o775));

    let android = m.resolve("Android").unwrap();
    assert_eq!((android.uid, android.gid), (UPPER_UID, AID_SDCARD_R));
    assert_eq!(android.permissions, perms(0o771));

    let data = m.resolve("Android/data").unwrap();
    assert_eq!(data.permissions, perms(0o771));

    let app = m.resolve("Android/data/com.example.app").unwrap();
    assert_eq!((app.uid, app.gid), (10050, AID_SDCARD_R));
    assert_eq!(app.permissions, perms(0o770));

    let files = m.resolve("Android/data/com.example.app/files").unwrap();
    assert_eq!(files.uid, 10050, "app ownership is inherited below the package directory");

    let dcim = m.resolve("DCIM").unwrap();
    assert_eq!((dcim.uid, dcim.gid), (UPPER_UID, AID_SDCARD_R));
    assert_eq!(dcim.permissions, perms(0o775));
}

#[test]
fn regular_files_never_carry_execute_bits() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("Android/data/com.example.app")).unwrap();
        std::fs::write(lower.join("Android/data/com.example.app/run.sh"), b"#!/bin/sh").unwrap();
        std::fs::write(lower.join("song.mp3"), b"...").unwrap();
    });
    m.push_packages(PACKAGES);

    let script = m.resolve("Android/data/com.example.app/run.sh").unwrap();
    assert_eq!(script.itype, INodeType::File);
    assert_eq!(script.permissions, perms(0o660));

    let song = m.resolve("song.mp3").unwrap();
    assert_eq!(song.permissions, perms(0o664));
}

#[test]
fn secondary_user_roots_resolve_per_user_owners() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("Android/user/10/Android/data/com.example.app"))
            .unwrap();
    });
    m.push_packages(PACKAGES);

    let user = m.resolve("Android/user").unwrap();
    assert_eq!((user.gid, user.permissions), (AID_SDCARD_ALL, perms(0o770)));

    let app = m.resolve("Android/user/10/Android/data/com.example.app").unwrap();
    assert_eq!(app.uid, 1_010_050);
}

#[test]
fn names_resolve_case_insensitively() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("DCIM/Camera")).unwrap();
    });

    let exact = m.ino("DCIM/Camera");
    assert_eq!(m.ino("dcim/CAMERA"), exact);
    assert_eq!(m.ino("Dcim/camera"), exact);

    // The listing keeps the lower spelling.
    assert_eq!(m.names(m.ino("DCIM")), vec!["Camera"]);
}

#[test]
fn missing_names_are_enoent() {
    let m = mount("derive=unified");
    assert_eq!(errno(m.fs.lookup(ROOT_INO, name("nope"))), libc::ENOENT);
}

#[test]
fn lookups_through_a_file_fail_with_enotdir() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::write(lower.join("notes.txt"), b"x").unwrap();
    });
    let file = m.ino("notes.txt");
    assert_eq!(errno(m.fs.lookup(file, name("child"))), libc::ENOTDIR);
}

#[test]
fn secure_names_are_refused_only_at_storage_roots() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join(".android_secure")).unwrap();
        std::fs::write(lower.join("autorun.inf"), b"[autorun]").unwrap();
        std::fs::create_dir_all(lower.join("DCIM/.android_secure")).unwrap();
    });

    assert_eq!(errno(m.fs.lookup(ROOT_INO, name(".android_secure"))), libc::EACCES);
    assert_eq!(errno(m.fs.lookup(ROOT_INO, name("AUTORUN.INF"))), libc::EACCES);
    assert_eq!(errno(m.fs.lookup(ROOT_INO, name("android_secure"))), libc::EACCES);

    let nested = m.resolve("DCIM/.android_secure").unwrap();
    assert_eq!(nested.itype, INodeType::Directory);
}

#[test]
fn underived_mounts_present_the_configured_owner() {
    let me = esdfs::cred::Identity::current();
    let m = mount_with("", |lower| {
        std::fs::create_dir_all(lower.join("Android/data")).unwrap();
        std::fs::write(lower.join("Android/data/file"), b"x").unwrap();
    });

    let data = m.resolve("Android/data").unwrap();
    assert_eq!((data.uid, data.gid), (UPPER_UID, me.gid));
    assert_eq!(data.permissions, perms(0o775));
    let file = m.resolve("Android/data/file").unwrap();
    assert_eq!(file.permissions, perms(0o664));
}

#[test]
fn legacy_root_children_are_user_roots() {
    let m = mount_with("derive=legacy", |lower| {
        std::fs::create_dir_all(lower.join("obb")).unwrap();
        std::fs::create_dir_all(lower.join("0/DCIM")).unwrap();
        std::fs::create_dir_all(lower.join("0/Android/data")).unwrap();
    });

    let obb = m.resolve("obb").unwrap();
    assert_eq!(obb.permissions, perms(0o771));
    let user_root = m.resolve("0").unwrap();
    assert_eq!(user_root.permissions, perms(0o775));
    let data = m.resolve("0/Android/data").unwrap();
    assert_eq!(data.permissions, perms(0o771));
}

#[test]
fn getattr_copies_lower_changes_up() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::write(lower.join("grow.bin"), b"ab").unwrap();
    });
    let ino = m.ino("grow.bin");
    assert_eq!(m.fs.getattr(ino).unwrap().size, 2);

    std::fs::write(m.lower_path("grow.bin"), b"abcdef").unwrap();
    assert_eq!(m.fs.getattr(ino).unwrap().size, 6);
}

#[test]
fn presented_modes_gate_unprivileged_callers() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("DCIM")).unwrap();
    });
    let dcim = m.ino("DCIM");
    let stranger = Caller {
        uid: 4242,
        gid: 4242,
        groups: vec![],
    };

    m.fs
        .access(stranger.clone(), dcim, AccessMask::READ | AccessMask::EXEC)
        .unwrap();
    assert_eq!(
        errno(m.fs.access(stranger.clone(), dcim, AccessMask::WRITE)),
        libc::EACCES
    );
    assert_eq!(
        errno(m.fs.mkdir(stranger, dcim, name("sneaky"), 0o777)),
        libc::EACCES
    );

    let sdcard_reader = Caller {
        uid: 4242,
        gid: AID_SDCARD_R,
        groups: vec![],
    };
    m.fs
        .access(sdcard_reader, dcim, AccessMask::WRITE)
        .unwrap();
}

#[test]
fn supplementary_groups_open_the_group_class() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("DCIM")).unwrap();
    });
    let dcim = m.ino("DCIM");
    let member = Caller {
        uid: 4242,
        gid: 4242,
        groups: vec![3003, AID_SDCARD_R],
    };

    m.fs
        .access(member.clone(), dcim, AccessMask::WRITE)
        .unwrap();
    let camera = m.fs.mkdir(member, dcim, name("Camera"), 0o755).unwrap();
    assert_eq!(camera.itype, INodeType::Directory);
}

#[test]
fn listings_are_sorted_and_hint_known_inodes() {
    let m = mount_with("derive=unified", |lower| {
        for dir in ["Music", "DCIM", "Android"] {
            std::fs::create_dir_all(lower.join(dir)).unwrap();
        }
    });
    let dcim = m.ino("DCIM");

    let listing = m.list(ROOT_INO);
    let names: Vec<_> = listing
        .iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["Android", "DCIM", "Music"]);
    assert_eq!(listing[1].ino, dcim);
    assert_eq!(listing[0].ino, UNKNOWN_INO);
    assert!(listing.iter().all(|e| e.itype == INodeType::Directory));
}

#[test]
fn readdir_resumes_from_an_offset() {
    let m = mount_with("derive=unified", |lower| {
        for dir in ["a", "b", "c", "d"] {
            std::fs::create_dir_all(lower.join(dir)).unwrap();
        }
    });
    let fh = m.fs.opendir(Caller::ROOT, ROOT_INO).unwrap();

    let mut first = Vec::new();
    m.fs
        .readdir(fh, 0, |entry, next| {
            first.push((entry.name.clone(), next));
            first.len() == 2
        })
        .unwrap();
    assert_eq!(first.len(), 2);
    let resume = first[1].1;

    let mut rest = Vec::new();
    m.fs
        .readdir(fh, resume, |entry, _| {
            rest.push(entry.name.to_string_lossy().into_owned());
            false
        })
        .unwrap();
    assert_eq!(rest, vec!["c", "d"]);
    m.fs.releasedir(fh).unwrap();
    assert_eq!(errno(m.fs.readdir(fh, 0, |_, _| false)), libc::EBADF);
}

#[test]
fn statfs_reports_the_esdfs_magic() {
    let m = mount("derive=unified");
    let stats = m.fs.statfs().unwrap();
    assert_eq!(stats.magic, esdfs::fs::ESDFS_SUPER_MAGIC);
    assert!(stats.block_size > 0);
}

#[test]
fn special_files_are_presented_with_their_own_type() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("Download")).unwrap();
        nix::unistd::mkfifo(
            &lower.join("Download/pipe"),
            nix::sys::stat::Mode::from_bits_truncate(0o644),
        )
        .unwrap();
    });

    let pipe = m.resolve("Download/pipe").unwrap();
    assert_eq!(pipe.itype, INodeType::NamedPipe);
    assert_eq!(pipe.permissions, perms(0o664));
    let listing = m.list(m.ino("Download"));
    assert_eq!(listing[0].itype, INodeType::NamedPipe);
}
