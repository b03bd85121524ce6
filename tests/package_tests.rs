#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{UPPER_UID, mount_with};
use esdfs::pkgdb::PackageDb;

#[test]
fn package_updates_rederive_cached_inodes() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("Android/data/com.example.app/cache")).unwrap();
    });

    let app = m.resolve("Android/data/com.example.app").unwrap();
    let cache = m.resolve("Android/data/com.example.app/cache").unwrap();
    assert_eq!(app.uid, UPPER_UID, "unknown packages keep the default owner");
    assert_eq!(cache.uid, UPPER_UID);

    m.push_packages("com.example.app 10050 0 0 0 1015");
    assert_eq!(m.fs.getattr(app.addr).unwrap().uid, 10050);
    assert_eq!(m.fs.getattr(cache.addr).unwrap().uid, 10050);

    m.push_packages("com.other.app 10077 0 0 0 1015");
    assert_eq!(m.fs.getattr(app.addr).unwrap().uid, UPPER_UID);
    assert_eq!(m.fs.getattr(cache.addr).unwrap().uid, UPPER_UID);
}

#[test]
fn incomplete_lists_change_nothing() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("Android/data/com.example.app")).unwrap();
    });
    let app = m.ino("Android/data/com.example.app");

    let mut writer = m.packages.writer();
    assert!(writer.ingest(b"com.example.app 10050 0 0 0 1015\n").unwrap().is_none());
    assert_eq!(m.packages.version(), 0);
    assert_eq!(m.fs.getattr(app).unwrap().uid, UPPER_UID);

    let outcome = writer.ingest(b"\n").unwrap().unwrap();
    assert_eq!((outcome.committed, outcome.version), (1, 1));
    assert_eq!(m.fs.getattr(app).unwrap().uid, 10050);
}

#[test]
fn readers_never_observe_a_partial_table() {
    let db = Arc::new(PackageDb::new());
    let done = Arc::new(AtomicBool::new(false));
    let list_a = b"pkg.one 10001 0 0 0 1015\npkg.two 10002 0 0 0 1015\n\n";
    let list_b = b"pkg.one 10101 0 0 0 1015\npkg.two 10102 0 0 0 1015\n\n";

    std::thread::scope(|s| {
        for _ in 0..4 {
            let db = Arc::clone(&db);
            let done = Arc::clone(&done);
            s.spawn(move || {
                let mut last_version = 0;
                while !done.load(Ordering::Relaxed) {
                    let snapshot = db.snapshot();
                    let pair = (snapshot.classify("pkg.one"), snapshot.classify("pkg.two"));
                    assert!(
                        matches!(
                            pair,
                            (None, None)
                                | (Some(10001), Some(10002))
                                | (Some(10101), Some(10102))
                        ),
                        "torn snapshot {pair:?} at version {}",
                        snapshot.version()
                    );
                    assert!(snapshot.version() >= last_version);
                    last_version = snapshot.version();
                }
            });
        }

        for round in 0..200 {
            let list: &[u8] = if round % 2 == 0 { list_a } else { list_b };
            db.ingest(list).unwrap().unwrap();
        }
        done.store(true, Ordering::Relaxed);
    });

    assert_eq!(db.version(), 200);
}

#[test]
fn lookups_stay_consistent_while_packages_churn() {
    let m = mount_with("derive=unified", |lower| {
        std::fs::create_dir_all(lower.join("Android/data/com.example.app/files")).unwrap();
    });
    let files = m.ino("Android/data/com.example.app/files");
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::Relaxed) {
                let uid = m.fs.getattr(files).unwrap().uid;
                assert!(uid == UPPER_UID || uid == 10050, "unexpected owner {uid}");
            }
        });
        for round in 0..100 {
            if round % 2 == 0 {
                m.push_packages("com.example.app 10050 0 0 0 1015");
            } else {
                m.push_packages("com.other.app 10077 0 0 0 1015");
            }
        }
        done.store(true, Ordering::Relaxed);
    });

    assert_eq!(m.fs.getattr(files).unwrap().uid, UPPER_UID);
}
