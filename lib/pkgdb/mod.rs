//! In-memory index of installed packages and their storage grants.
//!
//! The table is rebuilt wholesale from a pushed package list. Readers always observe one complete
//! table: a commit builds the replacement off to the side and swaps the live pointer under the
//! database mutex, so a concurrent `classify` or `access_flags` sees either the whole old table or
//! the whole new one.
//!
//! A list arrives through a [`ListWriter`], which owns the bytes of its own unfinished list. Bytes
//! left over when a writer goes away are discarded and never reach another writer's list.

pub mod list;

use std::hash::BuildHasher as _;

use bitflags::bitflags;
use rustc_hash::{FxBuildHasher, FxHashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Arc, Mutex, MutexGuard};

/// Group granting broad read/write access to shared storage.
pub const AID_SDCARD_RW: u32 = 1015;
/// Group granting direct access to the media storage backing.
pub const AID_MEDIA_RW: u32 = 1023;
/// Group presented on world-readable storage directories.
pub const AID_SDCARD_R: u32 = 1028;
/// Group presented on per-user storage roots.
pub const AID_SDCARD_ALL: u32 = 1035;
/// Width of one Android user's uid block.
pub const AID_USER_OFFSET: u32 = 100_000;

/// Largest pending, unterminated package list accepted by [`ListWriter::ingest`].
pub const PENDING_LIST_MAX: usize = 4 << 20;

bitflags! {
    /// Storage grants held by a package.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u8 {
        /// Member of the broad storage read/write group.
        const SDCARD_RW = 1 << 0;
        /// Member of the media read/write group.
        const MEDIA_RW  = 1 << 1;
    }
}

/// One installed package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    /// Package name, matched case-sensitively.
    pub name: Box<str>,
    /// App id within one user's uid block.
    pub appid: u32,
    /// Storage grants.
    pub access: AccessFlags,
}

/// Errors from [`ListWriter::ingest`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageListError {
    /// The pending list grew past [`PENDING_LIST_MAX`] without a terminator; it was discarded.
    #[error("pending package list of {0} bytes exceeds the limit; discarded")]
    Oversized(usize),
}

impl From<PackageListError> for i32 {
    fn from(e: PackageListError) -> Self {
        match e {
            PackageListError::Oversized(_) => libc::EFBIG,
        }
    }
}

/// Result of an ingest that completed a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Entries now live.
    pub committed: usize,
    /// Lines rejected while parsing.
    pub skipped: usize,
    /// Version of the newly live table.
    pub version: u64,
}

/// An immutable package table. Both indexes hold positions into `entries`.
#[derive(Debug, Default)]
struct PackageTable {
    entries: Box<[PackageEntry]>,
    by_name: FxHashMap<u64, Vec<usize>>,
    by_appid: FxHashMap<u32, usize>,
}

impl PackageTable {
    fn build(entries: Vec<PackageEntry>) -> Self {
        let entries = entries.into_boxed_slice();
        let mut by_name: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
        let mut by_appid = FxHashMap::default();
        for (idx, entry) in entries.iter().enumerate() {
            by_name
                .entry(name_hash(&entry.name))
                .or_default()
                .push(idx);
            by_appid.entry(entry.appid).or_insert(idx);
        }
        Self {
            entries,
            by_name,
            by_appid,
        }
    }

    fn classify(&self, name: &str) -> Option<u32> {
        self.by_name
            .get(&name_hash(name))?
            .iter()
            .map(|&idx| &self.entries[idx])
            .find(|entry| &*entry.name == name)
            .map(|entry| entry.appid)
    }

    fn access_flags(&self, uid: u32) -> AccessFlags {
        self.by_appid
            .get(&(uid % AID_USER_OFFSET))
            .map_or(AccessFlags::empty(), |&idx| self.entries[idx].access)
    }
}

fn name_hash(name: &str) -> u64 {
    FxBuildHasher.hash_one(name)
}

/// A consistent read-only view of one package table version.
#[derive(Debug, Clone)]
pub struct PackageSnapshot {
    table: Arc<PackageTable>,
    version: u64,
}

impl PackageSnapshot {
    /// Resolve a package name to its app id.
    #[must_use]
    pub fn classify(&self, name: &str) -> Option<u32> {
        self.table.classify(name)
    }

    /// Storage grants of the package owning `uid`, of any user.
    #[must_use]
    pub fn access_flags(&self, uid: u32) -> AccessFlags {
        self.table.access_flags(uid)
    }

    /// The version this snapshot was taken at.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.entries.is_empty()
    }
}

/// The live package database.
#[derive(Debug)]
pub struct PackageDb {
    live: Mutex<PackageSnapshot>,
    /// Mirror of the live version for cheap staleness checks.
    version: AtomicU64,
}

impl Default for PackageDb {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageDb {
    /// An empty database at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: Mutex::new(PackageSnapshot {
                table: Arc::new(PackageTable::default()),
                version: 0,
            }),
            version: AtomicU64::new(0),
        }
    }

    fn live(&self) -> MutexGuard<'_, PackageSnapshot> {
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start a new list.
    #[must_use]
    pub fn writer(&self) -> ListWriter<'_> {
        ListWriter {
            db: self,
            pending: Vec::new(),
        }
    }

    /// Feed one complete write. An unterminated write is discarded and yields `Ok(None)`.
    pub fn ingest(&self, list: &[u8]) -> Result<Option<IngestOutcome>, PackageListError> {
        self.writer().ingest(list)
    }

    /// Replace the live table with `entries`. Returns the new version.
    pub fn commit(&self, entries: Vec<PackageEntry>) -> u64 {
        let count = entries.len();
        let table = Arc::new(PackageTable::build(entries));
        let version = {
            let mut live = self.live();
            let version = live.version + 1;
            let old = std::mem::replace(&mut *live, PackageSnapshot { table, version });
            self.version.store(version, Ordering::Release);
            drop(old);
            version
        };
        info!(count, version, "package list committed");
        version
    }

    /// Resolve a package name to its app id.
    #[must_use]
    pub fn classify(&self, name: &str) -> Option<u32> {
        self.live().classify(name)
    }

    /// Storage grants of the package owning `uid`, of any user.
    #[must_use]
    pub fn access_flags(&self, uid: u32) -> AccessFlags {
        self.live().access_flags(uid)
    }

    /// A consistent view of the live table.
    #[must_use]
    pub fn snapshot(&self) -> PackageSnapshot {
        self.live().clone()
    }

    /// Current table version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// One producer's package list in flight.
///
/// Chunks accumulate until two consecutive newlines terminate the list, at which point the
/// whole buffer is parsed and committed. Dropping the writer discards an unfinished list.
#[derive(Debug)]
pub struct ListWriter<'a> {
    db: &'a PackageDb,
    pending: Vec<u8>,
}

impl ListWriter<'_> {
    /// Feed a chunk of the list. Returns `Ok(None)` while the list is still incomplete.
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<Option<IngestOutcome>, PackageListError> {
        self.pending.extend_from_slice(chunk);
        let Some(end) = self.pending.windows(2).position(|w| w == b"\n\n") else {
            if self.pending.len() > PENDING_LIST_MAX {
                let len = self.pending.len();
                self.pending = Vec::new();
                warn!(len, "discarding oversized package list");
                return Err(PackageListError::Oversized(len));
            }
            debug!(pending = self.pending.len(), "package list incomplete");
            return Ok(None);
        };

        // Whatever follows the terminator in the same write is dropped.
        let list = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&list[..=end]);
        let (entries, skipped) = list::parse_list(&text);
        let committed = entries.len();
        let version = self.db.commit(entries);
        Ok(Some(IngestOutcome {
            committed,
            skipped,
            version,
        }))
    }

    /// Bytes of an unfinished list held by this writer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for ListWriter<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(len = self.pending.len(), "discarding unterminated package list");
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn single_line_list_commits_one_entry() {
        let db = PackageDb::new();
        let outcome = db
            .ingest(b"app.one 10050 0 0 0 1015,1023\n\n")
            .unwrap()
            .unwrap();
        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.version, 1);
        assert_eq!(db.classify("app.one"), Some(10050));
        assert_eq!(
            db.access_flags(10050),
            AccessFlags::SDCARD_RW | AccessFlags::MEDIA_RW
        );
    }

    #[test]
    fn classify_is_case_sensitive() {
        let db = PackageDb::new();
        db.ingest(b"App.One 10050 0 0 0 none\n\n").unwrap();
        assert_eq!(db.classify("app.one"), None);
        assert_eq!(db.classify("App.One"), Some(10050));
    }

    #[test]
    fn access_flags_ignore_the_user_block() {
        let db = PackageDb::new();
        db.ingest(b"app 10050 0 0 0 1023\n\n").unwrap();
        assert_eq!(db.access_flags(10 * AID_USER_OFFSET + 10050), AccessFlags::MEDIA_RW);
        assert_eq!(db.access_flags(10051), AccessFlags::empty());
    }

    #[test]
    fn chunks_accumulate_until_terminated() {
        let db = PackageDb::new();
        let mut writer = db.writer();
        assert_eq!(writer.ingest(b"app.one 10050 0 0").unwrap(), None);
        assert_eq!(writer.ingest(b" 0 1015\n").unwrap(), None);
        assert_eq!(db.version(), 0);
        let outcome = writer.ingest(b"\n").unwrap().unwrap();
        assert_eq!(outcome.committed, 1);
        assert_eq!(writer.pending(), 0);
        assert_eq!(db.classify("app.one"), Some(10050));
    }

    #[test]
    fn an_abandoned_list_never_reaches_the_next_writer() {
        let db = PackageDb::new();
        {
            let mut intruder = db.writer();
            assert_eq!(intruder.ingest(b"com.leak 10077 0 0 0 1015,1023\n").unwrap(), None);
        }
        assert_eq!(db.ingest(b"com.leak 10077 0 0 0 1015,1023\n").unwrap(), None);

        let outcome = db.ingest(b"com.good 10050 0 0 0 1015\n\n").unwrap().unwrap();
        assert_eq!(outcome.committed, 1);
        assert_eq!(db.classify("com.leak"), None);
        assert_eq!(db.access_flags(10077), AccessFlags::empty());
        assert_eq!(db.classify("com.good"), Some(10050));
    }

    #[test]
    fn concurrent_writers_keep_separate_lists() {
        let db = PackageDb::new();
        let mut first = db.writer();
        let mut second = db.writer();
        assert_eq!(first.ingest(b"a.one 10001 0 0 0 none\n").unwrap(), None);
        assert_eq!(second.ingest(b"b.one 10002 0 0 0 none\n").unwrap(), None);
        second.ingest(b"\n").unwrap().unwrap();
        assert_eq!(db.classify("a.one"), None);
        first.ingest(b"\n").unwrap().unwrap();
        assert_eq!(db.classify("a.one"), Some(10001));
        assert_eq!(db.classify("b.one"), None);
    }

    #[test]
    fn bytes_after_the_terminator_are_dropped() {
        let db = PackageDb::new();
        let outcome = db
            .ingest(b"a 10001 0 0 0 none\n\nb 10002 0 0 0 none\n")
            .unwrap()
            .unwrap();
        assert_eq!(outcome.committed, 1);
        assert_eq!(db.classify("b"), None);
        // Nothing of the tail is left pending.
        assert_eq!(db.ingest(b"c 10003 0 0 0 none\n\n").unwrap().unwrap().committed, 1);
        assert_eq!(db.classify("b"), None);
    }

    #[test]
    fn out_of_range_line_is_dropped_others_commit() {
        let db = PackageDb::new();
        let outcome = db
            .ingest(b"low.app 500 0 0 0 1015\nok.app 10070 0 0 0 1015\n\n")
            .unwrap()
            .unwrap();
        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(db.classify("low.app"), None);
    }

    #[test]
    fn commit_replaces_the_whole_table() {
        let db = PackageDb::new();
        db.ingest(b"a 10001 0 0 0 none\nb 10002 0 0 0 none\n\n").unwrap();
        db.ingest(b"c 10003 0 0 0 none\n\n").unwrap();
        assert_eq!(db.classify("a"), None);
        assert_eq!(db.classify("c"), Some(10003));
        assert_eq!(db.snapshot().len(), 1);
        assert_eq!(db.version(), 2);
    }

    #[test]
    fn empty_list_clears_the_table() {
        let db = PackageDb::new();
        db.ingest(b"a 10001 0 0 0 none\n\n").unwrap();
        let outcome = db.ingest(b"\n\n").unwrap().unwrap();
        assert_eq!(outcome.committed, 0);
        assert!(db.snapshot().is_empty());
    }

    #[test]
    fn oversized_pending_list_is_discarded() {
        let db = PackageDb::new();
        let chunk = vec![b'x'; PENDING_LIST_MAX + 1];
        assert_eq!(
            db.ingest(&chunk),
            Err(PackageListError::Oversized(PENDING_LIST_MAX + 1))
        );
        // The buffer starts over.
        let mut writer = db.writer();
        assert!(writer.ingest(&chunk).is_err());
        assert_eq!(writer.pending(), 0);
        writer.ingest(b"a 10001 0 0 0 none\n\n").unwrap();
        assert_eq!(db.classify("a"), Some(10001));
    }

    #[test]
    fn snapshot_is_unaffected_by_later_commits() {
        let db = PackageDb::new();
        db.ingest(b"a 10001 0 0 0 none\n\n").unwrap();
        let snap = db.snapshot();
        db.ingest(b"a 10009 0 0 0 none\n\n").unwrap();
        assert_eq!(snap.classify("a"), Some(10001));
        assert_eq!(snap.version(), 1);
        assert_eq!(db.classify("a"), Some(10009));
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;

    #[test]
    fn reader_sees_whole_table() {
        loom::model(|| {
            let db = Arc::new(PackageDb::new());
            db.commit(vec![PackageEntry {
                name: "a".into(),
                appid: 10001,
                access: AccessFlags::SDCARD_RW,
            }]);

            let writer = {
                let db = Arc::clone(&db);
                loom::thread::spawn(move || {
                    db.commit(vec![PackageEntry {
                        name: "a".into(),
                        appid: 10002,
                        access: AccessFlags::MEDIA_RW,
                    }]);
                })
            };

            let snap = db.snapshot();
            match snap.classify("a") {
                Some(10001) => assert_eq!(snap.access_flags(10001), AccessFlags::SDCARD_RW),
                Some(10002) => assert_eq!(snap.access_flags(10002), AccessFlags::MEDIA_RW),
                other => panic!("torn read: {other:?}"),
            }
            writer.join().unwrap();
        });
    }
}
