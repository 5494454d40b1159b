//! Ledger storage.
//!
//! One CSV file per server, named `<server_id>.csv` inside the store
//! directory. The first line is always the header `message,mentions,extra`
//! and appears exactly once. Files are created lazily by whichever operation
//! touches a server first.
//!
//! Every operation on a server holds that server's lock for its whole
//! duration, so a rebuild never interleaves with an append.

use crate::error::Result;
use csv::{StringRecord, Terminator, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Column names of every ledger, in file order.
pub const HEADER: [&str; 3] = ["message", "mentions", "extra"];

/// One ledger row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entry {
    /// Message text with mention tokens removed.
    pub message: String,
    /// Comma-joined `@name` list, possibly empty.
    pub mentions: String,
    /// Free-text annotation, possibly empty.
    pub extra: String,
}

impl Entry {
    /// Builds a row from its three columns.
    pub fn new(
        message: impl Into<String>,
        mentions: impl Into<String>,
        extra: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            mentions: mentions.into(),
            extra: extra.into(),
        }
    }

    fn as_record(&self) -> [&str; 3] {
        [&self.message, &self.mentions, &self.extra]
    }
}

/// Directory of per-server ledgers.
#[derive(Debug)]
pub struct LedgerStore {
    dir: PathBuf,
    locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl LedgerStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "ledger store opened");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Location of a server's ledger file.
    pub fn path(&self, server_id: u64) -> PathBuf {
        self.dir.join(format!("{server_id}.csv"))
    }

    /// Creates the ledger with only its header if it does not exist yet.
    ///
    /// Returns `true` when a new file was written.
    pub fn ensure(&self, server_id: u64) -> Result<bool> {
        let lock = self.lock_for(server_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_locked(server_id)
    }

    /// Replaces the whole ledger with the header followed by `entries`.
    ///
    /// The new content is written to a temporary file next to the ledger and
    /// renamed over it, keeping the ledger's permissions. Existing rows,
    /// including their `extra` annotations, are discarded.
    pub fn rebuild(&self, server_id: u64, entries: &[Entry]) -> Result<()> {
        let lock = self.lock_for(server_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Temp files are private; the ledger keeps the mode it was created with
        self.ensure_locked(server_id)?;
        let permissions = fs::metadata(self.path(server_id))?.permissions();

        let tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = writer_builder().from_writer(tmp.as_file());
            writer.write_record(HEADER)?;
            for entry in entries {
                writer.write_record(entry.as_record())?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.as_file().set_permissions(permissions)?;
        tmp.persist(self.path(server_id))?;

        info!(server_id, rows = entries.len(), "ledger rebuilt");
        Ok(())
    }

    /// Adds one row at the end of the ledger.
    pub fn append(&self, server_id: u64, entry: &Entry) -> Result<()> {
        self.append_many(server_id, std::slice::from_ref(entry))
            .map(|_| ())
    }

    /// Adds a batch of rows at the end of the ledger, in order.
    pub fn append_many(&self, server_id: u64, entries: &[Entry]) -> Result<usize> {
        self.append_records(server_id, entries.iter().map(Entry::as_record))
    }

    /// Adds raw rows verbatim, whatever their column count.
    ///
    /// Returns the number of rows written.
    pub fn append_records<I, R, F>(&self, server_id: u64, rows: I) -> Result<usize>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        let lock = self.lock_for(server_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_locked(server_id)?;

        let file = OpenOptions::new().append(true).open(self.path(server_id))?;
        let mut writer = writer_builder().flexible(true).from_writer(file);
        let mut written = 0;
        for row in rows {
            writer.write_record(row)?;
            written += 1;
        }
        writer.flush()?;

        debug!(server_id, rows = written, "rows appended to ledger");
        Ok(written)
    }

    /// Raw file content, created with its header first if missing.
    pub fn contents(&self, server_id: u64) -> Result<Vec<u8>> {
        let lock = self.lock_for(server_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_locked(server_id)?;
        Ok(fs::read(self.path(server_id))?)
    }

    /// Reads the data rows back in file order, header excluded.
    pub fn entries(&self, server_id: u64) -> Result<Vec<Entry>> {
        let lock = self.lock_for(server_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_locked(server_id)?;

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(self.path(server_id))?;
        reader
            .deserialize()
            .collect::<std::result::Result<Vec<Entry>, _>>()
            .map_err(Into::into)
    }

    /// Reads the raw rows back, header included.
    pub fn records(&self, server_id: u64) -> Result<Vec<StringRecord>> {
        let lock = self.lock_for(server_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_locked(server_id)?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(self.path(server_id))?;
        reader
            .records()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn ensure_locked(&self, server_id: u64) -> Result<bool> {
        let path = self.path(server_id);
        if !is_missing(&path)? {
            return Ok(false);
        }

        let mut writer = writer_builder().from_path(&path)?;
        writer.write_record(HEADER)?;
        writer.flush()?;

        info!(server_id, path = %path.display(), "ledger created");
        Ok(true)
    }

    fn lock_for(&self, server_id: u64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(server_id).or_default())
    }
}

/// A zero-length file has lost its header and counts as missing.
fn is_missing(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len() == 0),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

fn writer_builder() -> WriterBuilder {
    let mut builder = WriterBuilder::new();
    builder.terminator(Terminator::CRLF);
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(n: usize) -> Entry {
        Entry::new(format!("message {n}"), format!("@user{n}"), "")
    }

    #[test]
    fn ensure_writes_only_the_header() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        assert!(store.ensure(42).unwrap());

        let content = fs::read_to_string(dir.path().join("42.csv")).unwrap();
        assert_eq!(content, "message,mentions,extra\r\n");
    }

    #[test]
    fn ensure_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        assert!(store.ensure(7).unwrap());
        assert!(!store.ensure(7).unwrap());

        let records = store.records(7).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0], &StringRecord::from(HEADER.to_vec()));
        assert!(store.entries(7).unwrap().is_empty());
    }

    #[test]
    fn ensure_restores_header_of_empty_file() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        fs::write(store.path(3), "").unwrap();

        assert!(store.ensure(3).unwrap());
        assert_eq!(
            fs::read_to_string(store.path(3)).unwrap(),
            "message,mentions,extra\r\n"
        );
    }

    #[test]
    fn contents_of_untouched_server_is_the_header() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        assert_eq!(store.contents(10).unwrap(), b"message,mentions,extra\r\n");
        store.append(10, &Entry::new("hi", "@a", "")).unwrap();
        assert_eq!(
            store.contents(10).unwrap(),
            b"message,mentions,extra\r\nhi,@a,\r\n"
        );
    }

    #[test]
    fn open_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("data").join("ledgers");
        let store = LedgerStore::open(&nested).unwrap();

        store.ensure(1).unwrap();
        assert!(nested.join("1.csv").exists());
    }

    #[test]
    fn rebuild_round_trips_entries_in_order() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        let entries = vec![
            entry(1),
            Entry::new("quoted \"text\", with comma", "@a,@b", "multi\nline"),
            entry(3),
        ];

        store.rebuild(9, &entries).unwrap();

        assert_eq!(store.entries(9).unwrap(), entries);
    }

    #[test]
    fn rebuild_with_no_entries_discards_prior_rows() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        store.rebuild(5, &[entry(1), entry(2)]).unwrap();
        store.append(5, &Entry::new("kept?", "", "annotation")).unwrap();

        store.rebuild(5, &[]).unwrap();

        assert!(store.entries(5).unwrap().is_empty());
        assert_eq!(
            fs::read_to_string(store.path(5)).unwrap(),
            "message,mentions,extra\r\n"
        );
    }

    #[test]
    fn rebuild_leaves_no_temporary_files() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        store.rebuild(11, &[entry(1)]).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("11.csv")]);
    }

    #[cfg(unix)]
    #[test]
    fn rebuild_keeps_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        let mode = |id| fs::metadata(store.path(id)).unwrap().permissions().mode() & 0o777;

        store.ensure(1).unwrap();
        fs::set_permissions(store.path(1), fs::Permissions::from_mode(0o644)).unwrap();
        store.rebuild(1, &[entry(1)]).unwrap();
        assert_eq!(mode(1), 0o644);

        store.rebuild(2, &[entry(2)]).unwrap();
        store.ensure(3).unwrap();
        assert_eq!(mode(2), mode(3));
    }

    #[test]
    fn appends_keep_call_order() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        for n in 0..5 {
            store.append(8, &entry(n)).unwrap();
        }

        let expected: Vec<_> = (0..5).map(entry).collect();
        assert_eq!(store.entries(8).unwrap(), expected);
        assert_eq!(store.records(8).unwrap().len(), 6);
    }

    #[test]
    fn append_preserves_existing_rows() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        store.rebuild(2, &[entry(1), entry(2)]).unwrap();

        let written = store.append_many(2, &[entry(3), entry(4)]).unwrap();

        assert_eq!(written, 2);
        let expected: Vec<_> = (1..=4).map(entry).collect();
        assert_eq!(store.entries(2).unwrap(), expected);
    }

    #[test]
    fn append_records_writes_rows_verbatim() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        let rows = vec![
            StringRecord::from(vec!["only one column"]),
            StringRecord::from(vec!["a", "b", "c", "d"]),
        ];
        assert_eq!(store.append_records(4, &rows).unwrap(), 2);

        let records = store.records(4).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(&records[1], &rows[0]);
        assert_eq!(&records[2], &rows[1]);
    }

    #[test]
    fn servers_are_kept_apart() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        store.append(1, &entry(1)).unwrap();
        store.append(2, &entry(2)).unwrap();

        assert_eq!(store.entries(1).unwrap(), vec![entry(1)]);
        assert_eq!(store.entries(2).unwrap(), vec![entry(2)]);
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store.append(6, &entry(n * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.entries(6).unwrap().len(), 200);
        assert_eq!(store.records(6).unwrap().len(), 201);
    }
}
