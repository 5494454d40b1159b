//! CSV upload merging.
//!
//! An uploaded file is parsed completely before anything touches the
//! ledger, so a malformed upload never leaves a partial append behind. The
//! first row is always treated as a header and dropped; the remaining rows
//! are appended as they are. Blank lines are not rows and are skipped.

use crate::{
    error::{LedgerError, Result},
    ledger::LedgerStore,
};
use csv::{ReaderBuilder, StringRecord};
use std::path::Path;
use tracing::info;

/// Checks that an uploaded file name carries the `.csv` extension.
pub fn validate_upload_name(filename: &str) -> Result<()> {
    let is_csv = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

    if is_csv {
        Ok(())
    } else {
        Err(LedgerError::InvalidUpload {
            filename: filename.to_string(),
        })
    }
}

/// Parses every row of an upload, header included.
fn parse_upload(data: &[u8]) -> Result<Vec<StringRecord>> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data)
        .records()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// Merges an uploaded CSV file into a server's ledger.
///
/// Returns the number of rows appended.
pub fn import_upload(
    store: &LedgerStore,
    server_id: u64,
    filename: &str,
    data: &[u8],
) -> Result<usize> {
    validate_upload_name(filename)?;

    let rows = parse_upload(data)?;
    let imported = store.append_records(server_id, rows.iter().skip(1))?;

    info!(server_id, filename, rows = imported, "upload merged into ledger");
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Entry;
    use tempfile::tempdir;

    #[test]
    fn accepts_csv_extension_in_any_case() {
        assert!(validate_upload_name("export.csv").is_ok());
        assert!(validate_upload_name("EXPORT.CSV").is_ok());
        assert!(validate_upload_name("archive.2024.Csv").is_ok());
    }

    #[test]
    fn rejects_other_extensions() {
        for name in ["notes.txt", "csv", "data.csv.zip", "noextension"] {
            let err = validate_upload_name(name).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidUpload { ref filename } if filename == name));
        }
    }

    #[test]
    fn appends_rows_after_the_header() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        let existing = vec![Entry::new("one", "", ""), Entry::new("two", "@bob", "note")];
        store.rebuild(42, &existing).unwrap();

        let upload = b"message,mentions,extra\r\nhi,,\r\n";
        let imported = import_upload(&store, 42, "upload.csv", upload).unwrap();

        assert_eq!(imported, 1);
        let entries = store.entries(42).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(&entries[..2], &existing[..]);
        assert_eq!(entries[2], Entry::new("hi", "", ""));
    }

    #[test]
    fn drops_first_row_even_without_header() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        let upload = b"first,,\nsecond,@a,x\n";
        let imported = import_upload(&store, 1, "rows.csv", upload).unwrap();

        assert_eq!(imported, 1);
        assert_eq!(store.entries(1).unwrap(), vec![Entry::new("second", "@a", "x")]);
    }

    #[test]
    fn keeps_rows_with_other_column_counts() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        let upload = b"h\nsolo\na,b,c,d\n";
        assert_eq!(import_upload(&store, 5, "odd.csv", upload).unwrap(), 2);

        let records = store.records(5).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(&records[1], &StringRecord::from(vec!["solo"]));
        assert_eq!(&records[2], &StringRecord::from(vec!["a", "b", "c", "d"]));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        let imported = import_upload(&store, 6, "gaps.csv", b"h\n\nx,,\n\r\n").unwrap();

        assert_eq!(imported, 1);
        assert_eq!(
            std::fs::read_to_string(store.path(6)).unwrap(),
            "message,mentions,extra\r\nx,,\r\n"
        );
    }

    #[test]
    fn invalid_upload_name_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        let err = import_upload(&store, 9, "rows.txt", b"h\nrow\n").unwrap_err();

        assert!(matches!(err, LedgerError::InvalidUpload { .. }));
        assert!(!store.path(9).exists());
    }

    #[test]
    fn parse_failure_leaves_ledger_untouched() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        store.append(3, &Entry::new("kept", "", "")).unwrap();
        let before = std::fs::read(store.path(3)).unwrap();

        let upload = b"message,mentions,extra\nok,,\n\xff\xfe broken,,\n";
        let err = import_upload(&store, 3, "bad.csv", upload).unwrap_err();

        assert!(matches!(err, LedgerError::Csv(_)));
        assert_eq!(std::fs::read(store.path(3)).unwrap(), before);
    }

    #[test]
    fn header_only_upload_imports_nothing() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();

        assert_eq!(
            import_upload(&store, 4, "empty.csv", b"message,mentions,extra\n").unwrap(),
            0
        );
        assert!(store.entries(4).unwrap().is_empty());
    }
}
