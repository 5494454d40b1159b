//! CSV Ledger - Per-Server Message Ledgers
//!
//! Keeps one CSV file per chat server with the fixed header
//! `message,mentions,extra`. Rows come from three places: a full channel
//! scrape (which rebuilds the file), single messages picked by a user, and
//! uploaded CSV files merged at the end.
//!
//! Nothing in this crate knows about a chat platform. Messages are seen
//! through the [`ChatMessage`] trait so the bot binary can plug its own
//! payload types in.
//!
//! # Usage
//!
//! ```no_run
//! use csv_ledger::{Entry, LedgerStore, extract_mentions};
//!
//! # fn main() -> csv_ledger::Result<()> {
//! let store = LedgerStore::open("ledgers")?;
//! let (message, mentions) = extract_mentions("hello <@123> world", &["alice"]);
//! store.append(42, &Entry::new(message, mentions, ""))?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod import;
pub mod ledger;
pub mod mentions;
pub mod scrape;

pub use error::{LedgerError, Result};
pub use import::{import_upload, validate_upload_name};
pub use ledger::{Entry, HEADER, LedgerStore};
pub use mentions::extract_mentions;
pub use scrape::{ChatMessage, entries_from_history, rebuild_from_history};
