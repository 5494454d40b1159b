//! Channel scrapes.
//!
//! A scrape turns a whole channel history into ledger rows and replaces the
//! server's ledger with them. The history is buffered completely before the
//! rebuild because the rebuild is all-or-nothing.

use crate::{
    error::Result,
    ledger::{Entry, LedgerStore},
    mentions::extract_mentions,
};

/// A chat message as seen by the ledger.
pub trait ChatMessage {
    /// Raw message text, mention tokens included.
    fn content(&self) -> &str;

    /// Display names of the mentioned users, in the platform's order.
    fn mention_names(&self) -> Vec<&str>;

    /// Ledger row for this message with the given annotation.
    fn to_entry(&self, extra: &str) -> Entry {
        let (message, mentions) = extract_mentions(self.content(), &self.mention_names());
        Entry::new(message, mentions, extra)
    }
}

/// Maps a history, in delivery order, to rows with an empty `extra` column.
pub fn entries_from_history<'a, M, I>(messages: I) -> Vec<Entry>
where
    M: ChatMessage + 'a,
    I: IntoIterator<Item = &'a M>,
{
    messages.into_iter().map(|msg| msg.to_entry("")).collect()
}

/// Rebuilds a server's ledger from a channel history.
///
/// Returns the number of rows written.
pub fn rebuild_from_history<'a, M, I>(
    store: &LedgerStore,
    server_id: u64,
    messages: I,
) -> Result<usize>
where
    M: ChatMessage + 'a,
    I: IntoIterator<Item = &'a M>,
{
    let entries = entries_from_history(messages);
    store.rebuild(server_id, &entries)?;
    Ok(entries.len())
}
