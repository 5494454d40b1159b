//! Mention extraction.
//!
//! Chat messages reference users inline with tokens such as `<@123>` or
//! `<@!123>`. The ledger stores the text without those tokens and keeps the
//! referenced users in a separate `mentions` column as `@name` entries.

use regex::Regex;
use std::sync::LazyLock;

/// Inline user mention: `<@id>` or the legacy nickname form `<@!id>`.
#[allow(clippy::expect_used)]
static MENTION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@!?\d+>").expect("valid regex"));

/// Splits a message into its mention-free text and the `mentions` column.
///
/// `mentioned` is the message's list of referenced display names, in the
/// order the platform reports them. Returns `(clean_text, mentions_field)`
/// where `mentions_field` is every name prefixed with `@` and joined with
/// `,` (empty when nobody is mentioned).
pub fn extract_mentions<S: AsRef<str>>(text: &str, mentioned: &[S]) -> (String, String) {
    let clean = strip_mention_tokens(text).trim().to_string();
    (clean, format_mentions(mentioned))
}

/// Joins display names into the `mentions` column format.
pub fn format_mentions<S: AsRef<str>>(mentioned: &[S]) -> String {
    mentioned
        .iter()
        .map(|name| format!("@{}", name.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Removes every mention token, keeping all other characters in order.
///
/// A token that stands alone between whitespace takes one following
/// whitespace character with it, so `"a <@1> b"` reads `"a b"`.
fn strip_mention_tokens(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    for token in MENTION_TOKEN.find_iter(text) {
        out.push_str(&text[cursor..token.start()]);
        cursor = token.end();

        let standalone = out.chars().next_back().is_none_or(char::is_whitespace);
        if standalone {
            if let Some(ws) = text[cursor..].chars().next().filter(|c| c.is_whitespace()) {
                cursor += ws.len_utf8();
            }
        }
    }

    out.push_str(&text[cursor..]);
    out
}
