//! Overview (OVER/XOVER) line construction
//!
//! The overview format is the RFC 3977 §8.3 tab-separated line:
//! `number TAB Subject TAB From TAB Date TAB Message-ID TAB References
//! TAB bytes TAB lines`. Field content must never contain NUL, CR, LF or
//! TAB, so those are squashed to spaces.

use crate::store::Message;

/// Replace `\0`, `\r`, `\n` and `\t` with spaces inside one overview field
pub fn squash_field(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '\0' | '\r' | '\n' | '\t' => ' ',
            other => other,
        })
        .collect()
}

/// Build the overview line for a message
pub fn overview_line(message: &Message) -> String {
    let field = |name: &str| squash_field(message.headers.get(name).unwrap_or(""));
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        message.sequence,
        field("Subject"),
        field("From"),
        field("Date"),
        squash_field(&message.id),
        field("References"),
        message.size(),
        message.line_count(),
    )
}
