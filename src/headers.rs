//! RFC 5322 header block parsing
//!
//! The parser keeps two views of every header: the trimmed, unfolded value
//! used for decisions, and the verbatim original line(s) used to re-emit
//! the block. First-occurrence order is preserved, so a parse/re-emit
//! round-trip of a well-formed block is lossless.

use crate::error::{Result, ServerError};

/// One logical header: name, unfolded value, and the verbatim line(s)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    /// Header name as it appeared (original casing)
    pub name: String,
    /// Unfolded, trimmed value
    pub value: String,
    /// Full original line, folds joined with CRLF
    pub raw: String,
}

/// Ordered multimap of headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    entries: Vec<HeaderEntry>,
}

impl HeaderBlock {
    /// Empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a CRLF-joined header block
    ///
    /// Continuation lines (leading space or tab) are unfolded into the
    /// previous logical header. An empty line terminates the block.
    ///
    /// # Errors
    ///
    /// [`ServerError::MalformedMessage`] on a line with no colon, or a
    /// continuation line with no header before it.
    pub fn parse(block: &str) -> Result<Self> {
        let mut entries: Vec<HeaderEntry> = Vec::new();

        for line in block.lines() {
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                let Some(last) = entries.last_mut() else {
                    return Err(ServerError::MalformedMessage(
                        "continuation line before any header".to_string(),
                    ));
                };
                last.raw.push_str("\r\n");
                last.raw.push_str(line);
                if !last.value.is_empty() {
                    last.value.push(' ');
                }
                last.value.push_str(line.trim());
            } else {
                let Some((name, value)) = line.split_once(':') else {
                    return Err(ServerError::MalformedMessage(format!(
                        "header line without colon: {line:?}"
                    )));
                };
                entries.push(HeaderEntry {
                    name: name.trim().to_string(),
                    value: value.trim().to_string(),
                    raw: line.to_string(),
                });
            }
        }

        Ok(Self { entries })
    }

    /// Value of the first occurrence of a header, case-insensitive
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
    }

    /// All occurrence values, in order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
            .collect()
    }

    /// Whether at least one occurrence exists
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace all occurrences with a single one, or append if absent
    ///
    /// The first occurrence keeps its position and original name casing;
    /// any further occurrences are dropped.
    pub fn change(&mut self, name: &str, value: &str) {
        let mut seen = false;
        self.entries.retain_mut(|e| {
            if !e.name.eq_ignore_ascii_case(name) {
                return true;
            }
            if seen {
                return false;
            }
            seen = true;
            e.value = value.to_string();
            e.raw = format!("{}: {}", e.name, value);
            true
        });
        if !seen {
            self.append(name, value);
        }
    }

    /// Remove every occurrence of a header
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|e| !e.name.eq_ignore_ascii_case(name));
    }

    /// Append a new occurrence at the end of the block
    pub fn append(&mut self, name: &str, value: &str) {
        self.entries.push(HeaderEntry {
            name: name.to_string(),
            value: value.to_string(),
            raw: format!("{name}: {value}"),
        });
    }

    /// Recompute the raw block by joining the stored full lines with CRLF
    pub fn raw_block(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.raw.as_str())
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    /// Iterate entries in order
    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.entries.iter()
    }

    /// Number of logical headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the block has no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a comma-separated header value (Newsgroups, Followup-To)
///
/// Whitespace around commas is optional; empty items are dropped.
pub fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a whitespace-separated message-id list (References)
pub fn message_id_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "From: a@b\r\nNewsgroups: g.one,g.two\r\nSubject: folded\r\n subject tail\r\nX-Dup: one\r\nX-Dup: two";

    #[test]
    fn test_parse_and_reemit_lossless() {
        let block = HeaderBlock::parse(SAMPLE).unwrap();
        assert_eq!(block.raw_block(), SAMPLE);
    }

    #[test]
    fn test_unfolding() {
        let block = HeaderBlock::parse(SAMPLE).unwrap();
        assert_eq!(block.get("subject"), Some("folded subject tail"));
    }

    #[test]
    fn test_case_insensitive_get() {
        let block = HeaderBlock::parse(SAMPLE).unwrap();
        assert_eq!(block.get("FROM"), Some("a@b"));
        assert_eq!(block.get("newsgroups"), Some("g.one,g.two"));
        assert_eq!(block.get("absent"), None);
    }

    #[test]
    fn test_multiple_occurrences() {
        let block = HeaderBlock::parse(SAMPLE).unwrap();
        assert_eq!(block.get("x-dup"), Some("one"));
        assert_eq!(block.get_all("x-dup"), vec!["one", "two"]);
    }

    #[test]
    fn test_change_replaces_all_occurrences() {
        let mut block = HeaderBlock::parse(SAMPLE).unwrap();
        block.change("X-Dup", "merged");
        assert_eq!(block.get_all("x-dup"), vec!["merged"]);
        // position of the first occurrence is preserved
        let names: Vec<_> = block.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["From", "Newsgroups", "Subject", "X-Dup"]
        );
    }

    #[test]
    fn test_change_appends_when_absent() {
        let mut block = HeaderBlock::parse("From: a@b").unwrap();
        block.change("Injection-Date", "today");
        assert_eq!(block.get("injection-date"), Some("today"));
        assert_eq!(block.raw_block(), "From: a@b\r\nInjection-Date: today");
    }

    #[test]
    fn test_remove_all_occurrences() {
        let mut block = HeaderBlock::parse(SAMPLE).unwrap();
        block.remove("x-dup");
        assert!(block.get("x-dup").is_none());
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(HeaderBlock::parse("no colon here").is_err());
        assert!(HeaderBlock::parse(" leading continuation").is_err());
    }

    #[test]
    fn test_empty_line_terminates() {
        let block = HeaderBlock::parse("From: a@b\r\n\r\nBody: not a header").unwrap();
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn test_comma_list() {
        assert_eq!(comma_list("a.b, c.d ,e.f"), vec!["a.b", "c.d", "e.f"]);
        assert_eq!(comma_list(""), Vec::<String>::new());
    }

    #[test]
    fn test_message_id_list() {
        assert_eq!(
            message_id_list("<a@b>  <c@d>"),
            vec!["<a@b>", "<c@d>"]
        );
    }
}
