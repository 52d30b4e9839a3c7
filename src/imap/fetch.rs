//! UID FETCH
//!
//! Iterates the selected mailbox over a UID range and emits one untagged
//! FETCH line per message, literals included. Output is forced to
//! ascending sequence order regardless of how the store produced it.

use std::collections::HashMap;

use crate::error::Result;
use crate::store::{Message, MessageDetail};

use super::ImapSession;

/// Parse `lo`, `lo:hi` or `lo:*`
fn parse_uid_range(spec: &str) -> Option<(u64, Option<u64>)> {
    match spec.split_once(':') {
        None => spec.parse().ok().map(|n| (n, Some(n))),
        Some((lo, "*")) => lo.parse().ok().map(|n| (n, None)),
        Some((lo, hi)) => match (lo.parse(), hi.parse()) {
            (Ok(lo), Ok(hi)) => Some((lo, Some(hi))),
            _ => None,
        },
    }
}

/// Canonical form of a fetch element: uppercased, `.PEEK` collapsed
fn canonical_element(element: &str) -> String {
    element.to_ascii_uppercase().replace("BODY.PEEK[", "BODY[")
}

/// Append ` LABEL {n}` CRLF and the literal payload
fn append_literal(out: &mut Vec<u8>, label: &str, payload: &[u8]) {
    out.extend_from_slice(format!(" {} {{{}}}\r\n", label, payload.len()).as_bytes());
    out.extend_from_slice(payload);
}

/// The names inside `BODY[HEADER.FIELDS (A B)]`, or `None` when malformed
fn header_fields(element: &str) -> Option<Vec<String>> {
    let open = element.find('(')?;
    let close = element.rfind(')')?;
    if close <= open {
        return None;
    }
    Some(
        element[open + 1..close]
            .split_whitespace()
            .map(str::to_string)
            .collect(),
    )
}

/// Whether a fetch element is one this engine can serve
fn element_supported(element: &str) -> bool {
    matches!(
        element,
        "UID" | "FLAGS" | "RFC822.SIZE" | "BODY[]" | "BODY[HEADER]" | "BODY[TEXT]"
    ) || (element.starts_with("BODY[HEADER.FIELDS") && header_fields(element).is_some())
}

impl ImapSession {
    pub(super) async fn cmd_uid_fetch(&mut self, tag: &str, args: &[String]) -> Result<()> {
        let Some(identity) = self.require_identity(tag).await? else {
            return Ok(());
        };
        let Some(selected) = self.selected.clone() else {
            self.framed
                .write_line(&format!("{tag} NO No mailbox selected"))
                .await?;
            return Ok(());
        };
        if args.len() < 2 {
            self.framed
                .write_line(&format!("{tag} BAD UID FETCH expects a range and items"))
                .await?;
            return Ok(());
        }
        let Some((low, high)) = parse_uid_range(&args[0]) else {
            self.framed
                .write_line(&format!("{tag} BAD Invalid UID range"))
                .await?;
            return Ok(());
        };

        let elements: Vec<String> = if args.len() == 2 && args[1].starts_with('(') {
            let inner = args[1]
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .unwrap_or(&args[1]);
            super::tokenize(inner)
        } else {
            args[1..].to_vec()
        };
        let elements: Vec<String> = elements.iter().map(|e| canonical_element(e)).collect();
        if let Some(unknown) = elements.iter().find(|e| !element_supported(e)) {
            self.framed
                .write_line(&format!("{tag} BAD Unknown FETCH item {unknown}"))
                .await?;
            return Ok(());
        }

        let Some(messages) =
            self.store
                .get_messages(Some(&identity), &selected.catalog.name, low, high)?
        else {
            self.framed
                .write_line(&format!("{tag} NO No such mailbox"))
                .await?;
            return Ok(());
        };
        let details: HashMap<String, MessageDetail> = self
            .store
            .get_message_details(&identity, &selected.catalog.name, low, high)?
            .unwrap_or_default()
            .into_iter()
            .map(|d| (d.message_id.clone(), d))
            .collect();

        for message in &messages {
            let line = render_fetch(message, details.get(&message.id), &elements);
            self.framed.write_raw(&line).await?;
        }
        self.framed
            .write_line(&format!("{tag} OK UID FETCH completed"))
            .await?;
        Ok(())
    }
}

/// Render one `* n FETCH (...)` line including its trailing CRLF
///
/// FLAGS and UID are always present; the other items appear in the order
/// the client requested them.
fn render_fetch(message: &Message, detail: Option<&MessageDetail>, elements: &[String]) -> Vec<u8> {
    let flags = detail.map(|d| d.imap_flags().join(" ")).unwrap_or_default();
    let mut out: Vec<u8> =
        format!("* {} FETCH (FLAGS ({})", message.sequence, flags).into_bytes();

    for element in elements {
        match element.as_str() {
            // always emitted, regardless of position in the request
            "UID" | "FLAGS" => {}
            "RFC822.SIZE" => {
                out.extend_from_slice(format!(" RFC822.SIZE {}", message.size()).as_bytes());
            }
            "BODY[]" => {
                append_literal(&mut out, "BODY[]", message.full_text().as_bytes());
            }
            "BODY[HEADER]" => {
                let content = format!("{}\r\n\r\n", message.headers.raw_block());
                append_literal(&mut out, "BODY[HEADER]", content.as_bytes());
            }
            "BODY[TEXT]" => {
                append_literal(&mut out, "BODY[TEXT]", message.body.as_bytes());
            }
            other => {
                // pre-validated: only HEADER.FIELDS reaches this arm
                let Some(fields) = header_fields(other) else {
                    continue;
                };
                let lines: Vec<&str> = message
                    .headers
                    .iter()
                    .filter(|e| fields.iter().any(|f| f.eq_ignore_ascii_case(&e.name)))
                    .map(|e| e.raw.as_str())
                    .collect();
                let mut content = lines.join("\r\n");
                content.push_str("\r\n\r\n");
                let label = format!("BODY[HEADER.FIELDS ({})]", fields.join(" "));
                append_literal(&mut out, &label, content.as_bytes());
            }
        }
    }

    out.extend_from_slice(format!(" UID {})\r\n", message.sequence).as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderBlock;

    fn message() -> Message {
        Message {
            id: "<m@x>".to_string(),
            sequence: 3,
            cancelled: false,
            pending: false,
            headers: HeaderBlock::parse("From: a@b\r\nSubject: s").unwrap(),
            body: "hello".to_string(),
        }
    }

    #[test]
    fn test_parse_uid_range() {
        assert_eq!(parse_uid_range("5"), Some((5, Some(5))));
        assert_eq!(parse_uid_range("1:2"), Some((1, Some(2))));
        assert_eq!(parse_uid_range("7:*"), Some((7, None)));
        assert_eq!(parse_uid_range("x"), None);
        assert_eq!(parse_uid_range("1:x"), None);
    }

    #[test]
    fn test_canonical_element() {
        assert_eq!(canonical_element("body.peek[header]"), "BODY[HEADER]");
        assert_eq!(canonical_element("rfc822.size"), "RFC822.SIZE");
    }

    #[test]
    fn test_element_supported() {
        assert!(element_supported("UID"));
        assert!(element_supported("BODY[]"));
        assert!(element_supported("BODY[HEADER.FIELDS (SUBJECT)]"));
        assert!(!element_supported("ENVELOPE"));
        assert!(!element_supported("BODY[HEADER.FIELDS]"));
    }

    #[test]
    fn test_render_flags_size_uid() {
        let rendered = render_fetch(
            &message(),
            None,
            &["UID".to_string(), "FLAGS".to_string(), "RFC822.SIZE".to_string()],
        );
        let text = String::from_utf8(rendered).unwrap();
        let expected_size = message().size();
        assert_eq!(
            text,
            format!("* 3 FETCH (FLAGS () RFC822.SIZE {expected_size} UID 3)\r\n")
        );
    }

    #[test]
    fn test_render_body_literal() {
        let rendered = render_fetch(&message(), None, &["BODY[TEXT]".to_string()]);
        let text = String::from_utf8(rendered).unwrap();
        assert_eq!(text, "* 3 FETCH (FLAGS () BODY[TEXT] {5}\r\nhello UID 3)\r\n");
    }

    #[test]
    fn test_render_header_fields() {
        let rendered = render_fetch(
            &message(),
            None,
            &["BODY[HEADER.FIELDS (SUBJECT)]".to_string()],
        );
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.contains("BODY[HEADER.FIELDS (SUBJECT)] {14}\r\nSubject: s\r\n\r\n"));
    }
}
