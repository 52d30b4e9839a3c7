//! Pattern matching for catalog names
//!
//! Two dialects share this module: the NNTP wildmat language
//! (RFC 3977 §4.2) used by LIST/XPAT/NEWNEWS-style commands, and the
//! IMAP mailbox glob used by LIST/LSUB. Both are evaluated by hand-written
//! matchers; no regex engine is involved.

use crate::store::NO_HIERARCHY;

/// Match a single glob pattern (`*` any substring, `?` one character)
///
/// Case-insensitive. Iterative with single-star backtracking, so
/// adversarial patterns stay linear-ish instead of exponential.
fn glob_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();
    let pat: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();

    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while t < text.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// Evaluate an RFC 3977 wildmat against a text
///
/// The wildmat is a comma-separated pattern list evaluated right-to-left;
/// the rightmost matching pattern decides, a leading `!` negates, and a
/// text matched by no pattern is rejected.
///
/// ```
/// use newsgate::matches_wildmat;
///
/// assert!(matches_wildmat("comp.lang.rust", "*"));
/// assert!(!matches_wildmat("comp.lang.rust", "!*"));
/// assert!(!matches_wildmat("a.b", "a.*,!a.b"));
/// ```
pub fn matches_wildmat(text: &str, wildmat: &str) -> bool {
    for pattern in wildmat.split(',').rev() {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        let (negated, body) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        if glob_match(text, body) {
            return !negated;
        }
    }
    false
}

/// Evaluate an IMAP LIST/LSUB mailbox pattern against a catalog name
///
/// `*` matches any characters including the hierarchy delimiter, `%` stops
/// at the delimiter, `?` matches exactly one character. When the store has
/// no hierarchy (`delimiter == "NIL"`), `%` degrades to `*`.
pub fn matches_mailbox_glob(name: &str, pattern: &str, delimiter: &str) -> bool {
    let delim = if delimiter == NO_HIERARCHY {
        None
    } else {
        delimiter.chars().next()
    };

    let name: Vec<char> = name.chars().flat_map(char::to_lowercase).collect();
    let pat: Vec<char> = collapse_wildcards(pattern);
    mailbox_glob(&name, &pat, delim)
}

/// Collapse wildcard runs (`**`, `*%`, `%%`, …) to a single wildcard
///
/// A run containing `*` is `*`; a run of only `%` is `%`. Keeps the
/// recursive matcher free of adjacent wildcards, which bounds backtracking.
fn collapse_wildcards(pattern: &str) -> Vec<char> {
    let mut out: Vec<char> = Vec::with_capacity(pattern.len());
    for c in pattern.chars().flat_map(char::to_lowercase) {
        match (out.last().copied(), c) {
            (Some('*'), '*' | '%') => {}
            (Some('%'), '%') => {}
            (Some('%'), '*') => {
                out.pop();
                out.push('*');
            }
            _ => out.push(c),
        }
    }
    out
}

fn mailbox_glob(name: &[char], pat: &[char], delim: Option<char>) -> bool {
    let Some(&head) = pat.first() else {
        return name.is_empty();
    };
    match head {
        '*' => (0..=name.len()).any(|i| mailbox_glob(&name[i..], &pat[1..], delim)),
        '%' => {
            for i in 0..=name.len() {
                if mailbox_glob(&name[i..], &pat[1..], delim) {
                    return true;
                }
                // the span consumed by % must not cross the delimiter
                if i < name.len() && Some(name[i]) == delim {
                    return false;
                }
            }
            false
        }
        '?' => !name.is_empty() && mailbox_glob(&name[1..], &pat[1..], delim),
        c => !name.is_empty() && name[0] == c && mailbox_glob(&name[1..], &pat[1..], delim),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Wildmat (RFC 3977 §4.2)

    #[test]
    fn test_wildmat_star_accepts_everything() {
        assert!(matches_wildmat("anything.at.all", "*"));
        assert!(matches_wildmat("", "*"));
    }

    #[test]
    fn test_wildmat_negated_star_rejects_everything() {
        assert!(!matches_wildmat("anything", "!*"));
    }

    #[test]
    fn test_wildmat_rightmost_wins() {
        assert!(!matches_wildmat("a.b", "a.*,!a.b"));
        assert!(matches_wildmat("a.c", "a.*,!a.b"));
        // re-allow after a negation further left
        assert!(matches_wildmat("a.b", "!a.b,a.*"));
    }

    #[test]
    fn test_wildmat_no_match_rejects() {
        assert!(!matches_wildmat("comp.lang.rust", "alt.*"));
        assert!(!matches_wildmat("x", ""));
    }

    #[test]
    fn test_wildmat_question_mark() {
        assert!(matches_wildmat("a.b", "a.?"));
        assert!(!matches_wildmat("a.bc", "a.?"));
    }

    #[test]
    fn test_wildmat_case_insensitive() {
        assert!(matches_wildmat("Comp.Lang.RUST", "comp.lang.*"));
    }

    #[test]
    fn test_glob_backtracking() {
        assert!(glob_match("abcabcabd", "*abd"));
        assert!(glob_match("aaaaab", "*a*b"));
        assert!(!glob_match("aaaaac", "*a*b"));
    }

    // IMAP mailbox glob

    #[test]
    fn test_mailbox_star_crosses_delimiter() {
        assert!(matches_mailbox_glob("work/reports/2024", "work/*", "/"));
        assert!(matches_mailbox_glob("work/reports/2024", "*", "/"));
    }

    #[test]
    fn test_mailbox_percent_stops_at_delimiter() {
        assert!(matches_mailbox_glob("work/reports", "work/%", "/"));
        assert!(!matches_mailbox_glob("work/reports/2024", "work/%", "/"));
        assert!(matches_mailbox_glob("INBOX", "%", "/"));
        assert!(!matches_mailbox_glob("work/reports", "%", "/"));
    }

    #[test]
    fn test_mailbox_percent_with_nil_delimiter() {
        // no hierarchy: % behaves like *
        assert!(matches_mailbox_glob("work/reports/2024", "work/%", "NIL"));
        assert!(matches_mailbox_glob("anything", "%", "NIL"));
    }

    #[test]
    fn test_mailbox_question_mark() {
        assert!(matches_mailbox_glob("ab", "a?", "/"));
        assert!(!matches_mailbox_glob("abc", "a?", "/"));
        assert!(matches_mailbox_glob("a/b", "a?b", "/")); // ? may cross
    }

    #[test]
    fn test_mailbox_case_insensitive() {
        assert!(matches_mailbox_glob("InBox", "inbox", "/"));
    }

    #[test]
    fn test_collapse_wildcards() {
        assert_eq!(collapse_wildcards("a**b"), vec!['a', '*', 'b']);
        assert_eq!(collapse_wildcards("a%%b"), vec!['a', '%', 'b']);
        assert_eq!(collapse_wildcards("a%*%b"), vec!['a', '*', 'b']);
    }
}
