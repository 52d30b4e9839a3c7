//! NNTP article range parsing (RFC 3977 §6/§8)
//!
//! The range grammar accepted by ARTICLE, OVER, XHDR and friends:
//! `N` is the single article N, `N-` is everything from N up, `N-M` is the
//! inclusive span.

use crate::error::{Result, ServerError};

/// An inclusive range of article sequence numbers
///
/// `high == None` means the range is open at the top (`N-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArticleRange {
    /// Lowest sequence number included
    pub low: u64,
    /// Highest sequence number included, or open
    pub high: Option<u64>,
}

impl ArticleRange {
    /// Range covering exactly one article
    pub fn single(n: u64) -> Self {
        Self {
            low: n,
            high: Some(n),
        }
    }

    /// Parse the NNTP range grammar
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidRange`] when the argument is not
    /// `N`, `N-` or `N-M` with decimal numbers.
    pub fn parse(spec: &str) -> Result<Self> {
        let bad = || ServerError::InvalidRange(spec.to_string());

        match spec.split_once('-') {
            None => {
                let n: u64 = spec.parse().map_err(|_| bad())?;
                Ok(Self::single(n))
            }
            Some((low, "")) => {
                let low: u64 = low.parse().map_err(|_| bad())?;
                Ok(Self { low, high: None })
            }
            Some((low, high)) => {
                let low: u64 = low.parse().map_err(|_| bad())?;
                let high: u64 = high.parse().map_err(|_| bad())?;
                Ok(Self {
                    low,
                    high: Some(high),
                })
            }
        }
    }

    /// Whether a sequence number falls inside the range
    pub fn contains(&self, n: u64) -> bool {
        n >= self.low && self.high.is_none_or(|h| n <= h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single() {
        assert_eq!(ArticleRange::parse("5").unwrap(), ArticleRange::single(5));
    }

    #[test]
    fn test_open() {
        assert_eq!(
            ArticleRange::parse("5-").unwrap(),
            ArticleRange { low: 5, high: None }
        );
    }

    #[test]
    fn test_closed() {
        assert_eq!(
            ArticleRange::parse("5-10").unwrap(),
            ArticleRange {
                low: 5,
                high: Some(10)
            }
        );
    }

    #[test]
    fn test_syntax_errors() {
        for bad in ["x", "", "-", "5-x", "x-5", "5--10", "5 -10"] {
            assert!(
                matches!(ArticleRange::parse(bad), Err(ServerError::InvalidRange(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_leading_zeros() {
        // RFC 3977 §3.1: numbers may carry leading zeros
        assert_eq!(
            ArticleRange::parse("007").unwrap(),
            ArticleRange::single(7)
        );
    }

    #[test]
    fn test_contains() {
        let open = ArticleRange::parse("5-").unwrap();
        assert!(!open.contains(4));
        assert!(open.contains(5));
        assert!(open.contains(u64::MAX));

        let closed = ArticleRange::parse("5-10").unwrap();
        assert!(closed.contains(10));
        assert!(!closed.contains(11));
    }
}
