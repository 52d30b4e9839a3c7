//! NNTP read-side command handlers
//!
//! Group selection, article retrieval, listings, overview and header
//! extraction. Everything here is driven by the dispatch table in the
//! session module.

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use tracing::debug;

use crate::error::Result;
use crate::overview::{overview_line, squash_field};
use crate::range::ArticleRange;
use crate::store::{Catalog, Message};
use crate::wildmat::matches_wildmat;

use super::{Flow, NntpSession};

/// Which part of an article STAT/HEAD/BODY/ARTICLE returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ArticlePart {
    Stat,
    Head,
    Body,
    Full,
}

/// LIST ACTIVE / NEWGROUPS line: `name high low status`
fn active_line(catalog: &Catalog) -> String {
    format!(
        "{} {} {} {}",
        catalog.name,
        catalog.high_watermark.unwrap_or(0),
        catalog.low_watermark.unwrap_or(0),
        catalog.posting_status()
    )
}

impl NntpSession {
    /// The selected catalog, or `None` after writing 412
    async fn require_current(&mut self) -> Result<Option<Catalog>> {
        if let Some(catalog) = self.current_catalog.clone() {
            Ok(Some(catalog))
        } else {
            self.framed.write_line("412 No newsgroup selected").await?;
            Ok(None)
        }
    }

    /// The current article number, or `None` after writing 420
    async fn require_current_article(&mut self) -> Result<Option<u64>> {
        if let Some(n) = self.current_article {
            Ok(Some(n))
        } else {
            self.framed
                .write_line("420 No current article selected")
                .await?;
            Ok(None)
        }
    }

    pub(super) async fn cmd_group(&mut self, args: &str) -> Result<Flow> {
        if args.is_empty() || args.contains(' ') {
            self.framed.write_line("501 Command syntax error").await?;
            return Ok(Flow::Continue);
        }
        let Some(catalog) = self
            .store
            .get_catalog_by_name(self.identity.as_ref(), args)?
        else {
            self.framed.write_line("411 No such newsgroup").await?;
            return Ok(Flow::Continue);
        };
        debug!(catalog = catalog.name, "group selected");
        self.framed
            .write_line(&format!(
                "211 {} {} {} {}",
                catalog.message_count,
                catalog.low_watermark.unwrap_or(0),
                catalog.high_watermark.unwrap_or(0),
                catalog.name
            ))
            .await?;
        self.current_article = catalog.low_watermark;
        self.current_catalog = Some(catalog);
        Ok(Flow::Continue)
    }

    pub(super) async fn cmd_listgroup(&mut self, args: &str) -> Result<Flow> {
        let mut tokens = args.split_whitespace();
        let group = tokens.next();
        let range = match tokens.next() {
            Some(spec) => Some(ArticleRange::parse(spec)?),
            None => None,
        };

        let catalog = match group {
            Some(name) => {
                let Some(catalog) = self
                    .store
                    .get_catalog_by_name(self.identity.as_ref(), name)?
                else {
                    self.framed.write_line("411 No such newsgroup").await?;
                    return Ok(Flow::Continue);
                };
                self.current_article = catalog.low_watermark;
                self.current_catalog = Some(catalog.clone());
                catalog
            }
            None => match self.require_current().await? {
                Some(catalog) => catalog,
                None => return Ok(Flow::Continue),
            },
        };

        let (low, high) = match range {
            Some(r) => (r.low, r.high),
            None => (1, None),
        };
        let Some(messages) =
            self.store
                .get_messages(self.identity.as_ref(), &catalog.name, low, high)?
        else {
            self.framed.write_line("411 No such newsgroup").await?;
            return Ok(Flow::Continue);
        };

        self.framed
            .write_line(&format!(
                "211 {} {} {} {} list follows",
                catalog.message_count,
                catalog.low_watermark.unwrap_or(0),
                catalog.high_watermark.unwrap_or(0),
                catalog.name
            ))
            .await?;
        let numbers: Vec<String> = messages.iter().map(|m| m.sequence.to_string()).collect();
        self.framed.write_multiline(&numbers, false).await?;
        Ok(Flow::Continue)
    }

    pub(super) async fn cmd_last_next(&mut self, forward: bool) -> Result<Flow> {
        let Some(catalog) = self.require_current().await? else {
            return Ok(Flow::Continue);
        };
        let Some(current) = self.require_current_article().await? else {
            return Ok(Flow::Continue);
        };

        let neighbour: Option<Message> = if forward {
            self.store
                .get_messages(self.identity.as_ref(), &catalog.name, current + 1, None)?
                .and_then(|mut m| {
                    if m.is_empty() {
                        None
                    } else {
                        Some(m.remove(0))
                    }
                })
        } else if current <= 1 {
            None
        } else {
            self.store
                .get_messages(self.identity.as_ref(), &catalog.name, 1, Some(current - 1))?
                .and_then(|mut m| m.pop())
        };

        match neighbour {
            Some(message) => {
                self.current_article = Some(message.sequence);
                self.framed
                    .write_line(&format!("223 {} {}", message.sequence, message.id))
                    .await?;
            }
            None if forward => {
                self.framed
                    .write_line("421 No next article in this group")
                    .await?;
            }
            None => {
                self.framed
                    .write_line("422 No previous article in this group")
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    pub(super) async fn cmd_article(&mut self, args: &str, part: ArticlePart) -> Result<Flow> {
        let located: Option<(u64, Message)> = if args.starts_with('<') {
            // by message-id: no group selection involved, number reported 0
            match self.store.get_message_by_id(self.identity.as_ref(), args)? {
                Some(message) => Some((0, message)),
                None => {
                    self.framed
                        .write_line("430 No article with that message-id")
                        .await?;
                    return Ok(Flow::Continue);
                }
            }
        } else {
            let Some(catalog) = self.require_current().await? else {
                return Ok(Flow::Continue);
            };
            let number = if args.is_empty() {
                match self.require_current_article().await? {
                    Some(n) => n,
                    None => return Ok(Flow::Continue),
                }
            } else {
                match args.parse::<u64>() {
                    Ok(n) => n,
                    Err(_) => {
                        self.framed.write_line("501 Command syntax error").await?;
                        return Ok(Flow::Continue);
                    }
                }
            };
            let found = self
                .store
                .get_messages(self.identity.as_ref(), &catalog.name, number, Some(number))?
                .and_then(|mut m| m.pop());
            match found {
                Some(message) => {
                    self.current_article = Some(number);
                    Some((number, message))
                }
                None => {
                    let reply = if args.is_empty() {
                        "420 No current article selected"
                    } else {
                        "423 No article with that number"
                    };
                    self.framed.write_line(reply).await?;
                    return Ok(Flow::Continue);
                }
            }
        };

        let Some((number, message)) = located else {
            return Ok(Flow::Continue);
        };
        match part {
            ArticlePart::Stat => {
                self.framed
                    .write_line(&format!("223 {} {}", number, message.id))
                    .await?;
            }
            ArticlePart::Head => {
                self.framed
                    .write_line(&format!("221 {} {}", number, message.id))
                    .await?;
                let raw = message.headers.raw_block();
                self.framed.write_multiline(raw.lines(), false).await?;
            }
            ArticlePart::Body => {
                self.framed
                    .write_line(&format!("222 {} {}", number, message.id))
                    .await?;
                self.framed
                    .write_multiline(message.body.lines(), false)
                    .await?;
            }
            ArticlePart::Full => {
                self.framed
                    .write_line(&format!("220 {} {}", number, message.id))
                    .await?;
                let raw = message.headers.raw_block();
                let lines = raw.lines().chain([""]).chain(message.body.lines());
                self.framed.write_multiline(lines, false).await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Catalogs visible to the connection: globals, then personals
    fn visible_catalogs(&self) -> Result<Vec<Catalog>> {
        let mut catalogs = self
            .store
            .get_global_catalogs(self.identity.as_ref(), None)?;
        if let Some(identity) = self.identity.as_ref() {
            catalogs.extend(self.store.get_personal_catalogs(identity, None)?);
        }
        Ok(catalogs)
    }

    pub(super) async fn cmd_list(&mut self, args: &str) -> Result<Flow> {
        let (keyword, wildmat) = match args.split_once(' ') {
            Some((k, rest)) => (k.to_ascii_uppercase(), Some(rest.trim())),
            None if args.is_empty() => ("ACTIVE".to_string(), None),
            None => (args.to_ascii_uppercase(), None),
        };

        let mut catalogs = self.visible_catalogs()?;
        if let Some(pattern) = wildmat {
            catalogs.retain(|c| matches_wildmat(&c.name, pattern));
        }

        let lines: Vec<String> = match keyword.as_str() {
            "ACTIVE" => catalogs.iter().map(active_line).collect(),
            "NEWSGROUPS" => catalogs
                .iter()
                .map(|c| format!("{}\t{}", c.name, c.description.as_deref().unwrap_or("")))
                .collect(),
            _ => {
                self.framed.write_line("501 Command syntax error").await?;
                return Ok(Flow::Continue);
            }
        };

        self.framed
            .write_line("215 list of newsgroups follows")
            .await?;
        self.framed.write_multiline(&lines, false).await?;
        Ok(Flow::Continue)
    }

    pub(super) async fn cmd_newgroups(&mut self, args: &str) -> Result<Flow> {
        let mut tokens = args.split_whitespace();
        let (Some(date), Some(time)) = (tokens.next(), tokens.next()) else {
            self.framed.write_line("501 Command syntax error").await?;
            return Ok(Flow::Continue);
        };

        let date = match date.len() {
            8 => NaiveDate::parse_from_str(date, "%Y%m%d"),
            6 => NaiveDate::parse_from_str(date, "%y%m%d"),
            _ => {
                self.framed.write_line("501 Command syntax error").await?;
                return Ok(Flow::Continue);
            }
        };
        let (Ok(date), Ok(time)) = (date, NaiveTime::parse_from_str(time, "%H%M%S")) else {
            self.framed.write_line("501 Command syntax error").await?;
            return Ok(Flow::Continue);
        };
        let cutoff = Utc.from_utc_datetime(&date.and_time(time));

        let recent: Vec<String> = self
            .store
            .get_global_catalogs(self.identity.as_ref(), None)?
            .iter()
            .filter(|c| c.created_at >= cutoff)
            .map(active_line)
            .collect();

        self.framed
            .write_line("231 list of new newsgroups follows")
            .await?;
        self.framed.write_multiline(&recent, false).await?;
        Ok(Flow::Continue)
    }

    /// Resolve an optional range argument against the current article
    async fn resolve_range(&mut self, args: &str) -> Result<Option<ArticleRange>> {
        if args.is_empty() {
            Ok(self.require_current_article().await?.map(ArticleRange::single))
        } else {
            Ok(Some(ArticleRange::parse(args)?))
        }
    }

    pub(super) async fn cmd_over(&mut self, args: &str) -> Result<Flow> {
        let Some(catalog) = self.require_current().await? else {
            return Ok(Flow::Continue);
        };
        let Some(range) = self.resolve_range(args).await? else {
            return Ok(Flow::Continue);
        };
        let Some(messages) =
            self.store
                .get_messages(self.identity.as_ref(), &catalog.name, range.low, range.high)?
        else {
            self.framed.write_line("411 No such newsgroup").await?;
            return Ok(Flow::Continue);
        };
        if messages.is_empty() {
            self.framed
                .write_line("423 No articles in that range")
                .await?;
            return Ok(Flow::Continue);
        }
        self.framed
            .write_line("224 Overview information follows")
            .await?;
        let lines: Vec<String> = messages.iter().map(overview_line).collect();
        self.framed.write_multiline(&lines, self.compress).await?;
        Ok(Flow::Continue)
    }

    pub(super) async fn cmd_hdr(&mut self, args: &str, code: u16) -> Result<Flow> {
        let (header, rest) = match args.split_once(' ') {
            Some((h, rest)) => (h, rest.trim()),
            None if !args.is_empty() => (args, ""),
            None => {
                self.framed.write_line("501 Command syntax error").await?;
                return Ok(Flow::Continue);
            }
        };

        let lines: Vec<String> = if rest.starts_with('<') {
            match self.store.get_message_by_id(self.identity.as_ref(), rest)? {
                Some(message) => vec![format!(
                    "0 {}",
                    squash_field(message.headers.get(header).unwrap_or(""))
                )],
                None => {
                    self.framed
                        .write_line("430 No article with that message-id")
                        .await?;
                    return Ok(Flow::Continue);
                }
            }
        } else {
            let Some(catalog) = self.require_current().await? else {
                return Ok(Flow::Continue);
            };
            let Some(range) = self.resolve_range(rest).await? else {
                return Ok(Flow::Continue);
            };
            let Some(messages) = self.store.get_messages(
                self.identity.as_ref(),
                &catalog.name,
                range.low,
                range.high,
            )?
            else {
                self.framed.write_line("411 No such newsgroup").await?;
                return Ok(Flow::Continue);
            };
            messages
                .iter()
                .map(|m| {
                    format!(
                        "{} {}",
                        m.sequence,
                        squash_field(m.headers.get(header).unwrap_or(""))
                    )
                })
                .collect()
        };

        self.framed
            .write_line(&format!("{code} Headers follow"))
            .await?;
        self.framed.write_multiline(&lines, self.compress).await?;
        Ok(Flow::Continue)
    }

    pub(super) async fn cmd_xpat(&mut self, args: &str) -> Result<Flow> {
        let mut tokens = args.splitn(3, ' ');
        let (Some(header), Some(spec), Some(pattern)) =
            (tokens.next(), tokens.next(), tokens.next())
        else {
            self.framed.write_line("501 Command syntax error").await?;
            return Ok(Flow::Continue);
        };
        let Some(catalog) = self.require_current().await? else {
            return Ok(Flow::Continue);
        };
        let range = ArticleRange::parse(spec)?;
        let Some(messages) =
            self.store
                .get_messages(self.identity.as_ref(), &catalog.name, range.low, range.high)?
        else {
            self.framed.write_line("411 No such newsgroup").await?;
            return Ok(Flow::Continue);
        };

        let lines: Vec<String> = messages
            .iter()
            .filter_map(|m| {
                let value = m.headers.get(header).unwrap_or("");
                matches_wildmat(value, pattern)
                    .then(|| format!("{} {}", m.sequence, squash_field(value)))
            })
            .collect();

        self.framed.write_line("221 Headers follow").await?;
        self.framed.write_multiline(&lines, self.compress).await?;
        Ok(Flow::Continue)
    }
}
