//! POST accumulator and validation
//!
//! After `340` the session loop hands every frame to the accumulator until
//! the `.` terminator, then the collected article runs through the
//! validation pipeline: header hygiene, control authorization, the
//! moderator approval sub-protocol, and finally linking into each existing
//! target catalog.

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::headers::{HeaderBlock, comma_list, message_id_list};
use crate::store::{Identity, metagroup_base};
use crate::stream::strip_dot_stuffing;

use super::{Flow, NntpSession, control};

/// RFC 5322 date format used for Injection-Date
const INJECTION_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S +0000";

impl NntpSession {
    pub(super) async fn cmd_post(&mut self) -> Result<Flow> {
        if !self.config.allow_posting {
            self.framed.write_line("440 Posting not permitted").await?;
            return Ok(Flow::Continue);
        }
        let Some(identity) = self.identity.clone() else {
            self.framed
                .write_line("480 Authentication required for posting")
                .await?;
            return Ok(Flow::Continue);
        };
        self.framed
            .write_line("340 Send article to be posted")
            .await?;

        // Continuation mode: frames belong to the accumulator until the
        // end-of-data terminator. A shutdown discards the pending article
        // without writing a reply.
        let mut lines: Vec<String> = Vec::new();
        loop {
            let line = tokio::select! {
                _ = self.shutdown.changed() => return Ok(Flow::Quit),
                line = self.framed.read_line() => line?,
            };
            if line == "." {
                break;
            }
            lines.push(strip_dot_stuffing(&line).to_string());
        }

        let reply = self.process_post(&identity, &lines)?;
        self.framed.write_line(reply).await?;
        Ok(Flow::Continue)
    }

    fn process_post(&mut self, identity: &Identity, lines: &[String]) -> Result<&'static str> {
        let blank = lines.iter().position(|l| l.is_empty());
        let (header_lines, body_lines) = match blank {
            Some(i) => (&lines[..i], &lines[i + 1..]),
            None => (lines, &lines[..0]),
        };
        let mut headers = match HeaderBlock::parse(&header_lines.join("\r\n")) {
            Ok(h) if !h.is_empty() => h,
            _ => return Ok("441 Posting failed"),
        };
        let body = body_lines.join("\r\n");

        let targets = headers
            .get("Newsgroups")
            .map(comma_list)
            .unwrap_or_default();
        if targets.is_empty() {
            return Ok("441 Posting failed");
        }

        let can_approve = |catalog: &str| {
            identity.flags.can_approve_any
                || identity.flags.can_inject
                || identity.moderates(catalog)
        };

        // Header hygiene. An Approved: header survives only when the poster
        // may approve in every listed catalog.
        for catalog in &targets {
            if !can_approve(catalog) {
                headers.remove("Approved");
            }
        }
        if !identity.flags.can_cancel {
            headers.remove("Supersedes");
        }
        if !identity.flags.can_inject {
            headers.change(
                "Injection-Date",
                &Utc::now().format(INJECTION_DATE_FORMAT).to_string(),
            );
            headers.remove("Injection-Info");
            headers.remove("Xref");
        }
        let followup_redundant = headers.get("Followup-To").is_some()
            && headers.get("Followup-To") == headers.get("Newsgroups");
        if followup_redundant {
            headers.remove("Followup-To");
        }

        let control_header = headers.get("Control").map(str::to_string);
        if let Some(control) = &control_header
            && !control::authorized(identity, control, &targets)
        {
            warn!(
                username = identity.username,
                control, "control message denied"
            );
            return Ok("480 Permission to issue control message denied");
        }

        // Approval sub-protocol: a moderator answering with an APPROVE body
        // releases the referenced messages instead of posting.
        let approval_body = body == "APPROVE"
            || body == "APPROVED"
            || body.starts_with("APPROVE\r\n")
            || body.starts_with("APPROVED\r\n");
        let references = headers
            .get("References")
            .map(message_id_list)
            .unwrap_or_default();
        if approval_body && !references.is_empty() && targets.iter().any(|c| can_approve(c)) {
            let approver = identity.mailbox(&self.config.path_host);
            for catalog in targets.iter().filter(|c| can_approve(c)) {
                for reference in &references {
                    if self
                        .store
                        .set_approved(identity, reference, catalog, &approver)?
                    {
                        debug!(catalog = %catalog, reference = %reference, "message approved");
                    } else {
                        debug!(catalog = %catalog, reference = %reference, "no pending link to approve");
                    }
                }
            }
            return Ok("240 Article received OK");
        }

        // The message must carry an id before it can be linked
        if headers.get("Message-ID").is_none() {
            let generated = format!("<{}@{}>", Uuid::new_v4(), self.config.path_host);
            headers.append("Message-ID", &generated);
        }

        // Drop metagroups, unknown names and catalogs refusing local posts
        let mut accepted: Vec<String> = Vec::new();
        for name in &targets {
            if metagroup_base(name).is_some() {
                warn!(catalog = %name, "posting to a metagroup view is not possible");
                continue;
            }
            match self.store.get_catalog_by_name(Some(identity), name)? {
                None => {
                    debug!(catalog = %name, "target catalog does not exist, skipping");
                }
                Some(c) if c.deny_local_posting => {
                    warn!(catalog = %name, "catalog denies local posting, skipping");
                }
                Some(_) => accepted.push(name.clone()),
            }
        }

        let message = self
            .store
            .save_message(identity, &accepted, &headers, &body)?;
        debug!(id = %message.id, catalogs = accepted.len(), "article stored");

        if let Some(control) = &control_header {
            control::apply(
                self.store.as_ref(),
                identity,
                control,
                &accepted,
                &message.id,
            );
        }

        Ok("240 Article received OK")
    }
}
