//! IMAP mailbox commands: SELECT/EXAMINE, CREATE/DELETE, LIST/LSUB,
//! SUBSCRIBE/UNSUBSCRIBE and STATUS

use tracing::debug;

use crate::error::Result;
use crate::store::{Catalog, NO_HIERARCHY};
use crate::wildmat::matches_mailbox_glob;

use super::{ImapSession, Selected};

/// UIDVALIDITY is the catalog creation instant as yyyyMMddhhmm
const UIDVALIDITY_FORMAT: &str = "%Y%m%d%H%M";

/// Render the hierarchy delimiter for a LIST/LSUB line
///
/// The `"NIL"` sentinel is emitted as the unquoted NIL atom.
fn delimiter_atom(delimiter: &str) -> String {
    if delimiter == NO_HIERARCHY {
        "NIL".to_string()
    } else {
        format!("\"{delimiter}\"")
    }
}

/// Mailbox attribute derived from a well-known name, if any
fn special_use(name: &str, delimiter: &str) -> Option<&'static str> {
    let leaf = if delimiter == NO_HIERARCHY {
        name
    } else {
        name.rsplit(delimiter).next().unwrap_or(name)
    };
    match leaf.to_ascii_lowercase().as_str() {
        "all" => Some("\\All"),
        "drafts" => Some("\\Drafts"),
        "important" | "starred" => Some("\\Flagged"),
        "junk" | "spam" => Some("\\Junk"),
        "sent" => Some("\\Sent"),
        "trash" => Some("\\Trash"),
        _ => None,
    }
}

impl ImapSession {
    pub(super) async fn cmd_select(
        &mut self,
        tag: &str,
        args: &[String],
        examine: bool,
    ) -> Result<()> {
        let Some(identity) = self.require_identity(tag).await? else {
            return Ok(());
        };
        let [mailbox] = args else {
            self.framed
                .write_line(&format!("{tag} BAD SELECT expects a mailbox"))
                .await?;
            return Ok(());
        };
        let verb = if examine { "EXAMINE" } else { "SELECT" };

        let Some(catalog) = self.store.get_catalog_by_name(Some(&identity), mailbox)? else {
            // a failed SELECT from Selected falls back to Authenticated
            self.selected = None;
            self.framed
                .write_line(&format!("{tag} NO No such mailbox"))
                .await?;
            return Ok(());
        };

        // read-write only when selecting a catalog the identity owns
        let read_only = examine || catalog.owner != Some(identity.id);

        self.framed.write_line("* FLAGS ()").await?;
        self.framed
            .write_line(&format!("* {} EXISTS", catalog.message_count))
            .await?;
        self.framed.write_line("* 0 RECENT").await?;
        self.framed
            .write_line(&format!("* OK [UIDNEXT {}]", catalog.next_sequence()))
            .await?;
        self.framed
            .write_line(&format!(
                "* OK [UIDVALIDITY {}]",
                catalog.created_at.format(UIDVALIDITY_FORMAT)
            ))
            .await?;
        let access = if read_only {
            "[READ-ONLY]"
        } else {
            "[READ-WRITE]"
        };
        self.framed
            .write_line(&format!("{tag} OK {access} {verb} completed"))
            .await?;

        debug!(mailbox = catalog.name, read_only, "mailbox selected");
        self.selected = Some(Selected { catalog, read_only });
        Ok(())
    }

    pub(super) async fn cmd_create(&mut self, tag: &str, args: &[String]) -> Result<()> {
        let Some(identity) = self.require_identity(tag).await? else {
            return Ok(());
        };
        let [mailbox] = args else {
            self.framed
                .write_line(&format!("{tag} BAD CREATE expects a mailbox"))
                .await?;
            return Ok(());
        };
        // a trailing hierarchy delimiter is declarative, not part of the name
        let delimiter = self.store.hierarchy_delimiter();
        let name = if delimiter != NO_HIERARCHY {
            mailbox.strip_suffix(&delimiter).unwrap_or(mailbox)
        } else {
            mailbox.as_str()
        };
        if name.is_empty() {
            self.framed
                .write_line(&format!("{tag} BAD CREATE expects a mailbox"))
                .await?;
            return Ok(());
        }
        if self.store.create_personal_catalog(&identity, name)? {
            self.framed
                .write_line(&format!("{tag} OK CREATE completed"))
                .await?;
        } else {
            self.framed
                .write_line(&format!("{tag} NO CREATE failed: mailbox exists"))
                .await?;
        }
        Ok(())
    }

    pub(super) async fn cmd_delete(&mut self, tag: &str, args: &[String]) -> Result<()> {
        let Some(identity) = self.require_identity(tag).await? else {
            return Ok(());
        };
        let [mailbox] = args else {
            self.framed
                .write_line(&format!("{tag} BAD DELETE expects a mailbox"))
                .await?;
            return Ok(());
        };
        if self.store.delete_personal_catalog(&identity, mailbox)? {
            if self
                .selected
                .as_ref()
                .is_some_and(|s| s.catalog.name.eq_ignore_ascii_case(mailbox))
            {
                self.selected = None;
            }
            self.framed
                .write_line(&format!("{tag} OK DELETE completed"))
                .await?;
        } else {
            self.framed
                .write_line(&format!("{tag} NO DELETE failed"))
                .await?;
        }
        Ok(())
    }

    pub(super) async fn cmd_subscribe(
        &mut self,
        tag: &str,
        args: &[String],
        subscribe: bool,
    ) -> Result<()> {
        let Some(identity) = self.require_identity(tag).await? else {
            return Ok(());
        };
        let verb = if subscribe { "SUBSCRIBE" } else { "UNSUBSCRIBE" };
        let [mailbox] = args else {
            self.framed
                .write_line(&format!("{tag} BAD {verb} expects a mailbox"))
                .await?;
            return Ok(());
        };
        let done = if subscribe {
            self.store.create_subscription(&identity, mailbox)?
        } else {
            self.store.delete_subscription(&identity, mailbox)?
        };
        if done {
            self.framed
                .write_line(&format!("{tag} OK {verb} completed"))
                .await?;
        } else {
            self.framed
                .write_line(&format!("{tag} NO {verb} failed"))
                .await?;
        }
        Ok(())
    }

    pub(super) async fn cmd_lsub(&mut self, tag: &str, args: &[String]) -> Result<()> {
        let Some(identity) = self.require_identity(tag).await? else {
            return Ok(());
        };
        // reference argument tolerated but unused; the pattern is last
        let Some(pattern) = args.last() else {
            self.framed
                .write_line(&format!("{tag} BAD LSUB expects a pattern"))
                .await?;
            return Ok(());
        };
        let delimiter = self.store.hierarchy_delimiter();
        let atom = delimiter_atom(&delimiter);
        for name in self.store.get_subscriptions(&identity)? {
            if matches_mailbox_glob(&name, pattern, &delimiter) {
                self.framed
                    .write_line(&format!("* LSUB () {atom} \"{name}\""))
                    .await?;
            }
        }
        self.framed
            .write_line(&format!("{tag} OK LSUB completed"))
            .await?;
        Ok(())
    }

    /// Global catalogs first, then the identity's personal ones
    fn listable_catalogs(&self) -> Result<Vec<Catalog>> {
        let mut catalogs = self
            .store
            .get_global_catalogs(self.identity.as_ref(), None)?;
        if let Some(identity) = self.identity.as_ref() {
            catalogs.extend(self.store.get_personal_catalogs(identity, None)?);
        }
        Ok(catalogs)
    }

    pub(super) async fn cmd_list(&mut self, tag: &str, args: &[String]) -> Result<()> {
        if self.require_identity(tag).await?.is_none() {
            return Ok(());
        }
        let Some(pattern) = args.last() else {
            self.framed
                .write_line(&format!("{tag} BAD LIST expects a pattern"))
                .await?;
            return Ok(());
        };
        let delimiter = self.store.hierarchy_delimiter();
        let atom = delimiter_atom(&delimiter);

        // an empty pattern only asks for the hierarchy delimiter
        if pattern.is_empty() {
            self.framed
                .write_line(&format!("* LIST (\\Noselect) {atom} \"\""))
                .await?;
            self.framed
                .write_line(&format!("{tag} OK LIST completed"))
                .await?;
            return Ok(());
        }

        let catalogs = self.listable_catalogs()?;
        let all_names: Vec<String> = catalogs
            .iter()
            .map(|c| c.name.to_ascii_lowercase())
            .collect();

        for catalog in &catalogs {
            if !matches_mailbox_glob(&catalog.name, pattern, &delimiter) {
                continue;
            }
            let mut flags: Vec<&str> = Vec::new();
            if delimiter != NO_HIERARCHY {
                let prefix = format!("{}{}", catalog.name.to_ascii_lowercase(), delimiter);
                if all_names.iter().any(|n| n.starts_with(&prefix)) {
                    flags.push("\\HasChildren");
                } else {
                    flags.push("\\HasNoChildren");
                }
            } else {
                flags.push("\\HasNoChildren");
            }
            if let Some(attr) = special_use(&catalog.name, &delimiter) {
                flags.push(attr);
            }
            self.framed
                .write_line(&format!(
                    "* LIST ({}) {} \"{}\"",
                    flags.join(" "),
                    atom,
                    catalog.name
                ))
                .await?;
        }
        self.framed
            .write_line(&format!("{tag} OK LIST completed"))
            .await?;
        Ok(())
    }

    pub(super) async fn cmd_status(&mut self, tag: &str, args: &[String]) -> Result<()> {
        let Some(identity) = self.require_identity(tag).await? else {
            return Ok(());
        };
        let [mailbox, items] = args else {
            self.framed
                .write_line(&format!("{tag} BAD STATUS expects a mailbox and items"))
                .await?;
            return Ok(());
        };
        let Some(catalog) = self.store.get_catalog_by_name(Some(&identity), mailbox)? else {
            self.framed
                .write_line(&format!("{tag} NO No such mailbox"))
                .await?;
            return Ok(());
        };

        let items = items
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(items);
        let mut parts: Vec<String> = Vec::new();
        for item in items.split_whitespace() {
            match item.to_ascii_uppercase().as_str() {
                "MESSAGES" => parts.push(format!("MESSAGES {}", catalog.message_count)),
                "RECENT" => parts.push("RECENT 0".to_string()),
                "UIDNEXT" => parts.push(format!("UIDNEXT {}", catalog.next_sequence())),
                "UIDVALIDITY" => parts.push(format!(
                    "UIDVALIDITY {}",
                    catalog.created_at.format(UIDVALIDITY_FORMAT)
                )),
                "UNSEEN" => {
                    let seen = self
                        .store
                        .get_message_details(&identity, &catalog.name, 1, None)?
                        .unwrap_or_default()
                        .iter()
                        .filter(|d| d.seen.is_some())
                        .count() as u64;
                    parts.push(format!(
                        "UNSEEN {}",
                        catalog.message_count.saturating_sub(seen)
                    ));
                }
                _ => {
                    self.framed
                        .write_line(&format!("{tag} BAD Unknown STATUS item"))
                        .await?;
                    return Ok(());
                }
            }
        }
        self.framed
            .write_line(&format!(
                "* STATUS \"{}\" ({})",
                catalog.name,
                parts.join(" ")
            ))
            .await?;
        self.framed
            .write_line(&format!("{tag} OK STATUS completed"))
            .await?;
        Ok(())
    }
}
