//! Unified message-store contract
//!
//! Both protocol engines drive the same store abstraction: identities,
//! catalogs (newsgroups/mailboxes), messages, per-identity message details
//! (IMAP flags) and subscriptions. Concrete SQL or mailbox backends live
//! outside this crate; [`MemoryStore`] is the in-process reference
//! implementation used by the test suite and by self-contained embedders.
//!
//! All read operations distinguish "not found" (`Ok(None)`) from "store
//! temporarily unavailable" (`ServerError::StoreUnavailable`); the engines
//! translate the latter to `403` (NNTP) or `BAD` (IMAP) without dropping
//! the connection.

mod memory;

pub use memory::{DetailFlag, MemoryStore};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::headers::HeaderBlock;

/// Sentinel delimiter meaning "the store has no hierarchy"
pub const NO_HIERARCHY: &str = "NIL";

/// Suffix of the synthetic view exposing cancelled messages
pub const DELETED_SUFFIX: &str = ".deleted";

/// Suffix of the synthetic view exposing moderation-pending messages
pub const PENDING_SUFFIX: &str = ".pending";

/// Which synthetic metagroup view a name refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetagroupKind {
    /// `X.deleted`: cancelled links of the base catalog
    Deleted,
    /// `X.pending`: moderation-pending links of the base catalog
    Pending,
}

/// Split a metagroup name into its base catalog and view kind
///
/// Returns `None` for ordinary catalog names.
pub fn metagroup_base(name: &str) -> Option<(&str, MetagroupKind)> {
    if let Some(base) = name.strip_suffix(DELETED_SUFFIX) {
        if !base.is_empty() {
            return Some((base, MetagroupKind::Deleted));
        }
    }
    if let Some(base) = name.strip_suffix(PENDING_SUFFIX) {
        if !base.is_empty() {
            return Some((base, MetagroupKind::Pending));
        }
    }
    None
}

/// Capability flags of an identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityFlags {
    /// May only authenticate from loopback addresses
    pub local_only: bool,
    /// May approve messages in any catalog
    pub can_approve_any: bool,
    /// May issue cancel control messages
    pub can_cancel: bool,
    /// May issue newgroup control messages
    pub can_create_catalogs: bool,
    /// May issue rmgroup control messages
    pub can_delete_catalogs: bool,
    /// May issue checkgroups control messages
    pub can_check_catalogs: bool,
    /// Trusted injector: Injection-Date/Xref are taken as supplied
    pub can_inject: bool,
}

/// An authenticated principal
///
/// Read-mostly: created by provisioning, mutated only by login bookkeeping.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Unique id
    pub id: i64,
    /// Unique username
    pub username: String,
    /// base64(SHA-512(salt || cleartext))
    pub password_hash: String,
    /// Salt prepended to the cleartext before hashing
    pub password_salt: String,
    /// Capability flags
    pub flags: IdentityFlags,
    /// Names of the catalogs this identity moderates
    pub moderates: Vec<String>,
    /// Last successful login
    pub last_login: Option<DateTime<Utc>>,
}

impl Identity {
    /// Whether this identity moderates a catalog (case-insensitive)
    pub fn moderates(&self, catalog: &str) -> bool {
        self.moderates
            .iter()
            .any(|m| m.eq_ignore_ascii_case(catalog))
    }

    /// Whether this identity may enumerate a metagroup view of `base`
    ///
    /// `.deleted` needs can-cancel or moderation of the base catalog;
    /// `.pending` needs can-approve-any or moderation of the base catalog.
    pub fn can_enumerate_metagroup(&self, kind: MetagroupKind, base: &str) -> bool {
        match kind {
            MetagroupKind::Deleted => self.flags.can_cancel || self.moderates(base),
            MetagroupKind::Pending => self.flags.can_approve_any || self.moderates(base),
        }
    }

    /// Mailbox form used in Approved: headers
    pub fn mailbox(&self, path_host: &str) -> String {
        format!("{}@{}", self.username, path_host)
    }
}

/// A newsgroup or mailbox
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Unique id
    pub id: i64,
    /// Hierarchical name (delimited by the store-wide delimiter)
    pub name: String,
    /// Creation instant; source of the IMAP UIDVALIDITY value
    pub created_at: DateTime<Utc>,
    /// Count of observable messages
    pub message_count: u64,
    /// Smallest active sequence number, None when empty
    pub low_watermark: Option<u64>,
    /// Largest sequence number ever assigned, None when never posted to
    pub high_watermark: Option<u64>,
    /// Whether postings start out pending until approved
    pub moderated: bool,
    /// Whether local POST is refused outright
    pub deny_local_posting: bool,
    /// Owning identity of a personal catalog; None for global catalogs
    pub owner: Option<i64>,
    /// Human-readable description (LIST NEWSGROUPS)
    pub description: Option<String>,
}

impl Catalog {
    /// The next sequence number a new message would receive
    pub fn next_sequence(&self) -> u64 {
        self.high_watermark.unwrap_or(0) + 1
    }

    /// LIST ACTIVE status character: m(oderated), n(o posting), y(es)
    pub fn posting_status(&self) -> char {
        if self.deny_local_posting {
            'n'
        } else if self.moderated {
            'm'
        } else {
            'y'
        }
    }
}

/// A stored message, viewed through one catalog link
///
/// The message text is immutable once stored; `sequence`, `cancelled` and
/// `pending` belong to the (catalog, message) link it was fetched through.
#[derive(Debug, Clone)]
pub struct Message {
    /// Globally unique RFC 5536 message-id, `<local@domain>`
    pub id: String,
    /// Sequence number in the catalog the message was fetched through
    pub sequence: u64,
    /// Link flag: cancelled messages are hidden outside `.deleted`
    pub cancelled: bool,
    /// Link flag: pending messages are hidden outside `.pending`
    pub pending: bool,
    /// Parsed header block (ordered, raw lines preserved)
    pub headers: HeaderBlock,
    /// CRLF-separated body
    pub body: String,
}

impl Message {
    /// Octet size of the full article (headers, blank line, body)
    pub fn size(&self) -> usize {
        self.headers.raw_block().len() + 4 + self.body.len()
    }

    /// Body line count
    pub fn line_count(&self) -> usize {
        self.body.lines().count()
    }

    /// Full article text: headers, blank line, body
    pub fn full_text(&self) -> String {
        format!("{}\r\n\r\n{}", self.headers.raw_block(), self.body)
    }

    /// Whether the link is observable outside metagroup views
    pub fn observable(&self) -> bool {
        !self.cancelled && !self.pending
    }
}

/// Per-(identity, catalog, message) flag timestamps
///
/// Implements the IMAP flags `\Answered \Deleted \Flagged \Seen`; a flag is
/// set iff its timestamp is present.
#[derive(Debug, Clone, Default)]
pub struct MessageDetail {
    /// Identity the detail belongs to
    pub identity_id: i64,
    /// Message the detail belongs to
    pub message_id: String,
    /// Sequence number of the message link in the catalog
    pub sequence: u64,
    /// \Answered
    pub answered: Option<DateTime<Utc>>,
    /// \Deleted
    pub deleted: Option<DateTime<Utc>>,
    /// \Flagged
    pub important: Option<DateTime<Utc>>,
    /// \Seen
    pub seen: Option<DateTime<Utc>>,
}

impl MessageDetail {
    /// The set IMAP flag tokens, in fixed order
    pub fn imap_flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.answered.is_some() {
            flags.push("\\Answered");
        }
        if self.deleted.is_some() {
            flags.push("\\Deleted");
        }
        if self.important.is_some() {
            flags.push("\\Flagged");
        }
        if self.seen.is_some() {
            flags.push("\\Seen");
        }
        flags
    }
}

/// Store operations the engines consume
///
/// Implementations provide their own internal synchronization: engines call
/// these between suspension points from many connection tasks. Per-catalog
/// write serialization keeps sequence numbers monotonic; readers observe at
/// least the effects of previously completed writes from the same
/// connection.
pub trait Store: Send + Sync {
    /// Idempotent provisioning (e.g. create the personal INBOX)
    fn ensure(&self, identity: &Identity) -> Result<()>;

    /// Authenticate by username and cleartext password
    fn get_identity_by_clear_auth(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Identity>>;

    /// Record a successful login
    fn record_login(&self, identity_id: i64) -> Result<()>;

    /// Look up a catalog by name, honouring ownership and metagroup rules
    ///
    /// `identity == None` is an anonymous reader: personal catalogs and
    /// metagroups are not visible.
    fn get_catalog_by_name(
        &self,
        identity: Option<&Identity>,
        name: &str,
    ) -> Result<Option<Catalog>>;

    /// Enumerate global catalogs, optionally below a parent prefix
    fn get_global_catalogs(
        &self,
        identity: Option<&Identity>,
        parent: Option<&str>,
    ) -> Result<Vec<Catalog>>;

    /// Enumerate the identity's personal catalogs
    fn get_personal_catalogs(
        &self,
        identity: &Identity,
        parent: Option<&str>,
    ) -> Result<Vec<Catalog>>;

    /// Create a personal catalog; false if the name is taken
    fn create_personal_catalog(&self, identity: &Identity, name: &str) -> Result<bool>;

    /// Delete a personal catalog; false if absent or not owned
    fn delete_personal_catalog(&self, identity: &Identity, name: &str) -> Result<bool>;

    /// Messages of a catalog in an inclusive sequence range
    ///
    /// `to == None` means an open upper bound. `Ok(None)` means no such
    /// catalog (or a metagroup the identity may not enumerate). Results are
    /// ordered by ascending sequence number.
    fn get_messages(
        &self,
        identity: Option<&Identity>,
        catalog: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Option<Vec<Message>>>;

    /// Look up one message by its globally unique message-id
    fn get_message_by_id(
        &self,
        identity: Option<&Identity>,
        message_id: &str,
    ) -> Result<Option<Message>>;

    /// Flag details of the identity for messages in a sequence range
    fn get_message_details(
        &self,
        identity: &Identity,
        catalog: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Option<Vec<MessageDetail>>>;

    /// Subscribe; false if already subscribed or the catalog is unknown
    fn create_subscription(&self, identity: &Identity, catalog: &str) -> Result<bool>;

    /// Unsubscribe; false if not subscribed
    fn delete_subscription(&self, identity: &Identity, catalog: &str) -> Result<bool>;

    /// Subscribed catalog names
    fn get_subscriptions(&self, identity: &Identity) -> Result<Vec<String>>;

    /// The store-wide hierarchy delimiter, or `"NIL"` for none
    fn hierarchy_delimiter(&self) -> String;

    /// Store a message and link it into each existing target catalog
    ///
    /// Unknown target names are skipped. Each link gets the catalog's next
    /// sequence number; the link starts pending when the catalog is
    /// moderated and the identity cannot approve there. The returned
    /// message carries the first created link (sequence 0 when no catalog
    /// accepted it).
    fn save_message(
        &self,
        identity: &Identity,
        catalogs: &[String],
        headers: &HeaderBlock,
        body: &str,
    ) -> Result<Message>;

    /// Mark a (catalog, message) link cancelled; false if absent
    fn cancel_message(&self, identity: &Identity, message_id: &str, catalog: &str) -> Result<bool>;

    /// Clear the pending flag and stamp the Approved header
    fn set_approved(
        &self,
        identity: &Identity,
        message_id: &str,
        catalog: &str,
        approver: &str,
    ) -> Result<bool>;

    /// Create a global catalog (newgroup side effect); false if it exists
    fn create_catalog(&self, identity: &Identity, name: &str) -> Result<bool>;

    /// Delete a global catalog (rmgroup side effect); false if absent
    fn delete_catalog(&self, identity: &Identity, name: &str) -> Result<bool>;
}
