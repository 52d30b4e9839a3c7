//! In-memory reference store
//!
//! Implements the full [`Store`] contract behind a single mutex: good
//! enough for tests, demos and small self-contained deployments. Sequence
//! numbers are assigned per catalog under the lock, so they are monotonic
//! and never reused even after cancellation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::auth;
use crate::error::{Result, ServerError};
use crate::headers::HeaderBlock;

use super::{
    Catalog, Identity, IdentityFlags, Message, MessageDetail, MetagroupKind, Store, metagroup_base,
};

/// Which links a message query should surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkFilter {
    /// `!cancelled && !pending`
    Observable,
    /// `cancelled == true` (the `.deleted` view)
    Cancelled,
    /// `pending == true` (the `.pending` view)
    Pending,
}

impl LinkFilter {
    fn accepts(self, link: &Link) -> bool {
        match self {
            LinkFilter::Observable => !link.cancelled && !link.pending,
            LinkFilter::Cancelled => link.cancelled,
            LinkFilter::Pending => link.pending,
        }
    }
}

/// One (catalog, message) link
#[derive(Debug, Clone)]
struct Link {
    message_id: String,
    cancelled: bool,
    pending: bool,
}

/// Immutable stored message text
#[derive(Debug, Clone)]
struct StoredText {
    headers: HeaderBlock,
    body: String,
}

#[derive(Debug, Clone)]
struct CatalogRecord {
    id: i64,
    name: String,
    created_at: DateTime<Utc>,
    moderated: bool,
    deny_local_posting: bool,
    owner: Option<i64>,
    description: Option<String>,
    high_watermark: Option<u64>,
    links: BTreeMap<u64, Link>,
}

impl CatalogRecord {
    fn new(id: i64, name: &str, owner: Option<i64>) -> Self {
        Self {
            id,
            name: name.to_string(),
            created_at: Utc::now(),
            moderated: false,
            deny_local_posting: false,
            owner,
            description: None,
            high_watermark: None,
            links: BTreeMap::new(),
        }
    }

    /// Snapshot the record as the public catalog type
    fn snapshot(&self, filter: LinkFilter, name_override: Option<&str>) -> Catalog {
        let visible: Vec<u64> = self
            .links
            .iter()
            .filter(|(_, l)| filter.accepts(l))
            .map(|(seq, _)| *seq)
            .collect();
        Catalog {
            id: self.id,
            name: name_override.unwrap_or(&self.name).to_string(),
            created_at: self.created_at,
            message_count: visible.len() as u64,
            low_watermark: visible.first().copied(),
            high_watermark: self.high_watermark,
            moderated: self.moderated,
            deny_local_posting: self.deny_local_posting,
            owner: self.owner,
            description: self.description.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    next_identity_id: i64,
    next_catalog_id: i64,
    identities: HashMap<i64, Identity>,
    username_index: HashMap<String, i64>,
    globals: BTreeMap<String, CatalogRecord>,
    personals: HashMap<i64, BTreeMap<String, CatalogRecord>>,
    messages: HashMap<String, StoredText>,
    details: HashMap<(i64, String, String), MessageDetail>,
    subscriptions: HashMap<i64, BTreeMap<String, String>>,
}

/// Detail flag selector for the provisioning helper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailFlag {
    /// \Answered
    Answered,
    /// \Deleted
    Deleted,
    /// \Flagged
    Important,
    /// \Seen
    Seen,
}

/// In-memory [`Store`] implementation
pub struct MemoryStore {
    delimiter: String,
    available: AtomicBool,
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store with the conventional NNTP `.` hierarchy delimiter
    pub fn new() -> Self {
        Self::with_delimiter(".")
    }

    /// Create a store with an explicit hierarchy delimiter
    ///
    /// Pass [`super::NO_HIERARCHY`] for a flat namespace.
    pub fn with_delimiter(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            available: AtomicBool::new(true),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Simulate backend outage: while unavailable every operation returns
    /// [`ServerError::StoreUnavailable`]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Provision an identity with a cleartext password
    pub fn add_identity(
        &self,
        username: &str,
        password: &str,
        flags: IdentityFlags,
    ) -> Identity {
        let salt = auth::generate_salt();
        let identity = {
            let mut inner = self.lock();
            inner.next_identity_id += 1;
            let identity = Identity {
                id: inner.next_identity_id,
                username: username.to_string(),
                password_hash: auth::hash_password(&salt, password),
                password_salt: salt,
                flags,
                moderates: Vec::new(),
                last_login: None,
            };
            inner
                .username_index
                .insert(username.to_ascii_lowercase(), identity.id);
            inner.identities.insert(identity.id, identity.clone());
            identity
        };
        debug!(username, id = identity.id, "provisioned identity");
        identity
    }

    /// Make an identity a moderator of a catalog
    pub fn add_moderator(&self, username: &str, catalog: &str) {
        let mut inner = self.lock();
        let Some(id) = inner
            .username_index
            .get(&username.to_ascii_lowercase())
            .copied()
        else {
            return;
        };
        if let Some(identity) = inner.identities.get_mut(&id) {
            identity.moderates.push(catalog.to_string());
        }
    }

    /// Provision a global catalog
    pub fn add_catalog(
        &self,
        name: &str,
        moderated: bool,
        deny_local_posting: bool,
        description: Option<&str>,
    ) {
        let mut inner = self.lock();
        inner.next_catalog_id += 1;
        let mut record = CatalogRecord::new(inner.next_catalog_id, name, None);
        record.moderated = moderated;
        record.deny_local_posting = deny_local_posting;
        record.description = description.map(str::to_string);
        inner.globals.insert(name.to_ascii_lowercase(), record);
    }

    /// Set one flag timestamp on a message detail (test/provisioning aid)
    pub fn touch_flag(
        &self,
        identity: &Identity,
        catalog: &str,
        sequence: u64,
        flag: DetailFlag,
    ) {
        let mut inner = self.lock();
        let Some(record) = lookup_record(&inner, Some(identity), catalog) else {
            return;
        };
        let Some(link) = record.links.get(&sequence) else {
            return;
        };
        let message_id = link.message_id.clone();
        let key = (
            identity.id,
            catalog.to_ascii_lowercase(),
            message_id.clone(),
        );
        let detail = inner.details.entry(key).or_insert_with(|| MessageDetail {
            identity_id: identity.id,
            message_id,
            sequence,
            ..Default::default()
        });
        let now = Some(Utc::now());
        match flag {
            DetailFlag::Answered => detail.answered = now,
            DetailFlag::Deleted => detail.deleted = now,
            DetailFlag::Important => detail.important = now,
            DetailFlag::Seen => detail.seen = now,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Mutex poisoning only happens when a panicking thread held the
        // lock; recover the data rather than cascading the panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServerError::StoreUnavailable)
        }
    }

    /// Resolve a catalog name to its record, filter and presented name
    fn resolve<'a>(
        inner: &'a Inner,
        identity: Option<&Identity>,
        name: &str,
    ) -> Option<(&'a CatalogRecord, LinkFilter, String)> {
        if let Some((base, kind)) = metagroup_base(name) {
            let identity = identity?;
            if !identity.can_enumerate_metagroup(kind, base) {
                return None;
            }
            let record = lookup_record(inner, Some(identity), base)?;
            let filter = match kind {
                MetagroupKind::Deleted => LinkFilter::Cancelled,
                MetagroupKind::Pending => LinkFilter::Pending,
            };
            let suffix = match kind {
                MetagroupKind::Deleted => super::DELETED_SUFFIX,
                MetagroupKind::Pending => super::PENDING_SUFFIX,
            };
            let presented = format!("{}{}", record.name, suffix);
            return Some((record, filter, presented));
        }
        let record = lookup_record(inner, identity, name)?;
        let presented = record.name.clone();
        Some((record, LinkFilter::Observable, presented))
    }

    fn message_from_link(inner: &Inner, sequence: u64, link: &Link) -> Option<Message> {
        let text = inner.messages.get(&link.message_id)?;
        Some(Message {
            id: link.message_id.clone(),
            sequence,
            cancelled: link.cancelled,
            pending: link.pending,
            headers: text.headers.clone(),
            body: text.body.clone(),
        })
    }
}

/// Personal catalogs shadow globals for their owner; globals come second
fn lookup_record<'a>(
    inner: &'a Inner,
    identity: Option<&Identity>,
    name: &str,
) -> Option<&'a CatalogRecord> {
    let key = name.to_ascii_lowercase();
    if let Some(identity) = identity
        && let Some(record) = inner.personals.get(&identity.id).and_then(|m| m.get(&key))
    {
        return Some(record);
    }
    inner.globals.get(&key)
}

fn lookup_record_mut<'a>(
    inner: &'a mut Inner,
    identity: Option<&Identity>,
    name: &str,
) -> Option<&'a mut CatalogRecord> {
    let key = name.to_ascii_lowercase();
    if let Some(identity) = identity
        && inner
            .personals
            .get(&identity.id)
            .is_some_and(|m| m.contains_key(&key))
    {
        return inner
            .personals
            .get_mut(&identity.id)
            .and_then(|m| m.get_mut(&key));
    }
    inner.globals.get_mut(&key)
}

/// Filter a listing by an optional parent prefix
fn under_parent(name: &str, parent: Option<&str>, delimiter: &str) -> bool {
    match parent {
        None => true,
        Some(parent) => {
            let mut prefix = parent.to_ascii_lowercase();
            if delimiter != super::NO_HIERARCHY {
                prefix.push_str(delimiter);
            }
            name.to_ascii_lowercase().starts_with(&prefix)
        }
    }
}

impl Store for MemoryStore {
    fn ensure(&self, identity: &Identity) -> Result<()> {
        self.check_available()?;
        let mut inner = self.lock();
        inner.next_catalog_id += 1;
        let id = inner.next_catalog_id;
        let personal = inner.personals.entry(identity.id).or_default();
        personal
            .entry("inbox".to_string())
            .or_insert_with(|| CatalogRecord::new(id, "INBOX", Some(identity.id)));
        Ok(())
    }

    fn get_identity_by_clear_auth(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Identity>> {
        self.check_available()?;
        let inner = self.lock();
        let Some(&id) = inner.username_index.get(&username.to_ascii_lowercase()) else {
            return Ok(None);
        };
        let Some(identity) = inner.identities.get(&id) else {
            return Ok(None);
        };
        if auth::verify_password(&identity.password_salt, &identity.password_hash, password) {
            Ok(Some(identity.clone()))
        } else {
            Ok(None)
        }
    }

    fn record_login(&self, identity_id: i64) -> Result<()> {
        self.check_available()?;
        let mut inner = self.lock();
        if let Some(identity) = inner.identities.get_mut(&identity_id) {
            identity.last_login = Some(Utc::now());
        }
        Ok(())
    }

    fn get_catalog_by_name(
        &self,
        identity: Option<&Identity>,
        name: &str,
    ) -> Result<Option<Catalog>> {
        self.check_available()?;
        let inner = self.lock();
        Ok(Self::resolve(&inner, identity, name)
            .map(|(record, filter, presented)| record.snapshot(filter, Some(&presented))))
    }

    fn get_global_catalogs(
        &self,
        _identity: Option<&Identity>,
        parent: Option<&str>,
    ) -> Result<Vec<Catalog>> {
        self.check_available()?;
        let inner = self.lock();
        Ok(inner
            .globals
            .values()
            .filter(|r| under_parent(&r.name, parent, &self.delimiter))
            .map(|r| r.snapshot(LinkFilter::Observable, None))
            .collect())
    }

    fn get_personal_catalogs(
        &self,
        identity: &Identity,
        parent: Option<&str>,
    ) -> Result<Vec<Catalog>> {
        self.check_available()?;
        let inner = self.lock();
        Ok(inner
            .personals
            .get(&identity.id)
            .map(|personal| {
                personal
                    .values()
                    .filter(|r| under_parent(&r.name, parent, &self.delimiter))
                    .map(|r| r.snapshot(LinkFilter::Observable, None))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn create_personal_catalog(&self, identity: &Identity, name: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        let key = name.to_ascii_lowercase();
        // catalog names are unique among everything the identity observes
        if inner.globals.contains_key(&key) {
            return Ok(false);
        }
        inner.next_catalog_id += 1;
        let id = inner.next_catalog_id;
        let personal = inner.personals.entry(identity.id).or_default();
        if personal.contains_key(&key) {
            return Ok(false);
        }
        personal.insert(key, CatalogRecord::new(id, name, Some(identity.id)));
        Ok(true)
    }

    fn delete_personal_catalog(&self, identity: &Identity, name: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        let key = name.to_ascii_lowercase();
        Ok(inner
            .personals
            .get_mut(&identity.id)
            .and_then(|personal| personal.remove(&key))
            .is_some())
    }

    fn get_messages(
        &self,
        identity: Option<&Identity>,
        catalog: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Option<Vec<Message>>> {
        self.check_available()?;
        let inner = self.lock();
        let Some((record, filter, _)) = Self::resolve(&inner, identity, catalog) else {
            return Ok(None);
        };
        let upper = to.unwrap_or(u64::MAX);
        if upper < from {
            return Ok(Some(Vec::new()));
        }
        let messages = record
            .links
            .range(from..=upper)
            .filter(|(_, link)| filter.accepts(link))
            .filter_map(|(seq, link)| Self::message_from_link(&inner, *seq, link))
            .collect();
        Ok(Some(messages))
    }

    fn get_message_by_id(
        &self,
        identity: Option<&Identity>,
        message_id: &str,
    ) -> Result<Option<Message>> {
        self.check_available()?;
        let inner = self.lock();
        if !inner.messages.contains_key(message_id) {
            return Ok(None);
        }
        let personal = identity
            .and_then(|i| inner.personals.get(&i.id))
            .into_iter()
            .flat_map(|m| m.values());
        for record in inner.globals.values().chain(personal) {
            for (seq, link) in &record.links {
                if link.message_id == message_id && LinkFilter::Observable.accepts(link) {
                    return Ok(Self::message_from_link(&inner, *seq, link));
                }
            }
        }
        Ok(None)
    }

    fn get_message_details(
        &self,
        identity: &Identity,
        catalog: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Option<Vec<MessageDetail>>> {
        self.check_available()?;
        let inner = self.lock();
        let Some((record, filter, _)) = Self::resolve(&inner, Some(identity), catalog) else {
            return Ok(None);
        };
        let key_catalog = catalog.to_ascii_lowercase();
        let upper = to.unwrap_or(u64::MAX);
        if upper < from {
            return Ok(Some(Vec::new()));
        }
        let details = record
            .links
            .range(from..=upper)
            .filter(|(_, link)| filter.accepts(link))
            .filter_map(|(seq, link)| {
                let key = (identity.id, key_catalog.clone(), link.message_id.clone());
                inner.details.get(&key).map(|d| {
                    let mut detail = d.clone();
                    detail.sequence = *seq;
                    detail
                })
            })
            .collect();
        Ok(Some(details))
    }

    fn create_subscription(&self, identity: &Identity, catalog: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        if lookup_record(&inner, Some(identity), catalog).is_none() {
            return Ok(false);
        }
        let subs = inner.subscriptions.entry(identity.id).or_default();
        Ok(subs
            .insert(catalog.to_ascii_lowercase(), catalog.to_string())
            .is_none())
    }

    fn delete_subscription(&self, identity: &Identity, catalog: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        Ok(inner
            .subscriptions
            .get_mut(&identity.id)
            .and_then(|subs| subs.remove(&catalog.to_ascii_lowercase()))
            .is_some())
    }

    fn get_subscriptions(&self, identity: &Identity) -> Result<Vec<String>> {
        self.check_available()?;
        let inner = self.lock();
        Ok(inner
            .subscriptions
            .get(&identity.id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn hierarchy_delimiter(&self) -> String {
        self.delimiter.clone()
    }

    fn save_message(
        &self,
        identity: &Identity,
        catalogs: &[String],
        headers: &HeaderBlock,
        body: &str,
    ) -> Result<Message> {
        self.check_available()?;
        let Some(message_id) = headers.get("Message-ID").map(str::to_string) else {
            return Err(ServerError::MalformedMessage(
                "message has no Message-ID".to_string(),
            ));
        };

        let mut inner = self.lock();
        inner
            .messages
            .entry(message_id.clone())
            .or_insert_with(|| StoredText {
                headers: headers.clone(),
                body: body.to_string(),
            });

        let mut first_link: Option<(u64, bool)> = None;
        for name in catalogs {
            if metagroup_base(name).is_some() {
                continue;
            }
            let can_approve = identity.flags.can_approve_any
                || identity.flags.can_inject
                || identity.moderates(name);
            let Some(record) = lookup_record_mut(&mut inner, Some(identity), name) else {
                debug!(catalog = %name, "skipping unknown target catalog");
                continue;
            };
            let sequence = record.high_watermark.unwrap_or(0) + 1;
            let pending = record.moderated && !can_approve;
            record.links.insert(
                sequence,
                Link {
                    message_id: message_id.clone(),
                    cancelled: false,
                    pending,
                },
            );
            record.high_watermark = Some(sequence);
            if first_link.is_none() {
                first_link = Some((sequence, pending));
            }
        }

        let (sequence, pending) = first_link.unwrap_or((0, false));
        Ok(Message {
            id: message_id,
            sequence,
            cancelled: false,
            pending,
            headers: headers.clone(),
            body: body.to_string(),
        })
    }

    fn cancel_message(&self, identity: &Identity, message_id: &str, catalog: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        let Some(record) = lookup_record_mut(&mut inner, Some(identity), catalog) else {
            return Ok(false);
        };
        for link in record.links.values_mut() {
            if link.message_id == message_id {
                link.cancelled = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn set_approved(
        &self,
        identity: &Identity,
        message_id: &str,
        catalog: &str,
        approver: &str,
    ) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        let Some(record) = lookup_record_mut(&mut inner, Some(identity), catalog) else {
            return Ok(false);
        };
        let mut found = false;
        for link in record.links.values_mut() {
            if link.message_id == message_id {
                link.pending = false;
                found = true;
            }
        }
        if found && let Some(text) = inner.messages.get_mut(message_id) {
            text.headers.change("Approved", approver);
        }
        Ok(found)
    }

    fn create_catalog(&self, _identity: &Identity, name: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        let key = name.to_ascii_lowercase();
        if inner.globals.contains_key(&key) {
            return Ok(false);
        }
        inner.next_catalog_id += 1;
        let record = CatalogRecord::new(inner.next_catalog_id, name, None);
        inner.globals.insert(key, record);
        Ok(true)
    }

    fn delete_catalog(&self, _identity: &Identity, name: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        Ok(inner.globals.remove(&name.to_ascii_lowercase()).is_some())
    }
}
