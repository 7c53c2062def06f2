//! Remote collection abstraction.
//!
//! This module provides:
//! - `Remote` trait for the listing/read/write primitives of one collection
//! - `RemoteState`, the synchronized identity → version tag map
//! - batch helpers (`fetch_all`, `write_all`) with bounded concurrency

pub mod carddav;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::contact::Contact;
use crate::error::{Result, SyncError};

/// Opaque server-supplied entity tag.
pub type VersionTag = String;

/// Ordered copy of a version map, as persisted between commands.
pub type VersionMap = BTreeMap<String, Option<VersionTag>>;

/// Last observed version tag per identity.
///
/// An identity present with `None` is known to exist remotely but the server
/// never told us its version. Tags are only ever stored from server responses.
#[derive(Debug, Default)]
pub struct RemoteState {
    versions: Mutex<HashMap<String, Option<VersionTag>>>,
}

impl RemoteState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a listing. With `clear`, identities missing from the listing are
    /// forgotten.
    pub async fn apply_listing(
        &self,
        entries: impl IntoIterator<Item = (String, Option<VersionTag>)>,
        clear: bool,
    ) {
        let mut versions = self.versions.lock().await;
        if clear {
            versions.clear();
        }
        versions.extend(entries);
    }

    /// Record the tag observed on a fetch or write response.
    pub async fn record(&self, identity: &str, tag: Option<VersionTag>) {
        self.versions.lock().await.insert(identity.to_string(), tag);
    }

    pub async fn version(&self, identity: &str) -> Option<VersionTag> {
        self.versions.lock().await.get(identity).cloned().flatten()
    }

    pub async fn knows(&self, identity: &str) -> bool {
        self.versions.lock().await.contains_key(identity)
    }

    pub async fn len(&self) -> usize {
        self.versions.lock().await.len()
    }

    pub async fn snapshot(&self) -> VersionMap {
        self.versions
            .lock()
            .await
            .iter()
            .map(|(identity, tag)| (identity.clone(), tag.clone()))
            .collect()
    }
}

/// Outcome of a batch fetch. Failed identities are omitted from `contacts`.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub contacts: Vec<Contact>,
    pub failures: Vec<SyncError>,
}

/// Outcome of a batch write.
#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: Vec<String>,
    pub failures: Vec<SyncError>,
}

impl WriteReport {
    pub fn conflicts(&self) -> impl Iterator<Item = &SyncError> {
        self.failures.iter().filter(|err| err.is_conflict())
    }
}

/// Trait for remote collection implementations
#[allow(async_fn_in_trait)]
pub trait Remote {
    /// List the collection and refresh the version map. With `clear`, the map
    /// is replaced; otherwise the listing is merged into it.
    async fn list_identities(&self, clear: bool) -> Result<BTreeSet<String>>;

    /// Fetch and decode one contact, returning the raw payload as well.
    async fn fetch(&self, identity: &str) -> Result<(Contact, Vec<u8>)>;

    /// Write one contact. With `require_match`, the last known version tag is
    /// sent as a precondition and a missing tag is a conflict.
    async fn write(&self, contact: &Contact, require_match: bool) -> Result<()>;

    /// Version map shared by every operation on this collection.
    fn state(&self) -> &RemoteState;

    /// Whether the identity has been seen on the server.
    async fn knows(&self, identity: &str) -> bool {
        self.state().knows(identity).await
    }

    /// Maximum number of simultaneous requests.
    fn concurrency(&self) -> usize;

    async fn fetch_all(&self, identities: &[String], progress: &ProgressBar) -> FetchReport {
        let results: Vec<(String, Result<(Contact, Vec<u8>)>)> =
            stream::iter(identities.iter().cloned())
                .map(|identity| async move {
                    let result = self.fetch(&identity).await;
                    progress.inc(1);
                    (identity, result)
                })
                .buffer_unordered(self.concurrency().max(1))
                .collect()
                .await;

        let mut report = FetchReport::default();
        for (identity, result) in results {
            match result {
                Ok((contact, _)) => report.contacts.push(contact),
                Err(err) => {
                    warn!(identity = %identity, error = %err, "fetch failed; contact omitted");
                    report.failures.push(err);
                }
            }
        }
        report.contacts.sort_by(|a, b| a.uid.cmp(&b.uid));
        debug!(
            fetched = report.contacts.len(),
            failed = report.failures.len(),
            "batch fetch finished"
        );
        report
    }

    async fn write_all(
        &self,
        contacts: &[Contact],
        require_match: bool,
        progress: &ProgressBar,
    ) -> WriteReport {
        let results: Vec<(String, Result<()>)> = stream::iter(contacts.iter())
            .map(|contact| async move {
                let result = self.write(contact, require_match).await;
                progress.inc(1);
                (contact.uid.clone(), result)
            })
            .buffer_unordered(self.concurrency().max(1))
            .collect()
            .await;

        let mut report = WriteReport::default();
        for (identity, result) in results {
            match result {
                Ok(()) => report.written.push(identity),
                Err(err) => {
                    warn!(identity = %identity, error = %err, "write failed");
                    report.failures.push(err);
                }
            }
        }
        report.written.sort();
        report
    }
}
