//! Pipeline driving one roster sync.
//!
//! This module sequences the download of the server baseline, the roster
//! merge and the upload, stopping at two operator checkpoints in between.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::contact::{Contact, ContactSet};
use crate::error::SyncError;
use crate::merge::{match_key, merge};
use crate::photo::{self, PhotoSource};
use crate::remote::Remote;
use crate::roster::RosterSource;
use crate::vdir::ContactStore;

/// Where the pipeline stops for the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewPoint {
    /// After the server contents were written to the staging location.
    Baseline,
    /// After the roster was merged into the staging location.
    Merged,
}

impl ReviewPoint {
    pub fn title(&self) -> &'static str {
        match self {
            ReviewPoint::Baseline => "Download completed",
            ReviewPoint::Merged => "Merge completed",
        }
    }

    fn prompt(&self) -> &'static str {
        match self {
            ReviewPoint::Baseline => "Baseline reviewed. Merge the roster now?",
            ReviewPoint::Merged => "Staged contacts reviewed. Upload them now?",
        }
    }
}

/// Counts and per-identity failures of one run.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Identities in the last listing.
    pub listed: usize,
    pub downloaded: usize,
    pub roster_records: usize,
    pub photos_added: usize,
    pub updated: usize,
    pub created: usize,
    pub unchanged: usize,
    pub uploaded: usize,
    /// Staged contacts identical to the downloaded baseline.
    pub skipped: usize,
    pub failures: Vec<SyncError>,
    /// Set when the operator declined to continue.
    pub aborted_at: Option<ReviewPoint>,
}

impl SyncReport {
    pub fn conflicts(&self) -> usize {
        self.failures.iter().filter(|err| err.is_conflict()).count()
    }

    pub fn print_summary(&self, heading: &str) {
        println!();
        println!("{}:", heading);
        println!("  Listed:     {} contact(s)", self.listed);
        println!("  Downloaded: {} contact(s)", self.downloaded);
        if self.roster_records > 0 {
            println!("  Roster:     {} record(s)", self.roster_records);
            println!("  Photos:     {} added", self.photos_added);
            println!(
                "  Merged:     {} updated, {} new, {} unchanged",
                self.updated, self.created, self.unchanged
            );
        }
        if self.uploaded > 0 || self.skipped > 0 {
            println!("  Uploaded:   {} contact(s)", self.uploaded);
            println!("  Skipped:    {} unchanged contact(s)", self.skipped);
        }

        if !self.failures.is_empty() {
            println!("  Errors:     {} error(s)", self.failures.len());
            for err in &self.failures {
                eprintln!("    - [{}] {}", err.kind(), err);
            }
            if self.conflicts() > 0 {
                eprintln!(
                    "  Conflicting contacts were not uploaded. \
                     Re-download and merge again before retrying."
                );
            }
        }
    }
}

/// Operator confirmation between phases.
pub trait Checkpoint {
    /// `false` stops the pipeline before the next phase.
    fn confirm(&mut self, point: ReviewPoint, report: &SyncReport) -> Result<bool>;
}

/// Prints the summary and asks on the terminal.
pub struct ConsoleCheckpoint {
    staging_dir: PathBuf,
}

impl ConsoleCheckpoint {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }
}

impl Checkpoint for ConsoleCheckpoint {
    fn confirm(&mut self, point: ReviewPoint, report: &SyncReport) -> Result<bool> {
        report.print_summary(point.title());
        println!();
        println!(
            "Review the contacts in {} (edit or delete files as needed).",
            self.staging_dir.display()
        );
        let confirmed = Confirm::new()
            .with_prompt(point.prompt())
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        Ok(confirmed)
    }
}

/// Drives download, merge and upload against one remote collection.
pub struct SyncOrchestrator<'a, R, S, C> {
    remote: &'a R,
    store: &'a mut S,
    checkpoint: &'a mut C,
    photo_sources: Vec<Box<dyn PhotoSource>>,
    phone_region: String,
    photo_limit: usize,
    show_progress: bool,
    /// Contents downloaded by this run, used to skip unchanged uploads.
    baseline: Option<ContactSet>,
}

impl<'a, R, S, C> SyncOrchestrator<'a, R, S, C>
where
    R: Remote,
    S: ContactStore,
    C: Checkpoint,
{
    pub fn new(remote: &'a R, store: &'a mut S, checkpoint: &'a mut C) -> Self {
        Self {
            remote,
            store,
            checkpoint,
            photo_sources: Vec::new(),
            phone_region: "DE".to_string(),
            photo_limit: 5,
            show_progress: false,
            baseline: None,
        }
    }

    pub fn with_photos(
        mut self,
        sources: Vec<Box<dyn PhotoSource>>,
        phone_region: impl Into<String>,
        limit: usize,
    ) -> Self {
        self.photo_sources = sources;
        self.phone_region = phone_region.into();
        self.photo_limit = limit;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Full pipeline with both checkpoints.
    pub async fn run<T: RosterSource>(&mut self, roster: &T) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        println!("Downloading contacts from remote...");
        self.download_baseline(&mut report).await?;
        if !self.checkpoint.confirm(ReviewPoint::Baseline, &report)? {
            info!("stopped after download");
            report.aborted_at = Some(ReviewPoint::Baseline);
            return Ok(report);
        }

        println!("Merging roster...");
        self.merge_roster(roster, &mut report).await?;
        if !self.checkpoint.confirm(ReviewPoint::Merged, &report)? {
            info!("stopped before upload");
            report.aborted_at = Some(ReviewPoint::Merged);
            return Ok(report);
        }

        println!("Uploading contacts to remote...");
        self.upload_staged(&mut report).await?;
        report.print_summary("Sync completed");
        Ok(report)
    }

    /// Refresh the version map from scratch and stage every remote contact.
    pub async fn download_baseline(&mut self, report: &mut SyncReport) -> Result<()> {
        let identities: Vec<String> = self
            .remote
            .list_identities(true)
            .await
            .context("failed to list remote collection")?
            .into_iter()
            .collect();
        report.listed = identities.len();

        let pb = self.create_progress_bar(identities.len() as u64, "Downloading");
        let fetched = self.remote.fetch_all(&identities, &pb).await;
        pb.finish_and_clear();

        report.downloaded = fetched.contacts.len();
        report.failures.extend(fetched.failures);

        let baseline: ContactSet = fetched.contacts.into_iter().collect();
        // Staged copies of identities that failed to download are stale.
        for identity in identities.iter().filter(|id| !baseline.contains(id)) {
            self.remote.state().record(identity, None).await;
        }

        self.store
            .save_all(&baseline)
            .context("failed to stage downloaded contacts")?;
        self.persist_versions().await?;
        info!(
            listed = report.listed,
            downloaded = report.downloaded,
            "baseline staged"
        );
        self.baseline = Some(baseline);
        Ok(())
    }

    /// Parse the roster, look up photos and merge into the staged set.
    pub async fn merge_roster<T: RosterSource>(
        &mut self,
        roster: &T,
        report: &mut SyncReport,
    ) -> Result<()> {
        let existing = self.store.load_all().context("failed to load staged contacts")?;
        let mut incoming = roster.fetch_roster().await.context("failed to load roster")?;
        report.roster_records = incoming.len();

        if !self.photo_sources.is_empty() {
            let curated = photographed_keys(&existing);
            let pb = self.create_progress_bar(0, "Looking up photos");
            report.photos_added = photo::enrich(
                &mut incoming,
                &self.photo_sources,
                &self.phone_region,
                self.photo_limit,
                |record: &Contact| {
                    match_key(record)
                        .and_then(|key| curated.get(&key).copied())
                        .unwrap_or(false)
                },
                &pb,
            )
            .await;
            pb.finish_and_clear();
        }

        let outcome = merge(existing, incoming);
        report.updated = outcome.updated.len();
        report.created = outcome.created.len();
        report.unchanged = outcome.unchanged();
        self.store
            .save_all(&outcome.contacts)
            .context("failed to stage merged contacts")?;
        info!(
            updated = report.updated,
            created = report.created,
            unchanged = report.unchanged,
            "merge staged"
        );
        Ok(())
    }

    /// Upload whatever is staged. Known identities are written conditionally,
    /// identities the server never listed unconditionally.
    ///
    /// Without a download in this run, the versions recorded by the last
    /// download are used, so server changes made since then are conflicts.
    pub async fn upload_staged(&mut self, report: &mut SyncReport) -> Result<()> {
        let staged = self.store.load_all().context("failed to load staged contacts")?;

        if self.baseline.is_none() {
            let versions = self
                .store
                .load_versions()
                .context("failed to load recorded versions")?
                .context("no recorded versions in the staging location; run download first")?;
            report.listed = versions.len();
            self.remote.state().apply_listing(versions, true).await;
        }

        let mut known: Vec<Contact> = Vec::new();
        let mut new: Vec<Contact> = Vec::new();
        for contact in staged {
            let unchanged = self
                .baseline
                .as_ref()
                .and_then(|baseline| baseline.get(&contact.uid))
                .is_some_and(|original| *original == contact);
            if unchanged {
                report.skipped += 1;
                continue;
            }
            if self.remote.knows(&contact.uid).await {
                known.push(contact);
            } else {
                new.push(contact);
            }
        }

        let pb = self.create_progress_bar((known.len() + new.len()) as u64, "Uploading");
        let updated = self.remote.write_all(&known, true, &pb).await;
        let created = self.remote.write_all(&new, false, &pb).await;
        pb.finish_and_clear();

        for written in [updated, created] {
            report.uploaded += written.written.len();
            report.failures.extend(written.failures);
        }
        self.persist_versions().await?;

        let conflicts = report.conflicts();
        if conflicts > 0 {
            warn!(conflicts, "some contacts changed remotely and were not uploaded");
        }
        info!(uploaded = report.uploaded, skipped = report.skipped, "upload finished");
        Ok(())
    }

    async fn persist_versions(&mut self) -> Result<()> {
        let versions = self.remote.state().snapshot().await;
        self.store
            .save_versions(&versions)
            .context("failed to record remote versions")
    }

    /// Create a progress bar
    fn create_progress_bar(&self, total: u64, message: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_message(message.to_string());
        pb
    }
}

/// Match keys of staged contacts, and whether the contact merge would pick
/// for that key already has a photo.
fn photographed_keys(existing: &ContactSet) -> HashMap<String, bool> {
    let mut keys = HashMap::new();
    for contact in existing.iter() {
        if let Some(key) = match_key(contact) {
            keys.entry(key).or_insert(contact.photo.is_some());
        }
    }
    keys
}
