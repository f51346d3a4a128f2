use std::collections::HashSet;

use serde::Serialize;

use crate::copy::CopyDispatcher;
use crate::domain::DatasetId;
use crate::error::IngestError;
use crate::feed::{Entry, FeedDocument, FeedMetadata, FeedTransport};
use crate::location::LocationResolver;
use crate::persister::{EntryPersister, Persisted};
use crate::repository::Repository;

pub trait EntrySink {
    fn is_new(&self, entry: &Entry) -> Result<bool, IngestError>;
    fn process(&self, feed: &FeedMetadata, entry: &Entry) -> Result<Persisted, IngestError>;
}

impl<R, L, D> EntrySink for EntryPersister<R, L, D>
where
    R: Repository,
    L: LocationResolver,
    D: CopyDispatcher,
{
    fn is_new(&self, entry: &Entry) -> Result<bool, IngestError> {
        EntryPersister::is_new(self, entry)
    }

    fn process(&self, feed: &FeedMetadata, entry: &Entry) -> Result<Persisted, IngestError> {
        EntryPersister::process(self, feed, entry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryFailure {
    pub entry_id: String,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub feed: String,
    pub pages: usize,
    pub processed: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub datasets: Vec<DatasetId>,
    pub failures: Vec<EntryFailure>,
    pub fetch_error: Option<String>,
}

impl IngestReport {
    fn new(feed: &str, pages: usize, fetch_error: Option<String>) -> Self {
        Self {
            feed: feed.to_string(),
            pages,
            processed: 0,
            created: 0,
            skipped: 0,
            failed: 0,
            datasets: Vec::new(),
            failures: Vec::new(),
            fetch_error,
        }
    }
}

struct Walk {
    entries: Vec<(FeedMetadata, Entry)>,
    pages: usize,
    fetch_error: Option<IngestError>,
}

pub struct FeedWalker<'a, T: ?Sized, P: ?Sized> {
    root_url: String,
    transport: &'a T,
    persister: &'a P,
}

impl<'a, T, P> FeedWalker<'a, T, P>
where
    T: FeedTransport + ?Sized,
    P: EntrySink + ?Sized,
{
    pub fn new(root_url: impl Into<String>, transport: &'a T, persister: &'a P) -> Self {
        Self {
            root_url: root_url.into(),
            transport,
            persister,
        }
    }

    pub fn get_entries(&self) -> Result<Vec<(FeedMetadata, Entry)>, IngestError> {
        Ok(self.walk()?.entries)
    }

    pub fn ingest(&self) -> Result<IngestReport, IngestError> {
        let walk = self.walk()?;
        let mut report = IngestReport::new(
            &self.root_url,
            walk.pages,
            walk.fetch_error.as_ref().map(ToString::to_string),
        );

        for (feed, entry) in &walk.entries {
            report.processed += 1;
            match self.persister.process(feed, entry) {
                Ok(Persisted::Created(dataset)) => {
                    report.created += 1;
                    report.datasets.push(dataset.id);
                }
                Ok(Persisted::AlreadyExists(_)) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(entry = %entry.id, %err, "entry ingestion failed");
                    report.failed += 1;
                    report.failures.push(EntryFailure {
                        entry_id: entry.id.clone(),
                        cause: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            feed = %self.root_url,
            pages = report.pages,
            processed = report.processed,
            created = report.created,
            skipped = report.skipped,
            failed = report.failed,
            "feed ingested"
        );
        Ok(report)
    }

    fn walk(&self) -> Result<Walk, IngestError> {
        let mut visited = HashSet::new();
        let mut doc = self.fetch(&self.root_url)?;
        visited.insert(self.root_url.clone());
        let mut pages = 1;
        let mut entries = Vec::new();
        let mut fetch_error = None;

        loop {
            let next = doc.next_href().map(str::to_string);
            let FeedDocument {
                url,
                feed,
                entries: page_entries,
            } = doc;
            let total = page_entries.len();

            let mut fresh = Vec::with_capacity(total);
            for entry in page_entries {
                if self.persister.is_new(&entry)? {
                    fresh.push(entry);
                }
            }
            let fresh_count = fresh.len();
            entries.extend(fresh.into_iter().map(|entry| (feed.clone(), entry)));

            // Stop at the first known entry or when there is no next page. Older
            // new entries behind a known one are not reached.
            if fresh_count != total {
                tracing::debug!(%url, fresh_count, total, "reached previously ingested entries");
                break;
            }
            let Some(next) = next else {
                break;
            };
            if !visited.insert(next.clone()) {
                tracing::warn!(%url, %next, "pagination loops back to a visited page");
                break;
            }
            match self.fetch(&next) {
                Ok(page) => {
                    doc = page;
                    pages += 1;
                }
                Err(err) => {
                    tracing::warn!(%url, %next, %err, "stopped paging, keeping entries already read");
                    fetch_error = Some(err);
                    break;
                }
            }
        }

        entries.reverse();
        Ok(Walk {
            entries,
            pages,
            fetch_error,
        })
    }

    fn fetch(&self, url: &str) -> Result<FeedDocument, IngestError> {
        tracing::debug!(url, "fetching feed page");
        self.transport.fetch(url)
    }
}
