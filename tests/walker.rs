use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;

use atom_ingest::copy::{CopyDispatcher, CopyMode, CopyRequest};
use atom_ingest::error::IngestError;
use atom_ingest::feed::{Author, Entry, FeedDocument, FeedMetadata, FeedTransport, Link};
use atom_ingest::location::LocationRegistry;
use atom_ingest::persister::EntryPersister;
use atom_ingest::repository::MemoryRepository;
use atom_ingest::schema::SchemaRegistry;
use atom_ingest::walker::FeedWalker;

#[derive(Default)]
struct MockTransport {
    pages: HashMap<String, FeedDocument>,
    fetched: Mutex<Vec<String>>,
}

impl MockTransport {
    fn page(mut self, url: &str, next: Option<&str>, entries: Vec<Entry>) -> Self {
        let links = next
            .map(|href| {
                vec![Link {
                    rel: "next".to_string(),
                    href: href.to_string(),
                }]
            })
            .unwrap_or_default();
        self.pages.insert(
            url.to_string(),
            FeedDocument {
                url: url.to_string(),
                feed: FeedMetadata {
                    title: Some("Instrument feed".to_string()),
                    links,
                    ..FeedMetadata::default()
                },
                entries,
            },
        );
        self
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl FeedTransport for MockTransport {
    fn fetch(&self, url: &str) -> Result<FeedDocument, IngestError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.pages.get(url).cloned().ok_or_else(|| IngestError::FeedStatus {
            status: 503,
            message: format!("{url} unavailable"),
        })
    }
}

#[derive(Default)]
struct NullDispatcher;

impl CopyDispatcher for NullDispatcher {
    fn schedule_copy(&self, _request: CopyRequest, _mode: CopyMode) -> Result<(), IngestError> {
        Ok(())
    }
}

type TestPersister = EntryPersister<MemoryRepository, LocationRegistry, NullDispatcher>;

fn persister() -> TestPersister {
    let repo = Arc::new(MemoryRepository::new());
    let registry = Arc::new(SchemaRegistry::load(repo.as_ref(), true).unwrap());
    EntryPersister::new(repo, registry, LocationRegistry::new(), NullDispatcher)
}

fn entry(id: &str) -> Entry {
    Entry {
        id: id.to_string(),
        updated: "2012-05-01T10:00:00+10:00".to_string(),
        title: format!("Run {id}"),
        author: Some(Author {
            name: "Jane Doe".to_string(),
            email: None,
        }),
        tags: Vec::new(),
        enclosures: Vec::new(),
    }
}

fn ids(entries: &[(FeedMetadata, Entry)]) -> Vec<&str> {
    entries.iter().map(|(_, entry)| entry.id.as_str()).collect()
}

const P1: &str = "https://feeds.example.org/atom";
const P2: &str = "https://feeds.example.org/atom?page=2";
const P3: &str = "https://feeds.example.org/atom?page=3";

fn three_pages() -> MockTransport {
    MockTransport::default()
        .page(P1, Some(P2), vec![entry("e9"), entry("e8"), entry("e7")])
        .page(P2, Some(P3), vec![entry("e6"), entry("e5"), entry("e4")])
        .page(P3, None, vec![entry("e3")])
}

#[test]
fn walk_stops_at_first_page_with_known_entry() {
    let persister = persister();
    persister
        .process(&FeedMetadata::default(), &entry("e4"))
        .unwrap();
    let transport = three_pages();

    let entries = FeedWalker::new(P1, &transport, &persister)
        .get_entries()
        .unwrap();

    assert_eq!(ids(&entries), vec!["e5", "e6", "e7", "e8", "e9"]);
    assert_eq!(transport.fetched(), vec![P1.to_string(), P2.to_string()]);
    assert_eq!(entries[0].0.title.as_deref(), Some("Instrument feed"));
}

#[test]
fn walk_follows_next_links_to_the_last_page() {
    let persister = persister();
    let transport = three_pages();

    let entries = FeedWalker::new(P1, &transport, &persister)
        .get_entries()
        .unwrap();

    assert_eq!(ids(&entries), vec!["e3", "e4", "e5", "e6", "e7", "e8", "e9"]);
    assert_eq!(transport.fetched().len(), 3);
}

#[test]
fn ingest_is_idempotent() {
    let persister = persister();
    let transport = three_pages();

    let first = FeedWalker::new(P1, &transport, &persister).ingest().unwrap();
    assert_eq!(first.created, 7);
    assert_eq!(first.pages, 3);
    assert_eq!(first.failed, 0);
    assert_eq!(first.fetch_error, None);

    let second = FeedWalker::new(P1, &transport, &persister).ingest().unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.created, 0);
    assert_eq!(second.pages, 1);
    assert_eq!(persister.repository().snapshot().datasets.len(), 7);
}

#[test]
fn failing_entry_is_reported_and_the_rest_persist() {
    let persister = persister();
    let mut broken = entry("e2");
    broken.updated = "not a date".to_string();
    let transport =
        MockTransport::default().page(P1, None, vec![entry("e3"), broken, entry("e1")]);

    let report = FeedWalker::new(P1, &transport, &persister).ingest().unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.created, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].entry_id, "e2");
    assert!(persister.is_new(&entry("e2")).unwrap());
    assert!(!persister.is_new(&entry("e3")).unwrap());
}

#[test]
fn failed_page_fetch_keeps_entries_already_read() {
    let persister = persister();
    let transport = MockTransport::default().page(P1, Some(P2), vec![entry("e3"), entry("e2")]);

    let report = FeedWalker::new(P1, &transport, &persister).ingest().unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.pages, 1);
    assert!(
        report
            .fetch_error
            .as_deref()
            .is_some_and(|err| err.contains("503"))
    );
    let descriptions: Vec<_> = persister
        .repository()
        .snapshot()
        .datasets
        .into_iter()
        .map(|dataset| dataset.description)
        .collect();
    assert_eq!(descriptions, vec!["Run e2", "Run e3"]);
}

#[test]
fn unreachable_root_page_is_an_error() {
    let persister = persister();
    let transport = MockTransport::default();

    let result = FeedWalker::new(P1, &transport, &persister).ingest();

    assert_matches!(result, Err(IngestError::FeedStatus { status: 503, .. }));
    assert!(persister.repository().snapshot().datasets.is_empty());
}

#[test]
fn pagination_loop_is_cut() {
    let persister = persister();
    let transport = MockTransport::default()
        .page(P1, Some(P2), vec![entry("e2")])
        .page(P2, Some(P1), vec![entry("e1")]);

    let entries = FeedWalker::new(P1, &transport, &persister)
        .get_entries()
        .unwrap();

    assert_eq!(ids(&entries), vec!["e1", "e2"]);
    assert_eq!(transport.fetched().len(), 2);
}

#[test]
fn empty_feed_yields_nothing() {
    let persister = persister();
    let transport = MockTransport::default().page(P1, None, Vec::new());

    let report = FeedWalker::new(P1, &transport, &persister).ingest().unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.pages, 1);
}
