use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{FeedRequest, ResolvedConfig};
use crate::copy::{CopyDispatcher, CopyMode, HttpReplicaCopier, WorkerCopyDispatcher};
use crate::domain::Schema;
use crate::error::IngestError;
use crate::feed::FeedTransport;
use crate::location::{LocationRegistry, LocationResolver};
use crate::persister::EntryPersister;
use crate::repository::{MemoryRepository, Repository};
use crate::schema::SchemaRegistry;
use crate::store::Store;
use crate::walker::{FeedWalker, IngestReport};

#[derive(Debug, Clone, Serialize)]
pub struct FeedResult {
    pub feed: String,
    pub report: Option<IngestReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub feeds: Vec<FeedResult>,
}

impl RunResult {
    pub fn has_failures(&self) -> bool {
        self.feeds.iter().any(|feed| {
            feed.error.is_some()
                || feed
                    .report
                    .as_ref()
                    .is_some_and(|report| report.failed > 0 || report.fetch_error.is_some())
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaListing {
    pub schemas: Vec<Schema>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub type DefaultApp = App<MemoryRepository, LocationRegistry, WorkerCopyDispatcher<HttpReplicaCopier>>;

pub struct App<R, L, D> {
    registry: Arc<SchemaRegistry>,
    persister: EntryPersister<R, L, D>,
}

impl DefaultApp {
    pub fn bootstrap(
        config: &ResolvedConfig,
        store: Store,
        copy_mode: Option<CopyMode>,
    ) -> Result<Self, IngestError> {
        let repo = Arc::new(MemoryRepository::open(store.state_path())?);
        store.ensure_data_root()?;
        let dispatcher = WorkerCopyDispatcher::new(HttpReplicaCopier::new(store)?);
        App::new(
            repo,
            config.bootstrap_schemas,
            config.locations.clone(),
            dispatcher,
            copy_mode.unwrap_or(config.copy_mode),
        )
    }

    pub fn finish(&self) {
        self.persister.dispatcher().shutdown();
    }
}

impl<R, L, D> App<R, L, D>
where
    R: Repository,
    L: LocationResolver,
    D: CopyDispatcher,
{
    pub fn new(
        repo: Arc<R>,
        bootstrap_schemas: bool,
        locations: L,
        dispatcher: D,
        copy_mode: CopyMode,
    ) -> Result<Self, IngestError> {
        let registry = Arc::new(SchemaRegistry::load(repo.as_ref(), bootstrap_schemas)?);
        let persister = EntryPersister::new(repo, Arc::clone(&registry), locations, dispatcher)
            .with_copy_mode(copy_mode);
        Ok(Self {
            registry,
            persister,
        })
    }

    pub fn persister(&self) -> &EntryPersister<R, L, D> {
        &self.persister
    }

    pub fn schemas(&self) -> SchemaListing {
        SchemaListing {
            schemas: self.registry.schemas().into_iter().cloned().collect(),
        }
    }

    pub fn ingest<T: FeedTransport + ?Sized>(
        &self,
        url: &str,
        transport: &T,
        sink: &dyn ProgressSink,
    ) -> Result<IngestReport, IngestError> {
        sink.event(ProgressEvent {
            message: format!("phase=Walk; {url}"),
            elapsed: None,
        });
        let start = Instant::now();
        let report = FeedWalker::new(url, transport, &self.persister).ingest()?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Persist; created={} skipped={} failed={}",
                report.created, report.skipped, report.failed
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(report)
    }

    pub fn ingest_all<T, F>(
        &self,
        feeds: &[FeedRequest],
        connect: F,
        sink: &dyn ProgressSink,
    ) -> RunResult
    where
        T: FeedTransport,
        F: Fn(&FeedRequest) -> Result<T, IngestError>,
    {
        let feeds = feeds
            .iter()
            .map(|request| {
                let outcome =
                    connect(request).and_then(|transport| self.ingest(&request.url, &transport, sink));
                match outcome {
                    Ok(report) => FeedResult {
                        feed: request.url.clone(),
                        report: Some(report),
                        error: None,
                    },
                    Err(err) => {
                        tracing::error!(feed = %request.url, %err, "feed ingestion aborted");
                        FeedResult {
                            feed: request.url.clone(),
                            report: None,
                            error: Some(err.to_string()),
                        }
                    }
                }
            })
            .collect();
        RunResult { feeds }
    }
}
