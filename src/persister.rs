use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::Serialize;

use crate::copy::{CopyDispatcher, CopyMode, CopyRequest};
use crate::domain::{Dataset, EntityRef, Parameter, ParameterValue, SchemaKind, User};
use crate::enclosure::{EnclosureOutcome, EnclosureProcessor};
use crate::error::IngestError;
use crate::feed::{Author, Entry, FeedMetadata};
use crate::location::LocationResolver;
use crate::repository::{Repository, Session};
use crate::resolver::EntityResolver;
use crate::schema::{PARAM_ENTRY_ID, PARAM_UPDATED, SchemaRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "dataset", rename_all = "snake_case")]
pub enum Persisted {
    Created(Dataset),
    AlreadyExists(Dataset),
}

impl Persisted {
    pub fn dataset(&self) -> &Dataset {
        match self {
            Persisted::Created(dataset) | Persisted::AlreadyExists(dataset) => dataset,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Persisted::Created(_))
    }
}

pub struct EntryPersister<R, L, D> {
    repo: Arc<R>,
    registry: Arc<SchemaRegistry>,
    locations: L,
    dispatcher: D,
    copy_mode: CopyMode,
}

impl<R, L, D> EntryPersister<R, L, D>
where
    R: Repository,
    L: LocationResolver,
    D: CopyDispatcher,
{
    pub fn new(repo: Arc<R>, registry: Arc<SchemaRegistry>, locations: L, dispatcher: D) -> Self {
        Self {
            repo,
            registry,
            locations,
            dispatcher,
            copy_mode: CopyMode::Async,
        }
    }

    pub fn with_copy_mode(mut self, copy_mode: CopyMode) -> Self {
        self.copy_mode = copy_mode;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn existing_dataset(&self, entry: &Entry) -> Result<Option<Dataset>, IngestError> {
        self.repo
            .atomically(|session| Ok(self.lookup_dataset(session, &entry.id)))
    }

    pub fn is_new(&self, entry: &Entry) -> Result<bool, IngestError> {
        Ok(self.existing_dataset(entry)?.is_none())
    }

    pub fn process(&self, feed: &FeedMetadata, entry: &Entry) -> Result<Persisted, IngestError> {
        if let Some(dataset) = self.existing_dataset(entry)? {
            return Ok(Persisted::AlreadyExists(dataset));
        }

        let author = entry.author.as_ref().ok_or_else(|| {
            IngestError::MalformedEntry(format!("entry {} has no author", entry.id))
        })?;
        let updated = parse_updated(&entry.updated)?;

        match self.create(feed, entry, author, updated) {
            Err(err) if err.is_retryable() => {
                tracing::warn!(entry = %entry.id, %err, "contention while creating dataset, retrying");
                if let Some(dataset) = self.existing_dataset(entry)? {
                    return Ok(Persisted::AlreadyExists(dataset));
                }
                self.create(feed, entry, author, updated)
            }
            other => other,
        }
    }

    fn create(
        &self,
        feed: &FeedMetadata,
        entry: &Entry,
        author: &Author,
        updated: DateTime<FixedOffset>,
    ) -> Result<Persisted, IngestError> {
        let user = self.resolve_user(author)?;
        let schema_id = self.registry.get_schema(SchemaKind::Dataset).id;

        let (persisted, copies) = self.repo.atomically(|session| {
            session.lock_schema(schema_id)?;
            if let Some(dataset) = self.lookup_dataset(session, &entry.id) {
                return Ok((Persisted::AlreadyExists(dataset), Vec::new()));
            }

            let experiment =
                EntityResolver::new(&self.registry).resolve_experiment(session, entry, &user)?;
            let mut dataset = session.insert_dataset(experiment.id, &entry.title)?;
            tracing::debug!(
                feed = feed.title.as_deref().unwrap_or_default(),
                entry = %entry.id,
                dataset = %dataset.id,
                "creating new dataset: {}",
                entry.title
            );

            let owner = EntityRef::Dataset(dataset.id);
            session.add_parameter(Parameter {
                owner,
                schema: schema_id,
                name: PARAM_ENTRY_ID.to_string(),
                value: ParameterValue::String(entry.id.clone()),
            })?;
            session.add_parameter(Parameter {
                owner,
                schema: schema_id,
                name: PARAM_UPDATED.to_string(),
                value: ParameterValue::DateTime(updated),
            })?;

            let processor = EnclosureProcessor::new(&self.locations);
            let mut copies = Vec::new();
            for enclosure in &entry.enclosures {
                if let EnclosureOutcome::Replicated(request) =
                    processor.process(session, &dataset, enclosure)?
                {
                    copies.push(request);
                }
            }

            dataset.immutable = true;
            session.save_dataset(&dataset)?;
            Ok((Persisted::Created(dataset), copies))
        })?;

        self.dispatch(copies);
        Ok(persisted)
    }

    fn resolve_user(&self, author: &Author) -> Result<User, IngestError> {
        let resolve = || {
            self.repo.atomically(|session| {
                EntityResolver::new(&self.registry).resolve_user(session, author)
            })
        };
        match resolve() {
            Err(err) if err.is_retryable() => {
                tracing::debug!(author = %author.name, %err, "user created concurrently, re-resolving");
                resolve()
            }
            other => other,
        }
    }

    fn lookup_dataset(&self, session: &mut dyn Session, entry_id: &str) -> Option<Dataset> {
        let schema = self.registry.get_schema(SchemaKind::Dataset);
        match session.find_by_parameter(schema.id, PARAM_ENTRY_ID, entry_id)? {
            EntityRef::Dataset(id) => session.dataset(id),
            EntityRef::Experiment(_) => None,
        }
    }

    fn dispatch(&self, copies: Vec<CopyRequest>) {
        for request in copies {
            let replica = request.replica.id;
            if let Err(err) = self.dispatcher.schedule_copy(request, self.copy_mode) {
                tracing::warn!(%replica, %err, "local copy not completed");
            }
        }
    }
}

pub fn parse_updated(value: &str) -> Result<DateTime<FixedOffset>, IngestError> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc().fixed_offset())
        })
        .map_err(|_| IngestError::InvalidTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parses_offsets_and_naive_timestamps() {
        let with_offset = parse_updated("2012-05-01T10:00:00+10:00").unwrap();
        assert_eq!(with_offset.offset().local_minus_utc(), 36_000);
        let naive = parse_updated("2012-05-01T10:00:00").unwrap();
        assert_eq!(naive.offset().local_minus_utc(), 0);
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert_matches!(parse_updated("yesterday"), Err(IngestError::InvalidTimestamp(_)));
        assert_matches!(parse_updated(""), Err(IngestError::InvalidTimestamp(_)));
    }
}
