use serde::Serialize;

use crate::domain::{NewSchema, ParameterName, ParameterType, Schema, SchemaKind};
use crate::error::IngestError;
use crate::repository::Repository;

pub const BASE_NAMESPACE: &str = "http://mytardis.org/schemas/atom-import";
pub const FIXTURE_VERSION: &str = "2012-05";

pub const PARAM_ENTRY_ID: &str = "EntryID";
pub const PARAM_UPDATED: &str = "Updated";
pub const PARAM_EXPERIMENT_ID: &str = "ExperimentID";
pub const PARAM_EXPERIMENT_TITLE: &str = "ExperimentTitle";

#[derive(Debug, Clone, Serialize)]
pub struct SchemaRegistry {
    dataset: Schema,
    experiment: Schema,
}

impl SchemaRegistry {
    pub fn load<R: Repository>(repo: &R, bootstrap: bool) -> Result<Self, IngestError> {
        match Self::load_once(repo, bootstrap) {
            Err(err) if err.is_retryable() => {
                tracing::debug!(%err, "schema bootstrap raced, re-reading");
                Self::load_once(repo, false)
            }
            other => other,
        }
    }

    fn load_once<R: Repository>(repo: &R, bootstrap: bool) -> Result<Self, IngestError> {
        let schemas = repo.atomically(|session| {
            if bootstrap && session.schemas_with_prefix(BASE_NAMESPACE).is_empty() {
                tracing::info!(version = FIXTURE_VERSION, "installing atom-import schemas");
                for schema in default_schemas() {
                    session.insert_schema(schema)?;
                }
            }
            Ok(session.schemas_with_prefix(BASE_NAMESPACE))
        })?;

        let pick = |kind: SchemaKind| {
            schemas
                .iter()
                .find(|schema| schema.kind == kind)
                .cloned()
                .ok_or_else(|| {
                    IngestError::SchemaNotFound(format!("{kind} schema under {BASE_NAMESPACE}"))
                })
        };
        Ok(Self {
            dataset: pick(SchemaKind::Dataset)?,
            experiment: pick(SchemaKind::Experiment)?,
        })
    }

    pub fn get_schema(&self, kind: SchemaKind) -> &Schema {
        match kind {
            SchemaKind::Dataset => &self.dataset,
            SchemaKind::Experiment => &self.experiment,
        }
    }

    pub fn schemas(&self) -> [&Schema; 2] {
        [&self.dataset, &self.experiment]
    }
}

pub fn default_schemas() -> Vec<NewSchema> {
    vec![
        NewSchema {
            namespace: format!("{BASE_NAMESPACE}/dataset/{FIXTURE_VERSION}"),
            name: "Atom Import Dataset".to_string(),
            kind: SchemaKind::Dataset,
            parameter_names: vec![
                parameter(PARAM_ENTRY_ID, "Atom entry id", ParameterType::String),
                parameter(PARAM_UPDATED, "Atom entry updated", ParameterType::DateTime),
            ],
        },
        NewSchema {
            namespace: format!("{BASE_NAMESPACE}/experiment/{FIXTURE_VERSION}"),
            name: "Atom Import Experiment".to_string(),
            kind: SchemaKind::Experiment,
            parameter_names: vec![
                parameter(PARAM_EXPERIMENT_ID, "Experiment id", ParameterType::String),
                parameter(PARAM_EXPERIMENT_TITLE, "Experiment title", ParameterType::String),
            ],
        },
    ]
}

fn parameter(name: &str, full_name: &str, data_type: ParameterType) -> ParameterName {
    ParameterName {
        name: name.to_string(),
        full_name: full_name.to_string(),
        data_type,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::repository::MemoryRepository;

    #[test]
    fn bootstrap_is_idempotent() {
        let repo = MemoryRepository::new();
        let first = SchemaRegistry::load(&repo, true).unwrap();
        let second = SchemaRegistry::load(&repo, true).unwrap();
        assert_eq!(
            first.get_schema(SchemaKind::Dataset).id,
            second.get_schema(SchemaKind::Dataset).id
        );
        assert_eq!(repo.snapshot().schemas.len(), 2);
    }

    #[test]
    fn missing_schema_without_bootstrap() {
        let repo = MemoryRepository::new();
        let err = SchemaRegistry::load(&repo, false).unwrap_err();
        assert_matches!(err, IngestError::SchemaNotFound(_));
    }

    #[test]
    fn schemas_carry_provenance_parameters() {
        let repo = MemoryRepository::new();
        let registry = SchemaRegistry::load(&repo, true).unwrap();
        let dataset = registry.get_schema(SchemaKind::Dataset);
        assert!(dataset.namespace.starts_with(BASE_NAMESPACE));
        assert!(dataset.parameter_name(PARAM_ENTRY_ID).is_some());
        assert!(
            registry
                .get_schema(SchemaKind::Experiment)
                .parameter_name(PARAM_EXPERIMENT_ID)
                .is_some()
        );
    }
}
