use crate::domain::{
    EntityRef, Experiment, NewExperiment, NewObjectAcl, NewUser, Parameter, ParameterValue,
    PublicAccess, SchemaKind, User,
};
use crate::error::IngestError;
use crate::feed::{Author, Entry};
use crate::repository::Session;
use crate::schema::{PARAM_EXPERIMENT_ID, PARAM_EXPERIMENT_TITLE, SchemaRegistry};

pub const DEFAULT_EXPERIMENT_TITLE: &str = "Uncategorized Data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentDetails {
    pub experiment_id: String,
    pub title: String,
    pub public_access: PublicAccess,
}

pub struct EntityResolver<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> EntityResolver<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn resolve_user(
        &self,
        session: &mut dyn Session,
        author: &Author,
    ) -> Result<User, IngestError> {
        if let Some(email) = author.email.as_deref() {
            if let Some(user) = session.find_user_by_email(email) {
                return Ok(user);
            }
        }

        let username = username_for(&author.name);
        if username.is_empty() {
            return Err(IngestError::MalformedEntry(
                "author has an empty name".to_string(),
            ));
        }
        if let Some(user) = session.find_user_by_username(&username) {
            return Ok(user);
        }

        tracing::debug!(%username, "creating user for feed author");
        session.insert_user(NewUser {
            username,
            email: None,
        })
    }

    pub fn resolve_experiment(
        &self,
        session: &mut dyn Session,
        entry: &Entry,
        user: &User,
    ) -> Result<Experiment, IngestError> {
        let details = experiment_details(entry, user);
        let schema = self.registry.get_schema(SchemaKind::Experiment);

        if let Some(EntityRef::Experiment(id)) =
            session.find_by_parameter(schema.id, PARAM_EXPERIMENT_ID, &details.experiment_id)
        {
            if let Some(experiment) = session.experiment(id) {
                return Ok(experiment);
            }
        }

        tracing::debug!(experiment_id = %details.experiment_id, "creating experiment");
        let experiment = session.insert_experiment(NewExperiment {
            title: details.title.clone(),
            created_by: user.id,
            public_access: details.public_access,
        })?;
        let owner = EntityRef::Experiment(experiment.id);
        session.add_parameter(Parameter {
            owner,
            schema: schema.id,
            name: PARAM_EXPERIMENT_ID.to_string(),
            value: ParameterValue::String(details.experiment_id),
        })?;
        session.add_parameter(Parameter {
            owner,
            schema: schema.id,
            name: PARAM_EXPERIMENT_TITLE.to_string(),
            value: ParameterValue::String(details.title),
        })?;
        session.insert_acl(NewObjectAcl::owner(owner, user.id))?;
        Ok(experiment)
    }
}

pub fn username_for(name: &str) -> String {
    name.trim().replace(' ', "_")
}

pub fn experiment_details(entry: &Entry, user: &User) -> ExperimentDetails {
    let mut experiment_id = None;
    let mut title = None;
    for tag in &entry.tags {
        let Some(scheme) = tag.scheme.as_deref() else {
            continue;
        };
        if scheme.ends_with(PARAM_EXPERIMENT_ID) {
            experiment_id = Some(tag.term.clone());
        }
        if scheme.ends_with(PARAM_EXPERIMENT_TITLE) {
            title = Some(tag.term.clone());
        }
    }

    match (experiment_id, title) {
        (Some(experiment_id), Some(title)) => ExperimentDetails {
            experiment_id,
            title,
            public_access: PublicAccess::None,
        },
        _ => ExperimentDetails {
            experiment_id: format!("{}-default", user.username),
            title: DEFAULT_EXPERIMENT_TITLE.to_string(),
            public_access: PublicAccess::None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;
    use crate::feed::Category;

    fn user() -> User {
        User {
            id: UserId(1),
            username: "Jane_Doe".to_string(),
            email: None,
            email_verified: false,
        }
    }

    fn entry(tags: Vec<Category>) -> Entry {
        Entry {
            id: "urn:entry:1".to_string(),
            updated: "2012-05-01T08:00:00Z".to_string(),
            title: "run".to_string(),
            author: None,
            tags,
            enclosures: Vec::new(),
        }
    }

    fn tag(scheme: &str, term: &str) -> Category {
        Category {
            scheme: Some(scheme.to_string()),
            term: term.to_string(),
        }
    }

    #[test]
    fn username_replaces_spaces() {
        assert_eq!(username_for("  Jane Doe "), "Jane_Doe");
    }

    #[test]
    fn details_from_tags() {
        let entry = entry(vec![
            tag("http://example.org/ExperimentID", "exp-1"),
            tag("http://example.org/ExperimentTitle", "Beamline"),
        ]);
        let details = experiment_details(&entry, &user());
        assert_eq!(details.experiment_id, "exp-1");
        assert_eq!(details.title, "Beamline");
        assert_eq!(details.public_access, PublicAccess::None);
    }

    #[test]
    fn details_need_both_tags() {
        let entry = entry(vec![tag("http://example.org/ExperimentID", "exp-1")]);
        let details = experiment_details(&entry, &user());
        assert_eq!(details.experiment_id, "Jane_Doe-default");
        assert_eq!(details.title, DEFAULT_EXPERIMENT_TITLE);
    }
}
