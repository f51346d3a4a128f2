use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(UserId);
entity_id!(ExperimentId);
entity_id!(DatasetId);
entity_id!(DataFileId);
entity_id!(ReplicaId);
entity_id!(SchemaId);
entity_id!(AclId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Dataset,
    Experiment,
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKind::Dataset => write!(f, "dataset"),
            SchemaKind::Experiment => write!(f, "experiment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    DateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterName {
    pub name: String,
    pub full_name: String,
    pub data_type: ParameterType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub id: SchemaId,
    pub namespace: String,
    pub name: String,
    pub kind: SchemaKind,
    pub parameter_names: Vec<ParameterName>,
}

impl Schema {
    pub fn parameter_name(&self, name: &str) -> Option<&ParameterName> {
        self.parameter_names.iter().find(|param| param.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSchema {
    pub namespace: String,
    pub name: String,
    pub kind: SchemaKind,
    pub parameter_names: Vec<ParameterName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParameterValue {
    String(String),
    DateTime(DateTime<FixedOffset>),
}

impl ParameterValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            ParameterValue::String(value) => Some(value),
            ParameterValue::DateTime(_) => None,
        }
    }

    pub fn data_type(&self) -> ParameterType {
        match self {
            ParameterValue::String(_) => ParameterType::String,
            ParameterValue::DateTime(_) => ParameterType::DateTime,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    Dataset(DatasetId),
    Experiment(ExperimentId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub owner: EntityRef,
    pub schema: SchemaId,
    pub name: String,
    pub value: ParameterValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicAccess {
    None,
    Metadata,
    Full,
}

impl fmt::Display for PublicAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublicAccess::None => write!(f, "no public access"),
            PublicAccess::Metadata => write!(f, "public metadata"),
            PublicAccess::Full => write!(f, "public"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub title: String,
    pub created_by: UserId,
    pub public_access: PublicAccess,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExperiment {
    pub title: String,
    pub created_by: UserId,
    pub public_access: PublicAccess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub experiment: ExperimentId,
    pub description: String,
    pub immutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    pub id: DataFileId,
    pub dataset: DatasetId,
    pub filename: String,
    pub mimetype: Option<String>,
    pub size: Option<u64>,
    pub sha512sum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewDataFile {
    pub filename: String,
    pub mimetype: Option<String>,
    pub size: Option<u64>,
    pub sha512sum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub datafile: DataFileId,
    pub url: String,
    pub location: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReplica {
    pub datafile: DataFileId,
    pub url: String,
    pub location: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclOwnership {
    OwnerOwned,
    SystemOwned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAcl {
    pub id: AclId,
    pub entity: EntityRef,
    pub plugin: String,
    pub principal: UserId,
    pub can_read: bool,
    pub can_write: bool,
    pub can_delete: bool,
    pub is_owner: bool,
    pub ownership: AclOwnership,
}

impl ObjectAcl {
    pub fn grants_full_rights(&self) -> bool {
        self.can_read && self.can_write && self.can_delete && self.is_owner
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewObjectAcl {
    pub entity: EntityRef,
    pub plugin: String,
    pub principal: UserId,
    pub can_read: bool,
    pub can_write: bool,
    pub can_delete: bool,
    pub is_owner: bool,
    pub ownership: AclOwnership,
}

impl NewObjectAcl {
    pub fn owner(entity: EntityRef, principal: UserId) -> Self {
        Self {
            entity,
            plugin: "django_user".to_string(),
            principal,
            can_read: true,
            can_write: true,
            can_delete: true,
            is_owner: true,
            ownership: AclOwnership::OwnerOwned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_acl_grants_everything() {
        let acl = NewObjectAcl::owner(EntityRef::Experiment(ExperimentId(4)), UserId(7));
        assert!(acl.can_read && acl.can_write && acl.can_delete && acl.is_owner);
        assert_eq!(acl.ownership, AclOwnership::OwnerOwned);
    }

    #[test]
    fn parameter_value_string_accessor() {
        let value = ParameterValue::String("entry-1".to_string());
        assert_eq!(value.as_string(), Some("entry-1"));
        assert_eq!(value.data_type(), ParameterType::String);
    }

    #[test]
    fn public_access_display() {
        assert_eq!(PublicAccess::None.to_string(), "no public access");
    }
}
