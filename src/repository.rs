use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AclId, DataFile, DataFileId, Dataset, DatasetId, EntityRef, Experiment, ExperimentId,
    NewDataFile, NewExperiment, NewObjectAcl, NewReplica, NewSchema, NewUser, ObjectAcl,
    Parameter, Replica, ReplicaId, Schema, SchemaId, User, UserId, UserProfile,
};
use crate::error::IngestError;
use crate::store::Store;

pub trait Session {
    fn schemas_with_prefix(&self, prefix: &str) -> Vec<Schema>;
    fn insert_schema(&mut self, schema: NewSchema) -> Result<Schema, IngestError>;

    fn lock_schema(&mut self, schema: SchemaId) -> Result<(), IngestError>;

    fn find_user_by_email(&self, email: &str) -> Option<User>;
    fn find_user_by_username(&self, username: &str) -> Option<User>;
    fn insert_user(&mut self, user: NewUser) -> Result<User, IngestError>;

    fn find_by_parameter(&self, schema: SchemaId, name: &str, value: &str) -> Option<EntityRef>;
    fn parameters(&self, owner: EntityRef) -> Vec<Parameter>;
    fn add_parameter(&mut self, parameter: Parameter) -> Result<(), IngestError>;

    fn experiment(&self, id: ExperimentId) -> Option<Experiment>;
    fn insert_experiment(&mut self, experiment: NewExperiment) -> Result<Experiment, IngestError>;
    fn insert_acl(&mut self, acl: NewObjectAcl) -> Result<ObjectAcl, IngestError>;

    fn dataset(&self, id: DatasetId) -> Option<Dataset>;
    fn insert_dataset(
        &mut self,
        experiment: ExperimentId,
        description: &str,
    ) -> Result<Dataset, IngestError>;
    fn save_dataset(&mut self, dataset: &Dataset) -> Result<(), IngestError>;

    fn insert_datafile(
        &mut self,
        dataset: DatasetId,
        file: NewDataFile,
    ) -> Result<DataFile, IngestError>;
    fn insert_replica(&mut self, replica: NewReplica) -> Result<Replica, IngestError>;
}

pub trait Repository: Send + Sync {
    fn atomically<T, F>(&self, work: F) -> Result<T, IngestError>
    where
        F: FnOnce(&mut dyn Session) -> Result<T, IngestError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryState {
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub schemas: Vec<Schema>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub profiles: Vec<UserProfile>,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub acls: Vec<ObjectAcl>,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub datafiles: Vec<DataFile>,
    #[serde(default)]
    pub replicas: Vec<Replica>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl RepositoryState {
    fn max_id(&self) -> u64 {
        let ids = self
            .schemas
            .iter()
            .map(|s| s.id.get())
            .chain(self.users.iter().map(|u| u.id.get()))
            .chain(self.experiments.iter().map(|e| e.id.get()))
            .chain(self.acls.iter().map(|a| a.id.get()))
            .chain(self.datasets.iter().map(|d| d.id.get()))
            .chain(self.datafiles.iter().map(|f| f.id.get()))
            .chain(self.replicas.iter().map(|r| r.id.get()));
        ids.max().unwrap_or(0)
    }
}

pub struct MemoryRepository {
    state: RwLock<RepositoryState>,
    next_id: AtomicU64,
    locks: Mutex<HashSet<SchemaId>>,
    released: Condvar,
    state_file: Option<StateFile>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::with_state(RepositoryState::default(), None)
    }

    pub fn open(path: &Utf8Path) -> Result<Self, IngestError> {
        let file = StateFile::new(path);
        let guard = file.lock()?;
        let generation = file.generation()?;
        let state = file.read()?;
        drop(guard);
        *file.seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(generation);
        Ok(Self::with_state(state, Some(file)))
    }

    fn with_state(state: RepositoryState, state_file: Option<StateFile>) -> Self {
        let next_id = state.next_id.max(state.max_id() + 1);
        Self {
            state: RwLock::new(state),
            next_id: AtomicU64::new(next_id),
            locks: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            state_file,
        }
    }

    fn refresh(&self, file: &StateFile) -> Result<(), IngestError> {
        let current = file.generation()?;
        let mut seen = file.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if *seen == Some(current) {
            return Ok(());
        }
        let disk = file.read()?;
        tracing::debug!(path = %file.path, generation = current, "state file changed, reloading");
        self.next_id
            .fetch_max(disk.next_id.max(disk.max_id() + 1), Ordering::SeqCst);
        *self
            .state
            .write()
            .map_err(|_| IngestError::Persistence("repository state poisoned".to_string()))? = disk;
        *seen = Some(current);
        Ok(())
    }

    pub fn snapshot(&self) -> RepositoryState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn acquire(&self, schema: SchemaId) -> Result<(), IngestError> {
        let mut held = self
            .locks
            .lock()
            .map_err(|_| IngestError::Persistence("schema lock table poisoned".to_string()))?;
        while held.contains(&schema) {
            held = self
                .released
                .wait(held)
                .map_err(|_| IngestError::Persistence("schema lock table poisoned".to_string()))?;
        }
        held.insert(schema);
        Ok(())
    }

    fn release(&self, schemas: &[SchemaId]) {
        if schemas.is_empty() {
            return;
        }
        let mut held = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for schema in schemas {
            held.remove(schema);
        }
        self.released.notify_all();
    }

    fn commit(&self, pending: Pending) -> Result<(), IngestError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| IngestError::Persistence("repository state poisoned".to_string()))?;

        for user in &pending.state.users {
            if let Some(existing) = conflicting_user(&state.users, user) {
                return Err(IngestError::Contention(format!(
                    "user {} conflicts with committed user {}",
                    user.username, existing.username
                )));
            }
        }
        for schema in &pending.state.schemas {
            if state.schemas.iter().any(|s| s.namespace == schema.namespace) {
                return Err(IngestError::Contention(format!(
                    "schema {} already exists",
                    schema.namespace
                )));
            }
        }
        for update in &pending.dataset_updates {
            if let Some(current) = state.datasets.iter().find(|d| d.id == update.id) {
                if current.immutable {
                    return Err(IngestError::Persistence(format!(
                        "dataset {} is immutable",
                        current.id
                    )));
                }
            }
        }

        let mut next = state.clone();
        let Pending {
            state: delta,
            dataset_updates,
            ..
        } = pending;
        next.schemas.extend(delta.schemas);
        next.users.extend(delta.users);
        next.profiles.extend(delta.profiles);
        next.experiments.extend(delta.experiments);
        next.acls.extend(delta.acls);
        next.datasets.extend(delta.datasets);
        next.datafiles.extend(delta.datafiles);
        next.replicas.extend(delta.replicas);
        next.parameters.extend(delta.parameters);
        for update in dataset_updates {
            if let Some(current) = next.datasets.iter_mut().find(|d| d.id == update.id) {
                *current = update;
            }
        }
        next.next_id = self.next_id.load(Ordering::SeqCst);

        if let Some(file) = &self.state_file {
            let content = serde_json::to_vec_pretty(&next)
                .map_err(|err| IngestError::Persistence(err.to_string()))?;
            Store::write_bytes_atomic(&file.path, &content)
                .map_err(|err| IngestError::Persistence(err.to_string()))?;
            let mut seen = file.seen.lock().unwrap_or_else(PoisonError::into_inner);
            let generation = seen.unwrap_or_default() + 1;
            fs::write(file.lock_path.as_std_path(), generation.to_string())
                .map_err(|err| IngestError::Persistence(format!("{}: {err}", file.lock_path)))?;
            *seen = Some(generation);
        }
        *state = next;
        Ok(())
    }
}

impl Repository for MemoryRepository {
    fn atomically<T, F>(&self, work: F) -> Result<T, IngestError>
    where
        F: FnOnce(&mut dyn Session) -> Result<T, IngestError>,
    {
        // Serializes units of work across every process sharing the state file.
        let _guard = match &self.state_file {
            Some(file) => {
                let guard = file.lock()?;
                self.refresh(file)?;
                Some(guard)
            }
            None => None,
        };
        let mut session = MemorySession {
            repo: self,
            pending: Pending::default(),
        };
        let value = work(&mut session)?;
        let pending = std::mem::take(&mut session.pending);
        let held = pending.held.clone();
        let result = if pending.has_writes() {
            self.commit(pending)
        } else {
            Ok(())
        };
        // Locks outlive the commit so waiters observe its writes.
        self.release(&held);
        result.map(|_| value)
    }
}

struct StateFile {
    path: Utf8PathBuf,
    lock_path: Utf8PathBuf,
    // Commit counter kept in the lock file, read under the lock.
    seen: Mutex<Option<u64>>,
}

impl StateFile {
    fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock_path: Utf8PathBuf::from(format!("{path}.lock")),
            seen: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<File, IngestError> {
        if let Some(parent) = self.lock_path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path.as_std_path())
            .map_err(|err| IngestError::Filesystem(format!("{}: {err}", self.lock_path)))?;
        file.lock()
            .map_err(|err| IngestError::Persistence(format!("{}: {err}", self.lock_path)))?;
        Ok(file)
    }

    fn generation(&self) -> Result<u64, IngestError> {
        let content = fs::read_to_string(self.lock_path.as_std_path())
            .map_err(|err| IngestError::Filesystem(format!("{}: {err}", self.lock_path)))?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(0);
        }
        content
            .parse()
            .map_err(|_| IngestError::Persistence(format!("{}: bad generation", self.lock_path)))
    }

    fn read(&self) -> Result<RepositoryState, IngestError> {
        if !self.path.as_std_path().exists() {
            return Ok(RepositoryState::default());
        }
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|err| IngestError::Persistence(format!("{}: {err}", self.path)))
    }
}

#[derive(Default)]
struct Pending {
    state: RepositoryState,
    dataset_updates: Vec<Dataset>,
    held: Vec<SchemaId>,
}

impl Pending {
    fn has_writes(&self) -> bool {
        let delta = &self.state;
        !(delta.schemas.is_empty()
            && delta.users.is_empty()
            && delta.profiles.is_empty()
            && delta.experiments.is_empty()
            && delta.acls.is_empty()
            && delta.datasets.is_empty()
            && delta.datafiles.is_empty()
            && delta.replicas.is_empty()
            && delta.parameters.is_empty()
            && self.dataset_updates.is_empty())
    }
}

struct MemorySession<'a> {
    repo: &'a MemoryRepository,
    pending: Pending,
}

impl Drop for MemorySession<'_> {
    fn drop(&mut self) {
        self.repo.release(&self.pending.held);
    }
}

impl MemorySession<'_> {
    fn committed(&self) -> std::sync::RwLockReadGuard<'_, RepositoryState> {
        self.repo.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn dataset_is_immutable(&self, id: DatasetId) -> bool {
        self.committed()
            .datasets
            .iter()
            .any(|d| d.id == id && d.immutable)
    }
}

impl Session for MemorySession<'_> {
    fn schemas_with_prefix(&self, prefix: &str) -> Vec<Schema> {
        let committed = self.committed();
        committed
            .schemas
            .iter()
            .chain(self.pending.state.schemas.iter())
            .filter(|schema| schema.namespace.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn insert_schema(&mut self, schema: NewSchema) -> Result<Schema, IngestError> {
        let exists = self
            .schemas_with_prefix(&schema.namespace)
            .iter()
            .any(|existing| existing.namespace == schema.namespace);
        if exists {
            return Err(IngestError::Contention(format!(
                "schema {} already exists",
                schema.namespace
            )));
        }
        let schema = Schema {
            id: SchemaId(self.repo.allocate()),
            namespace: schema.namespace,
            name: schema.name,
            kind: schema.kind,
            parameter_names: schema.parameter_names,
        };
        self.pending.state.schemas.push(schema.clone());
        Ok(schema)
    }

    fn lock_schema(&mut self, schema: SchemaId) -> Result<(), IngestError> {
        if self.pending.held.contains(&schema) {
            return Ok(());
        }
        self.repo.acquire(schema)?;
        self.pending.held.push(schema);
        Ok(())
    }

    fn find_user_by_email(&self, email: &str) -> Option<User> {
        let committed = self.committed();
        committed
            .users
            .iter()
            .chain(self.pending.state.users.iter())
            .find(|user| user.email.as_deref() == Some(email))
            .cloned()
    }

    fn find_user_by_username(&self, username: &str) -> Option<User> {
        let committed = self.committed();
        committed
            .users
            .iter()
            .chain(self.pending.state.users.iter())
            .find(|user| user.username == username)
            .cloned()
    }

    fn insert_user(&mut self, user: NewUser) -> Result<User, IngestError> {
        let user = User {
            id: UserId(self.repo.allocate()),
            username: user.username,
            email: user.email,
            email_verified: false,
        };
        let conflict = {
            let committed = self.committed();
            conflicting_user(&committed.users, &user)
                .or_else(|| conflicting_user(&self.pending.state.users, &user))
                .map(|existing| existing.username.clone())
        };
        if let Some(existing) = conflict {
            return Err(IngestError::Contention(format!(
                "user {} conflicts with existing user {existing}",
                user.username
            )));
        }
        self.pending.state.profiles.push(UserProfile {
            user: user.id,
            created_at: Utc::now(),
        });
        self.pending.state.users.push(user.clone());
        Ok(user)
    }

    fn find_by_parameter(&self, schema: SchemaId, name: &str, value: &str) -> Option<EntityRef> {
        let committed = self.committed();
        committed
            .parameters
            .iter()
            .chain(self.pending.state.parameters.iter())
            .find(|param| {
                param.schema == schema && param.name == name && param.value.as_string() == Some(value)
            })
            .map(|param| param.owner)
    }

    fn parameters(&self, owner: EntityRef) -> Vec<Parameter> {
        let committed = self.committed();
        committed
            .parameters
            .iter()
            .chain(self.pending.state.parameters.iter())
            .filter(|param| param.owner == owner)
            .cloned()
            .collect()
    }

    fn add_parameter(&mut self, parameter: Parameter) -> Result<(), IngestError> {
        if let EntityRef::Dataset(id) = parameter.owner {
            if self.dataset_is_immutable(id) {
                return Err(IngestError::Persistence(format!("dataset {id} is immutable")));
            }
        }
        self.pending.state.parameters.push(parameter);
        Ok(())
    }

    fn experiment(&self, id: ExperimentId) -> Option<Experiment> {
        let committed = self.committed();
        committed
            .experiments
            .iter()
            .chain(self.pending.state.experiments.iter())
            .find(|experiment| experiment.id == id)
            .cloned()
    }

    fn insert_experiment(&mut self, experiment: NewExperiment) -> Result<Experiment, IngestError> {
        let experiment = Experiment {
            id: ExperimentId(self.repo.allocate()),
            title: experiment.title,
            created_by: experiment.created_by,
            public_access: experiment.public_access,
            created_at: Utc::now(),
        };
        self.pending.state.experiments.push(experiment.clone());
        Ok(experiment)
    }

    fn insert_acl(&mut self, acl: NewObjectAcl) -> Result<ObjectAcl, IngestError> {
        let acl = ObjectAcl {
            id: AclId(self.repo.allocate()),
            entity: acl.entity,
            plugin: acl.plugin,
            principal: acl.principal,
            can_read: acl.can_read,
            can_write: acl.can_write,
            can_delete: acl.can_delete,
            is_owner: acl.is_owner,
            ownership: acl.ownership,
        };
        self.pending.state.acls.push(acl.clone());
        Ok(acl)
    }

    fn dataset(&self, id: DatasetId) -> Option<Dataset> {
        if let Some(dataset) = self.pending.dataset_updates.iter().find(|d| d.id == id) {
            return Some(dataset.clone());
        }
        let committed = self.committed();
        committed
            .datasets
            .iter()
            .chain(self.pending.state.datasets.iter())
            .find(|dataset| dataset.id == id)
            .cloned()
    }

    fn insert_dataset(
        &mut self,
        experiment: ExperimentId,
        description: &str,
    ) -> Result<Dataset, IngestError> {
        if self.experiment(experiment).is_none() {
            return Err(IngestError::Persistence(format!(
                "experiment {experiment} does not exist"
            )));
        }
        let dataset = Dataset {
            id: DatasetId(self.repo.allocate()),
            experiment,
            description: description.to_string(),
            immutable: false,
        };
        self.pending.state.datasets.push(dataset.clone());
        Ok(dataset)
    }

    fn save_dataset(&mut self, dataset: &Dataset) -> Result<(), IngestError> {
        if self.dataset_is_immutable(dataset.id) {
            return Err(IngestError::Persistence(format!(
                "dataset {} is immutable",
                dataset.id
            )));
        }
        if let Some(pending) = self
            .pending
            .state
            .datasets
            .iter_mut()
            .find(|d| d.id == dataset.id)
        {
            *pending = dataset.clone();
            return Ok(());
        }
        if self.dataset(dataset.id).is_none() {
            return Err(IngestError::Persistence(format!(
                "dataset {} does not exist",
                dataset.id
            )));
        }
        self.pending.dataset_updates.retain(|d| d.id != dataset.id);
        self.pending.dataset_updates.push(dataset.clone());
        Ok(())
    }

    fn insert_datafile(
        &mut self,
        dataset: DatasetId,
        file: NewDataFile,
    ) -> Result<DataFile, IngestError> {
        match self.dataset(dataset) {
            Some(current) if current.immutable || self.dataset_is_immutable(dataset) => {
                return Err(IngestError::Persistence(format!(
                    "dataset {dataset} is immutable"
                )));
            }
            Some(_) => {}
            None => {
                return Err(IngestError::Persistence(format!(
                    "dataset {dataset} does not exist"
                )));
            }
        }
        let datafile = DataFile {
            id: DataFileId(self.repo.allocate()),
            dataset,
            filename: file.filename,
            mimetype: file.mimetype,
            size: file.size,
            sha512sum: file.sha512sum,
        };
        self.pending.state.datafiles.push(datafile.clone());
        Ok(datafile)
    }

    fn insert_replica(&mut self, replica: NewReplica) -> Result<Replica, IngestError> {
        let replica = Replica {
            id: ReplicaId(self.repo.allocate()),
            datafile: replica.datafile,
            url: replica.url,
            location: replica.location,
            protocol: replica.protocol,
        };
        self.pending.state.replicas.push(replica.clone());
        Ok(replica)
    }
}

fn conflicting_user<'a>(users: &'a [User], candidate: &User) -> Option<&'a User> {
    users.iter().find(|existing| {
        existing.username == candidate.username
            || (candidate.email.is_some() && existing.email == candidate.email)
    })
}
