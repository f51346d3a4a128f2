use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;

use crate::domain::DataFile;
use crate::error::IngestError;

#[derive(Debug, Clone)]
pub struct Store {
    state_path: Utf8PathBuf,
    data_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, IngestError> {
        let dirs = ProjectDirs::from("org", "mytardis", "atom-ingest").ok_or_else(|| {
            IngestError::Filesystem("unable to resolve data directory".to_string())
        })?;
        let root = Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf())
            .map_err(|_| IngestError::Filesystem("non-utf8 data directory".to_string()))?;
        Ok(Self {
            state_path: root.join("repository.json"),
            data_root: root.join("replicas"),
        })
    }

    pub fn new_with_paths(state_path: Utf8PathBuf, data_root: Utf8PathBuf) -> Self {
        Self {
            state_path,
            data_root,
        }
    }

    pub fn state_path(&self) -> &Utf8Path {
        &self.state_path
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn replica_path(&self, file: &DataFile) -> Utf8PathBuf {
        self.data_root
            .join(file.dataset.to_string())
            .join(file.id.to_string())
            .join(sanitize_filename(&file.filename))
    }

    pub fn ensure_data_root(&self) -> Result<(), IngestError> {
        fs::create_dir_all(self.data_root.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), IngestError> {
        let parent = path
            .parent()
            .ok_or_else(|| IngestError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("atom-ingest")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        std::io::Write::write_all(&mut temp, content)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_reader_atomic<R: std::io::Read>(
        reader: &mut R,
        dest: &Utf8Path,
    ) -> Result<u64, IngestError> {
        let parent = dest
            .parent()
            .ok_or_else(|| IngestError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("atom-ingest-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let written = std::io::copy(reader, &mut temp)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(written)
    }
}

fn sanitize_filename(name: &str) -> String {
    let cleaned = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect::<String>();
    match cleaned.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataFileId, DatasetId};

    #[test]
    fn replica_layout() {
        let store = Store::new_with_paths("/tmp/state.json".into(), "/tmp/data".into());
        let file = DataFile {
            id: DataFileId(12),
            dataset: DatasetId(3),
            filename: "../etc/passwd".to_string(),
            mimetype: None,
            size: None,
            sha512sum: None,
        };
        let path = store.replica_path(&file);
        assert_eq!(path.as_str(), "/tmp/data/3/12/.._etc_passwd");
    }

    #[test]
    fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("nested/state.json")).unwrap();
        Store::write_bytes_atomic(&path, b"one").unwrap();
        Store::write_bytes_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(path.as_std_path()).unwrap(), b"two");
    }
}
