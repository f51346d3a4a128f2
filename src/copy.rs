use std::io::Read;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::domain::{DataFile, Replica};
use crate::error::IngestError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    #[default]
    Async,
    Sync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub replica: Replica,
    pub file: DataFile,
}

pub trait CopyDispatcher: Send + Sync {
    fn schedule_copy(&self, request: CopyRequest, mode: CopyMode) -> Result<(), IngestError>;
}

pub trait ReplicaCopier: Send + Sync {
    fn copy(&self, request: &CopyRequest) -> Result<Utf8PathBuf, IngestError>;
}

pub struct WorkerCopyDispatcher<C: ReplicaCopier + 'static> {
    copier: Arc<C>,
    sender: Mutex<Option<Sender<CopyRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: ReplicaCopier + 'static> WorkerCopyDispatcher<C> {
    pub fn new(copier: C) -> Self {
        let copier = Arc::new(copier);
        let (sender, receiver) = mpsc::channel::<CopyRequest>();
        let worker_copier = Arc::clone(&copier);
        let worker = thread::spawn(move || {
            for request in receiver {
                let _ = run_copy(worker_copier.as_ref(), &request);
            }
        });
        Self {
            copier,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("copy worker panicked");
            }
        }
    }
}

impl<C: ReplicaCopier + 'static> Drop for WorkerCopyDispatcher<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<C: ReplicaCopier + 'static> CopyDispatcher for WorkerCopyDispatcher<C> {
    fn schedule_copy(&self, request: CopyRequest, mode: CopyMode) -> Result<(), IngestError> {
        match mode {
            CopyMode::Sync => run_copy(self.copier.as_ref(), &request),
            CopyMode::Async => {
                let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
                let sender = guard
                    .as_ref()
                    .ok_or_else(|| IngestError::CopyFailed("copy worker stopped".to_string()))?;
                sender
                    .send(request)
                    .map_err(|_| IngestError::CopyFailed("copy worker stopped".to_string()))
            }
        }
    }
}

fn run_copy<C: ReplicaCopier + ?Sized>(copier: &C, request: &CopyRequest) -> Result<(), IngestError> {
    match copier.copy(request) {
        Ok(path) => {
            tracing::debug!(replica = %request.replica.id, %path, "replica copied");
            Ok(())
        }
        Err(err) => {
            tracing::error!(replica = %request.replica.id, url = %request.replica.url, %err, "replica copy failed");
            Err(err)
        }
    }
}

#[derive(Clone)]
pub struct HttpReplicaCopier {
    client: Client,
    store: Store,
}

impl HttpReplicaCopier {
    pub fn new(store: Store) -> Result<Self, IngestError> {
        let client = Client::builder()
            .user_agent(format!("atom-ingest/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| IngestError::CopyFailed(err.to_string()))?;
        Ok(Self { client, store })
    }

    fn open(&self, replica: &Replica) -> Result<Box<dyn Read>, IngestError> {
        match replica.protocol.as_str() {
            "file" => {
                let path = replica.url.trim_start_matches("file://");
                let file = std::fs::File::open(path)
                    .map_err(|err| IngestError::CopyFailed(format!("{}: {err}", replica.url)))?;
                Ok(Box::new(file))
            }
            "http" | "https" => {
                let response = self
                    .client
                    .get(&replica.url)
                    .send()
                    .map_err(|err| IngestError::CopyFailed(err.to_string()))?;
                if !response.status().is_success() {
                    return Err(IngestError::CopyFailed(format!(
                        "{} returned status {}",
                        replica.url,
                        response.status().as_u16()
                    )));
                }
                Ok(Box::new(response))
            }
            other => Err(IngestError::CopyFailed(format!(
                "unsupported protocol {other} for {}",
                replica.url
            ))),
        }
    }
}

impl ReplicaCopier for HttpReplicaCopier {
    fn copy(&self, request: &CopyRequest) -> Result<Utf8PathBuf, IngestError> {
        let dest = self.store.replica_path(&request.file);
        if dest.as_std_path().exists() {
            return Ok(dest);
        }

        let mut reader = HashingReader {
            inner: self.open(&request.replica)?,
            hasher: Sha512::new(),
        };
        Store::copy_reader_atomic(&mut reader, &dest)?;
        let digest = format!("{:x}", reader.hasher.finalize());

        if let Some(expected) = request.file.sha512sum.as_deref() {
            if !expected.eq_ignore_ascii_case(&digest) {
                std::fs::remove_file(dest.as_std_path())
                    .map_err(|err| IngestError::Filesystem(err.to_string()))?;
                return Err(IngestError::ChecksumMismatch(request.file.filename.clone()));
            }
        }
        Ok(dest)
    }
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha512,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        Ok(read)
    }
}
