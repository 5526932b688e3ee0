//! In-memory messaging network for development and testing

use crate::{Authorizer, Credential, FileMeta, FileRef, FileStore, Result, UpstreamClient, UpstreamError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
struct StoredFile {
    meta: FileMeta,
    data: Bytes,
}

/// Shared file storage that every `MemoryUpstream` connection talks to
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    files: Arc<DashMap<FileRef, StoredFile>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self {
            files: Arc::new(DashMap::new()),
        }
    }

    /// Store a file and return its metadata
    pub fn put_file(
        &self,
        file_name: &str,
        mime_type: Option<&str>,
        dc_id: u32,
        data: impl Into<Bytes>,
    ) -> FileMeta {
        let data = data.into();
        let unique_id = uuid::Uuid::new_v4().simple().to_string();
        let meta = FileMeta {
            file_ref: FileRef::new(format!("doc:{}", unique_id)),
            size_bytes: data.len() as u64,
            mime_type: mime_type.map(str::to_string),
            preferred_dc_id: dc_id,
            file_name: Some(file_name.to_string()),
            unique_id,
        };
        self.files.insert(
            meta.file_ref.clone(),
            StoredFile {
                meta: meta.clone(),
                data,
            },
        );
        meta
    }

    /// Delete a file; later fetches report `FileGone`
    pub fn remove_file(&self, file_ref: &FileRef) -> bool {
        self.files.remove(file_ref).is_some()
    }

    /// Number of stored files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if the network holds no files
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Open a connection authenticated with `credential`, homed in `dc_id`
    pub fn connect(&self, credential: Credential, dc_id: u32) -> MemoryUpstream {
        MemoryUpstream {
            network: self.clone(),
            credential,
            dc_id,
            faults: Mutex::new(VecDeque::new()),
            revoked: AtomicBool::new(false),
            fetch_delay: Mutex::new(None),
            fetch_calls: AtomicU64::new(0),
            meta_calls: AtomicU64::new(0),
        }
    }
}

/// A scripted failure for the next fetch call
#[derive(Clone, Debug)]
enum Fault {
    FloodWait(u64),
    Transient,
}

/// One connection to a `MemoryNetwork`
pub struct MemoryUpstream {
    network: MemoryNetwork,
    credential: Credential,
    dc_id: u32,
    faults: Mutex<VecDeque<Fault>>,
    revoked: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
    fetch_calls: AtomicU64,
    meta_calls: AtomicU64,
}

impl MemoryUpstream {
    /// Credential this connection authenticated with
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Make the next fetch answer with a flood wait
    pub fn inject_flood_wait(&self, seconds: u64) {
        self.faults.lock().push_back(Fault::FloodWait(seconds));
    }

    /// Make the next `count` fetches fail with a transient error
    pub fn inject_transient(&self, count: usize) {
        let mut faults = self.faults.lock();
        for _ in 0..count {
            faults.push_back(Fault::Transient);
        }
    }

    /// Permanently revoke this connection's credential
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// Delay every fetch by `delay` (simulates a slow link)
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock() = delay;
    }

    /// Number of `fetch_chunk` calls served, including failed ones
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of `file_meta` calls served
    pub fn meta_calls(&self) -> u64 {
        self.meta_calls.load(Ordering::SeqCst)
    }

    fn check_revoked(&self) -> Result<()> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(UpstreamError::AuthRevoked(self.credential.label()));
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamClient for MemoryUpstream {
    fn dc_id(&self) -> u32 {
        self.dc_id
    }

    async fn fetch_chunk(&self, file: &FileRef, offset: u64, limit: usize) -> Result<Bytes> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_revoked()?;

        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(Fault::FloodWait(seconds)) => return Err(UpstreamError::FloodWait { seconds }),
            Some(Fault::Transient) => {
                return Err(UpstreamError::Connection("simulated connection reset".into()))
            }
            None => {}
        }

        let data = self
            .network
            .files
            .get(file)
            .map(|entry| entry.value().data.clone())
            .ok_or_else(|| UpstreamError::FileGone(file.to_string()))?;

        let len = data.len() as u64;
        if offset >= len {
            return Ok(Bytes::new());
        }
        let end = len.min(offset.saturating_add(limit as u64));
        debug!(file = %file, offset, limit, returned = end - offset, "memory fetch");
        Ok(data.slice(offset as usize..end as usize))
    }

    async fn file_meta(&self, file: &FileRef) -> Result<FileMeta> {
        self.meta_calls.fetch_add(1, Ordering::SeqCst);
        self.check_revoked()?;
        self.network
            .files
            .get(file)
            .map(|entry| entry.value().meta.clone())
            .ok_or_else(|| UpstreamError::NotFound(file.to_string()))
    }
}

/// In-memory message id -> file reference table
#[derive(Clone, Default)]
pub struct MemoryFileStore {
    links: Arc<DashMap<u64, FileRef>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `file_ref` under `message_id`
    pub fn insert(&self, message_id: u64, file_ref: FileRef) {
        self.links.insert(message_id, file_ref);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn lookup_file_ref(&self, message_id: u64) -> Result<Option<FileRef>> {
        Ok(self.links.get(&message_id).map(|r| r.value().clone()))
    }
}

/// Authorizer backed by a fixed set of user ids
#[derive(Clone, Default)]
pub struct StaticAuthorizer {
    users: Arc<parking_lot::RwLock<HashSet<String>>>,
}

impl StaticAuthorizer {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: Arc::new(parking_lot::RwLock::new(
                users.into_iter().map(Into::into).collect(),
            )),
        }
    }

    pub fn authorize(&self, user_id: impl Into<String>) {
        self.users.write().insert(user_id.into());
    }

    pub fn revoke(&self, user_id: &str) {
        self.users.write().remove(user_id);
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn is_authorized(&self, user_id: &str) -> Result<bool> {
        Ok(self.users.read().contains(user_id))
    }
}
