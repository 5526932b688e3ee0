//! # Linkstream Upstream
//!
//! Interfaces to the messaging network that actually stores the files.
//!
//! This crate provides:
//! - **UpstreamClient**: one authenticated connection; fetches byte chunks and file metadata
//! - **FileStore**: resolves a link's message id to an upstream file reference
//! - **Authorizer**: answers whether a user is on the authorized list
//! - **Memory backend**: an in-process network with fault injection for development and tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            linkstream-core              │
//! ├─────────────────────────────────────────┤
//! │  UpstreamClient │ FileStore │ Authorizer│
//! ├─────────────────┴───────────┴───────────┤
//! │   messaging network  /  MemoryNetwork   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use linkstream_upstream::{Credential, MemoryNetwork, UpstreamClient};
//!
//! let network = MemoryNetwork::new();
//! let meta = network.put_file("clip.mp4", Some("video/mp4"), 2, data);
//! let client = network.connect(Credential::new("token-1"), 2);
//! let chunk = client.fetch_chunk(&meta.file_ref, 0, 1024 * 1024).await?;
//! ```

pub mod error;
pub mod memory;
pub mod types;

pub use error::{Result, UpstreamError};
pub use memory::{MemoryFileStore, MemoryNetwork, MemoryUpstream, StaticAuthorizer};
pub use types::{Credential, FileMeta, FileRef};

use async_trait::async_trait;
use bytes::Bytes;

/// Largest chunk an upstream connection will hand out in one call (1 MiB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// One authenticated connection to the messaging network
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Data center this connection is homed in
    fn dc_id(&self) -> u32;

    /// Fetch up to `limit` bytes of `file` starting at `offset`.
    ///
    /// A short (or empty) result means the end of the file was reached.
    async fn fetch_chunk(&self, file: &FileRef, offset: u64, limit: usize) -> Result<Bytes>;

    /// Fetch size, mime type and storage location of a file
    async fn file_meta(&self, file: &FileRef) -> Result<FileMeta>;
}

/// Persistent mapping from link message ids to file references
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Resolve a message id, `None` if nothing is stored under it
    async fn lookup_file_ref(&self, message_id: u64) -> Result<Option<FileRef>>;
}

/// Authorization subsystem
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `user_id` is on the authorized list
    async fn is_authorized(&self, user_id: &str) -> Result<bool>;
}
