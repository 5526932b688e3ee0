//! # Linkstream Core
//!
//! The streaming engine behind the gateway: it shares a handful of upstream
//! connections between many concurrent HTTP downloads.
//!
//! This crate provides:
//! - **Client pool**: DC-aware, load-spreading client selection with
//!   self-expiring flood-wait cooldowns and permanent disabling
//! - **Chunk fetcher**: lazy, byte-exact range streaming with bounded retries
//! - **Admission control**: per-user and global sliding windows with
//!   priority queues (`owner` > `authorized` > `regular`)
//! - **Metadata cache**: LRU + TTL cache of file metadata with miss coalescing
//! - **Stream sessions**: pool + fetcher glue with one-shot failover and
//!   cancellation-safe release
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │               linkstream-gateway               │
//! ├─────────────────────┬──────────────────────────┤
//! │ AdmissionController │         Streamer         │
//! │  windows + queues   ├─────────────┬────────────┤
//! │                     │MetadataCache│  Session   │
//! │                     │             ├────────────┤
//! │                     │             │ChunkFetcher│
//! │                     ├─────────────┴────────────┤
//! │                     │        ClientPool        │
//! ├─────────────────────┴──────────────────────────┤
//! │              linkstream-upstream               │
//! └────────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod error;
pub mod fetcher;
pub mod meta_cache;
pub mod pool;
pub mod range;
pub mod session;
pub mod window;

#[cfg(test)]
pub(crate) mod test_support;

pub use admission::{
    Admission, AdmissionConfig, AdmissionController, AdmissionSnapshot, PriorityClass, QueueTicket,
};
pub use error::{CoreError, RejectReason, Result};
pub use fetcher::{ByteStream, ChunkFetcher, FetchConfig};
pub use meta_cache::{CacheStats, MetadataCache};
pub use pool::{
    AcquireError, ClientLease, ClientPool, ClientSnapshot, HandleState, PoolConfig, PoolEvent,
};
pub use range::ByteRange;
pub use session::{SessionConfig, SessionState, StreamSession, Streamer};
pub use window::SlidingWindow;
