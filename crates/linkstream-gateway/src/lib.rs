//! # Linkstream Gateway
//!
//! HTTP gateway that turns links to files stored in a messaging network into
//! resumable, seekable downloads.
//!
//! This crate provides:
//! - **Link streaming**: `GET`/`HEAD` with single byte ranges, exact headers
//! - **Link secrets**: every link carries a short secret checked against the file
//! - **Identity**: optional JWT bearer tokens, otherwise the peer address
//! - **Admission**: priority classes, sliding windows and queues from `linkstream-core`
//! - **Edge guard**: per-identity burst limiting
//! - **Status**: pool, cache and queue overview
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    HTTP Clients                     │
//! │          (browsers, media players, curl)            │
//! └──────────────────────────┬──────────────────────────┘
//!                            │
//! ┌──────────────────────────▼──────────────────────────┐
//! │                  Linkstream Gateway                 │
//! ├─────────────────────────────────────────────────────┤
//! │  Identity │ Edge Rate Limiter │ Link + Range Parser │
//! ├─────────────────────────────────────────────────────┤
//! │                  Stream Handlers                    │
//! ├─────────────────────────────────────────────────────┤
//! │                  linkstream-core                    │
//! │    (Admission, Client Pool, Fetcher, Metadata)      │
//! ├─────────────────────────────────────────────────────┤
//! │                linkstream-upstream                  │
//! │            (messaging network clients)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod link;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use config::GatewayConfig;
pub use error::{ApiError, ErrorCode};
pub use link::LinkId;
pub use server::{run_server, run_server_with_shutdown, serve};
pub use state::{AppState, Backends, SeededFile};
