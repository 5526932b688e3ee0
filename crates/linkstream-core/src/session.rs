//! Stream sessions
//!
//! A [`StreamSession`] serves one admitted HTTP request. It acquires a
//! client, drives the chunk fetcher and, when the client gets flood-waited or
//! disabled mid-stream, resumes once from the first unsent byte on a freshly
//! acquired client. Whatever ends the session (completion, failure or the
//! response body being dropped) releases its client.

use crate::fetcher::{ByteStream, ChunkFetcher};
use crate::meta_cache::MetadataCache;
use crate::pool::{ClientLease, ClientPool};
use crate::range::ByteRange;
use crate::{CoreError, Result};
use bytes::Bytes;
use futures::StreamExt;
use linkstream_upstream::{FileMeta, FileRef, UpstreamError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of one request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Received,
    MetaResolved,
    Admitted,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// How long to wait for a client when the pool is blocked
    pub acquire_budget: Duration,
    /// Resumes on a fresh client after a flood wait or revocation
    pub max_failovers: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            acquire_budget: Duration::from_secs(10),
            max_failovers: 1,
        }
    }
}

/// Opens sessions and resolves metadata over a shared pool
#[derive(Clone)]
pub struct Streamer {
    pool: ClientPool,
    fetcher: ChunkFetcher,
    cache: Arc<MetadataCache>,
    config: SessionConfig,
}

impl Streamer {
    pub fn new(pool: ClientPool, fetcher: ChunkFetcher, cache: Arc<MetadataCache>, config: SessionConfig) -> Self {
        Self {
            pool,
            fetcher,
            cache,
            config,
        }
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Metadata for `file`, from the cache or a pooled client
    pub async fn resolve_meta(&self, file: &FileRef) -> Result<FileMeta> {
        self.cache
            .get_or_fetch(file, || self.fetch_meta(file))
            .await
    }

    async fn fetch_meta(&self, file: &FileRef) -> Result<FileMeta> {
        let mut failovers = 0;
        loop {
            let lease = self.pool.acquire_wait(None, self.config.acquire_budget).await?;
            match self.fetcher.fetch_meta(&lease, file).await {
                Err(err) if err.is_failover() => {
                    if failovers >= self.config.max_failovers {
                        return Err(CoreError::ClientUnavailable(err.to_string()));
                    }
                    failovers += 1;
                    warn!(file = %file, client_id = lease.id(), error = %err, "metadata fetch failing over");
                }
                outcome => return outcome,
            }
        }
    }

    /// Start serving `range` of `meta` for an admitted request.
    ///
    /// The first client is acquired here, so a pool with no usable client
    /// fails with `ClientUnavailable` before any response is written.
    pub async fn open(&self, request_id: impl Into<String>, meta: &FileMeta, range: ByteRange) -> Result<StreamSession> {
        let request_id = request_id.into();
        let lease = self
            .pool
            .acquire_wait(Some(meta.preferred_dc_id), self.config.acquire_budget)
            .await
            .inspect_err(|err| warn!(request_id = %request_id, file = %meta.file_ref, error = %err, "no client for stream"))?;

        Ok(StreamSession {
            request_id,
            file: meta.file_ref.clone(),
            range,
            preferred_dc: meta.preferred_dc_id,
            streamer: self.clone(),
            state: SessionState::Admitted,
            bytes_served: 0,
            failovers: 0,
            started_at: Instant::now(),
            lease: Some(lease),
            inner: None,
        })
    }
}

/// One request's byte stream. Holds a lease, never owns the client.
pub struct StreamSession {
    request_id: String,
    file: FileRef,
    range: ByteRange,
    preferred_dc: u32,
    streamer: Streamer,
    state: SessionState,
    bytes_served: u64,
    failovers: u32,
    started_at: Instant,
    lease: Option<ClientLease>,
    inner: Option<ByteStream>,
}

impl StreamSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served
    }

    pub fn range(&self) -> ByteRange {
        self.range
    }

    /// Turn the session into a response body stream
    pub fn into_stream(self) -> ByteStream {
        Box::pin(futures::stream::try_unfold(self, |mut session| async move {
            let next = session.next_chunk().await;
            next.map(|chunk| chunk.map(|chunk| (chunk, session)))
        }))
    }

    /// Next chunk in offset order, `None` once the range is complete
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.state.is_terminal() {
            return Ok(None);
        }

        loop {
            if self.inner.is_none() {
                let start = self.range.start + self.bytes_served;
                if start > self.range.end {
                    self.complete();
                    return Ok(None);
                }
                // the lease taken at open is used first, failovers acquire afresh
                let lease = match self.lease.take() {
                    Some(lease) => lease,
                    None => match self
                        .streamer
                        .pool
                        .acquire_wait(Some(self.preferred_dc), self.streamer.config.acquire_budget)
                        .await
                    {
                        Ok(lease) => lease,
                        Err(err) => return Err(self.fail(err)),
                    },
                };
                debug!(
                    request_id = %self.request_id,
                    client_id = lease.id(),
                    start,
                    end = self.range.end,
                    "session streaming"
                );
                self.inner = Some(self.streamer.fetcher.stream_range(
                    &lease,
                    self.file.clone(),
                    start,
                    self.range.end,
                ));
                self.lease = Some(lease);
                self.state = SessionState::Streaming;
            }

            let next = match self.inner.as_mut() {
                Some(inner) => inner.next().await,
                None => continue,
            };

            match next {
                Some(Ok(chunk)) => {
                    self.bytes_served += chunk.len() as u64;
                    if self.bytes_served >= self.range.len() {
                        // release before the last chunk goes out
                        self.complete();
                    }
                    return Ok(Some(chunk));
                }
                None => {
                    if self.bytes_served < self.range.len() {
                        let err = CoreError::Upstream(UpstreamError::Rpc(format!(
                            "stream ended after {} of {} bytes",
                            self.bytes_served,
                            self.range.len()
                        )));
                        return Err(self.fail(err));
                    }
                    self.complete();
                    return Ok(None);
                }
                Some(Err(err)) if err.is_failover() && self.failovers < self.streamer.config.max_failovers => {
                    self.failovers += 1;
                    warn!(
                        request_id = %self.request_id,
                        error = %err,
                        resume_at = self.range.start + self.bytes_served,
                        "client lost mid-stream, failing over"
                    );
                    self.inner = None;
                    self.lease = None;
                }
                Some(Err(err)) => {
                    let err = match err {
                        CoreError::NotFound(what) => {
                            self.streamer.cache.invalidate(&self.file);
                            CoreError::NotFound(what)
                        }
                        err if err.is_failover() => CoreError::ClientUnavailable(err.to_string()),
                        err => err,
                    };
                    return Err(self.fail(err));
                }
            }
        }
    }

    fn complete(&mut self) {
        self.inner = None;
        self.lease = None;
        self.state = SessionState::Completed;
        info!(
            request_id = %self.request_id,
            file = %self.file,
            bytes = self.bytes_served,
            failovers = self.failovers,
            duration_ms = self.started_at.elapsed().as_millis() as u64,
            "stream completed"
        );
    }

    fn fail(&mut self, err: CoreError) -> CoreError {
        self.inner = None;
        self.lease = None;
        self.state = SessionState::Failed;
        warn!(
            request_id = %self.request_id,
            file = %self.file,
            bytes = self.bytes_served,
            error = %err,
            "stream failed"
        );
        err
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.inner = None;
        self.lease = None;
        self.state = SessionState::Cancelled;
        info!(
            request_id = %self.request_id,
            file = %self.file,
            bytes = self.bytes_served,
            error = %CoreError::Disconnected,
            "stream cancelled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::HandleState;
    use crate::test_support::{fetch_config, fixture, pattern, Fixture};
    use futures::TryStreamExt;

    fn streamer(fx: &Fixture, chunk_size: usize) -> Streamer {
        Streamer::new(
            fx.pool.clone(),
            ChunkFetcher::new(fx.pool.clone(), fetch_config(chunk_size)),
            Arc::new(MetadataCache::new(64, Duration::from_secs(60))),
            SessionConfig {
                acquire_budget: Duration::from_secs(1),
                max_failovers: 1,
            },
        )
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_serves_exact_range() {
        let fx = fixture(&[1], 4);
        let data = pattern(10_000);
        let meta = fx.network.put_file("a.bin", None, 1, data.clone());
        let streamer = streamer(&fx, 1024);

        let range = ByteRange { start: 5000, end: 5999 };
        let chunks: Vec<Bytes> = streamer.open("req-1", &meta, range).await.unwrap().into_stream().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), &data[5000..6000]);
        assert_eq!(fx.pool.active_streams(0), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_chunk_releases_client() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(2000));
        let streamer = streamer(&fx, 1000);

        let mut session = streamer.open("req-1", &meta, ByteRange::full(2000).unwrap()).await.unwrap();
        session.next_chunk().await.unwrap().unwrap();
        assert_eq!(fx.pool.active_streams(0), Some(1));
        session.next_chunk().await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(fx.pool.active_streams(0), Some(0));
        assert_eq!(session.next_chunk().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_releases_client_and_stops_fetching() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(10_000));
        let streamer = streamer(&fx, 1000);
        let before = fx.pool.active_streams(0);

        let mut stream = streamer
            .open("req-1", &meta, ByteRange::full(10_000).unwrap())
            .await
            .unwrap()
            .into_stream();
        stream.next().await.unwrap().unwrap();
        stream.next().await.unwrap().unwrap();
        assert_eq!(fx.pool.active_streams(0), Some(1));
        drop(stream);

        assert_eq!(fx.pool.active_streams(0), before);
        let calls = fx.clients[0].fetch_calls();
        assert_eq!(calls, 2);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(fx.clients[0].fetch_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_wait_resumes_on_other_client() {
        let fx = fixture(&[1, 1], 4);
        let data = pattern(1000);
        let meta = fx.network.put_file("a.bin", None, 1, data.clone());
        let streamer = streamer(&fx, 100);

        let mut session = streamer.open("req-1", &meta, ByteRange::full(1000).unwrap()).await.unwrap();
        let first = session.next_chunk().await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        fx.clients[0].inject_flood_wait(30);

        let mut body = first.to_vec();
        while let Some(chunk) = session.next_chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, data);
        assert_eq!(session.state(), SessionState::Completed);
        assert!(matches!(fx.pool.handle_state(0), Some(HandleState::FloodWaited { .. })));
        assert!(fx.clients[1].fetch_calls() > 0);
        assert_eq!(fx.pool.active_streams(1), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_flood_wait_surfaces_unavailable() {
        let fx = fixture(&[1, 1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(1000));
        let streamer = streamer(&fx, 100);
        fx.clients[0].inject_flood_wait(30);
        fx.clients[1].inject_flood_wait(30);

        let err = streamer
            .open("req-1", &meta, ByteRange::full(1000).unwrap())
            .await
            .unwrap()
            .into_stream()
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ClientUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_without_usable_client_fails() {
        let fx = fixture(&[1, 2], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(1000));
        let streamer = streamer(&fx, 100);
        streamer.resolve_meta(&meta.file_ref).await.unwrap();
        fx.pool.mark_disabled(0, "revoked");
        fx.pool.mark_disabled(1, "revoked");

        let err = streamer
            .open("req-1", &meta, ByteRange::full(1000).unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::ClientUnavailable(_)));
        assert_eq!(fx.clients[0].fetch_calls(), 0);
        assert_eq!(fx.clients[1].fetch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_holds_client_until_dropped() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(1000));
        let streamer = streamer(&fx, 100);

        let session = streamer.open("req-1", &meta, ByteRange::full(1000).unwrap()).await.unwrap();
        assert_eq!(session.state(), SessionState::Admitted);
        assert_eq!(fx.pool.active_streams(0), Some(1));
        drop(session);
        assert_eq!(fx.pool.active_streams(0), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_shutdown_fails_session() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(1000));
        let streamer = streamer(&fx, 100);

        let mut session = streamer.open("req-1", &meta, ByteRange::full(1000).unwrap()).await.unwrap();
        session.next_chunk().await.unwrap();
        fx.pool.shutdown();

        let err = session.next_chunk().await.unwrap_err();
        assert!(matches!(err, CoreError::ClientUnavailable(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.next_chunk().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_file_invalidates_cache() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(1000));
        let streamer = streamer(&fx, 100);
        streamer.resolve_meta(&meta.file_ref).await.unwrap();
        assert_eq!(streamer.cache().len(), 1);

        fx.network.remove_file(&meta.file_ref);
        let err = streamer
            .open("req-1", &meta, ByteRange::full(1000).unwrap())
            .await
            .unwrap()
            .into_stream()
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(streamer.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_is_cached_and_fails_over() {
        let fx = fixture(&[1, 1], 4);
        let meta = fx.network.put_file("a.bin", Some("video/mp4"), 1, pattern(10));
        let streamer = streamer(&fx, 100);
        fx.clients[0].revoke();

        let first = streamer.resolve_meta(&meta.file_ref).await.unwrap();
        let second = streamer.resolve_meta(&meta.file_ref).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.pool.handle_state(0), Some(HandleState::Disabled));
        assert_eq!(fx.clients[1].meta_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_file_is_not_found() {
        let fx = fixture(&[1], 4);
        let streamer = streamer(&fx, 100);
        let err = streamer.resolve_meta(&FileRef::new("doc:missing")).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
