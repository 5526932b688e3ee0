//! Chunk fetcher
//!
//! Turns an inclusive byte range into a lazy sequence of upstream chunk
//! requests. Upstream offsets are aligned to the chunk size; the first and
//! last chunk are trimmed so the stream covers exactly `[start, end]`.

use crate::pool::{ClientLease, ClientPool};
use crate::{CoreError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use linkstream_upstream::{FileMeta, FileRef, UpstreamClient, UpstreamError, MAX_CHUNK_SIZE};
use rand::Rng;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Ordered byte chunks of one range
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Fetch tuning
#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// Upper bound for one upstream request, clamped to `1..=MAX_CHUNK_SIZE`
    pub chunk_size: usize,
    /// Deadline for a single upstream call
    pub fetch_timeout: Duration,
    /// Attempts per call when the upstream fails transiently
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            fetch_timeout: Duration::from_secs(30),
            retry_attempts: 4,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(4),
        }
    }
}

/// Issues upstream calls on behalf of a lease and classifies their failures
#[derive(Clone)]
pub struct ChunkFetcher {
    pool: ClientPool,
    config: FetchConfig,
}

struct Cursor {
    /// First byte not yet yielded
    next: u64,
    /// Aligned offset of the next upstream request
    fetch_offset: u64,
}

impl ChunkFetcher {
    pub fn new(pool: ClientPool, config: FetchConfig) -> Self {
        let config = FetchConfig {
            chunk_size: config.chunk_size.clamp(1, MAX_CHUNK_SIZE),
            retry_attempts: config.retry_attempts.max(1),
            ..config
        };
        Self { pool, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Lazily stream bytes `[start, end]` of `file` through `lease`.
    ///
    /// The stream is finite and yields nothing past `end`. Dropping it stops
    /// all upstream work; no fetch runs in the background.
    pub fn stream_range(&self, lease: &ClientLease, file: FileRef, start: u64, end: u64) -> ByteStream {
        let chunk = self.config.chunk_size as u64;
        let cursor = Cursor {
            next: start,
            fetch_offset: start - start % chunk,
        };
        let fetcher = self.clone();
        let client = lease.weak_client();
        let client_id = lease.id();

        debug!(client_id, file = %file, start, end, chunk_size = chunk, "streaming range");

        Box::pin(futures::stream::try_unfold(cursor, move |mut cursor| {
            let fetcher = fetcher.clone();
            let client = Weak::clone(&client);
            let file = file.clone();
            async move {
                if cursor.next > end {
                    return Ok(None);
                }
                let offset = cursor.fetch_offset;
                let limit = fetcher.config.chunk_size;
                let data = fetcher
                    .with_retry(&client, client_id, |c| {
                        let file = &file;
                        Box::pin(async move { c.fetch_chunk(file, offset, limit).await })
                    })
                    .await?;

                let lo = cursor.next - offset;
                let hi = (end + 1).min(offset + data.len() as u64) - offset;
                if hi <= lo {
                    return Err(CoreError::Upstream(UpstreamError::Rpc(format!(
                        "upstream ended at offset {} before byte {}",
                        offset + data.len() as u64,
                        end
                    ))));
                }

                cursor.next = offset + hi;
                cursor.fetch_offset = offset + data.len() as u64;
                Ok(Some((data.slice(lo as usize..hi as usize), cursor)))
            }
        }))
    }

    /// Fetch file metadata through `lease`
    #[instrument(skip_all, fields(client_id = lease.id(), file = %file))]
    pub async fn fetch_meta(&self, lease: &ClientLease, file: &FileRef) -> Result<FileMeta> {
        let client = lease.weak_client();
        self.with_retry(&client, lease.id(), |c| {
            Box::pin(async move { c.file_meta(file).await })
        })
        .await
    }

    /// Run one upstream call, retrying transient failures.
    ///
    /// A flood wait or revoked credential is recorded on the pool and
    /// surfaced immediately so the caller can move to another client.
    async fn with_retry<'a, T>(
        &self,
        client: &Weak<dyn UpstreamClient>,
        client_id: usize,
        mut call: impl FnMut(Arc<dyn UpstreamClient>) -> BoxFuture<'a, std::result::Result<T, UpstreamError>>,
    ) -> Result<T> {
        let timeout = self.config.fetch_timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let upstream = client.upgrade().ok_or_else(|| {
                CoreError::ClientUnavailable(format!("client {} was shut down", client_id))
            })?;

            let outcome = match tokio::time::timeout(timeout, call(upstream)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(UpstreamError::Timeout {
                    seconds: timeout.as_secs(),
                }),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let Some(wait) = err.flood_wait() {
                self.pool.mark_flood_wait(client_id, wait);
                return Err(CoreError::FloodWaited {
                    client_id,
                    seconds: wait.as_secs(),
                });
            }

            match err {
                UpstreamError::AuthRevoked(reason) => {
                    self.pool.mark_disabled(client_id, &reason);
                    return Err(CoreError::ClientDisabled { client_id });
                }
                UpstreamError::FileGone(what) | UpstreamError::NotFound(what) => {
                    return Err(CoreError::NotFound(what));
                }
                err if err.is_transient() => {
                    if attempt >= self.config.retry_attempts {
                        warn!(client_id, attempts = attempt, error = %err, "upstream retries exhausted");
                        return Err(CoreError::UpstreamTransient {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        client_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient upstream error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                err => return Err(CoreError::Upstream(err)),
            }
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at the maximum, plus up to 10% jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .retry_base_delay
            .saturating_mul(1u32 << exp)
            .min(self.config.retry_max_delay);
        let jitter_cap = delay.as_millis() as u64 / 10;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::HandleState;
    use crate::test_support::{fetch_config, fixture, pattern};
    use futures::TryStreamExt;
    use proptest::prelude::*;

    async fn collect(stream: ByteStream) -> Result<Vec<Bytes>> {
        stream.try_collect().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_unaligned_range_is_byte_exact() {
        let fx = fixture(&[1], 4);
        let data = pattern(1000);
        let meta = fx.network.put_file("a.bin", None, 1, data.clone());
        let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(64));
        let lease = fx.pool.acquire(None).unwrap();

        let chunks = collect(fetcher.stream_range(&lease, meta.file_ref, 100, 299))
            .await
            .unwrap();
        assert!(chunks.iter().all(|c| c.len() <= 64));
        let body: Vec<u8> = chunks.concat();
        assert_eq!(body, &data[100..300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_fetches_past_end() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(1000));
        let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(64));
        let lease = fx.pool.acquire(None).unwrap();

        let body = collect(fetcher.stream_range(&lease, meta.file_ref, 0, 99)).await.unwrap();
        assert_eq!(body.concat().len(), 100);
        assert_eq!(fx.clients[0].fetch_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(10));
        let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(64));
        let lease = fx.pool.acquire(None).unwrap();
        fx.clients[0].inject_transient(2);

        let body = collect(fetcher.stream_range(&lease, meta.file_ref, 0, 9)).await.unwrap();
        assert_eq!(body.concat(), pattern(10));
        assert_eq!(fx.clients[0].fetch_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_retry_budget() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(10));
        let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(64));
        let lease = fx.pool.acquire(None).unwrap();
        fx.clients[0].inject_transient(10);

        let err = collect(fetcher.stream_range(&lease, meta.file_ref, 0, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UpstreamTransient { attempts: 4, .. }));
        assert_eq!(fx.clients[0].fetch_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_upstream_times_out() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(10));
        let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(64));
        let lease = fx.pool.acquire(None).unwrap();
        fx.clients[0].set_fetch_delay(Some(Duration::from_secs(60)));

        let err = collect(fetcher.stream_range(&lease, meta.file_ref, 0, 9))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::UpstreamTransient {
                source: UpstreamError::Timeout { .. },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_wait_marks_pool_and_aborts() {
        let fx = fixture(&[1, 1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(10));
        let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(64));
        let lease = fx.pool.acquire(None).unwrap();
        fx.clients[lease.id()].inject_flood_wait(30);

        let err = collect(fetcher.stream_range(&lease, meta.file_ref, 0, 9))
            .await
            .unwrap_err();
        assert!(err.is_failover());
        assert!(matches!(
            fx.pool.handle_state(lease.id()),
            Some(HandleState::FloodWaited { .. })
        ));
        assert_eq!(fx.clients[lease.id()].fetch_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_credential_disables_client() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(10));
        let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(64));
        let lease = fx.pool.acquire(None).unwrap();
        fx.clients[0].revoke();

        let err = fetcher.fetch_meta(&lease, &meta.file_ref).await.unwrap_err();
        assert!(matches!(err, CoreError::ClientDisabled { client_id: 0 }));
        assert_eq!(fx.pool.handle_state(0), Some(HandleState::Disabled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_file_is_not_found() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(10));
        fx.network.remove_file(&meta.file_ref);
        let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(64));
        let lease = fx.pool.acquire(None).unwrap();

        let err = collect(fetcher.stream_range(&lease, meta.file_ref, 0, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_shutdown_fails_stream() {
        let fx = fixture(&[1], 4);
        let meta = fx.network.put_file("a.bin", None, 1, pattern(10));
        let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(64));
        let lease = fx.pool.acquire(None).unwrap();
        fx.pool.shutdown();

        let err = collect(fetcher.stream_range(&lease, meta.file_ref, 0, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ClientUnavailable(_)));
    }

    #[test]
    fn test_backoff_schedule_is_bounded() {
        let fx = fixture(&[1], 1);
        let fetcher = ChunkFetcher::new(
            fx.pool,
            FetchConfig {
                retry_base_delay: Duration::from_millis(100),
                retry_max_delay: Duration::from_millis(1000),
                ..Default::default()
            },
        );
        for (attempt, base) in [(1, 100), (2, 200), (3, 400), (4, 800), (5, 1000), (30, 1000)] {
            let delay = fetcher.backoff_delay(attempt).as_millis() as u64;
            assert!(delay >= base && delay <= base + base / 10, "attempt {}: {}", attempt, delay);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_streamed_bytes_match_range(
            len in 1usize..4000,
            chunk in 1usize..700,
            a in any::<prop::sample::Index>(),
            b in any::<prop::sample::Index>(),
        ) {
            let (s, e) = {
                let x = a.index(len) as u64;
                let y = b.index(len) as u64;
                (x.min(y), x.max(y))
            };
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (body, max_chunk) = rt.block_on(async {
                let fx = fixture(&[1], 4);
                let meta = fx.network.put_file("p.bin", None, 1, pattern(len));
                let fetcher = ChunkFetcher::new(fx.pool.clone(), fetch_config(chunk));
                let lease = fx.pool.acquire(None).unwrap();
                let chunks = collect(fetcher.stream_range(&lease, meta.file_ref, s, e))
                    .await
                    .unwrap();
                let max_chunk = chunks.iter().map(Bytes::len).max().unwrap_or(0);
                (chunks.concat(), max_chunk)
            });
            let data = pattern(len);
            prop_assert_eq!(body.len() as u64, e - s + 1);
            prop_assert_eq!(&body[..], &data[s as usize..=e as usize]);
            prop_assert!(max_chunk <= chunk);
        }
    }
}
