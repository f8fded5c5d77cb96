//! Audio resolution engine.
//!
//! Given a content ID, decide where a client should fetch playable audio
//! from. Sources are tried in a fixed priority order and the first one that
//! answers wins:
//!
//! 1. a valid local cache entry (a `stat`, never a download),
//! 2. the relay, when the episode has a relay reference and the relay
//!    passes a bounded health probe,
//! 3. the degraded streaming fallback, which always answers.
//!
//! Resolution never writes to the cache. Populating the cache is a separate,
//! explicit operation ([`ResolutionEngine::materialize_one`] and the
//! sequential bulk [`ResolutionEngine::warm_popular`]) so a cache miss stays
//! cheap for the caller.
//!
//! Everything here is blocking (filesystem plus a blocking HTTP client);
//! async callers run it on the blocking pool.

use std::{
    collections::HashMap,
    io::{self, Read},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheEntry, CacheIndex},
    catalog::{Catalog, ContentRecord},
    error::{ResolveError, ResolveResult},
    fallback::fallback_audio_url,
    relay::Relay,
    security::is_safe_content_id,
};

/// Where a descriptor's audio comes from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioSource {
    LocalCache,
    Relay,
    FallbackStream,
}

/// Result of a resolution. Built only through the constructors below, which
/// keep `cached == (source == LocalCache)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDescriptor {
    pub content_id: String,
    pub audio_url: String,
    pub source: AudioSource,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl AudioDescriptor {
    pub fn local_cache(content_id: &str, audio_url: String, size_bytes: u64) -> Self {
        Self {
            content_id: content_id.to_owned(),
            audio_url,
            source: AudioSource::LocalCache,
            cached: true,
            size_bytes: Some(size_bytes),
        }
    }

    pub fn relay(content_id: &str, audio_url: String) -> Self {
        Self {
            content_id: content_id.to_owned(),
            audio_url,
            source: AudioSource::Relay,
            cached: false,
            size_bytes: None,
        }
    }

    pub fn fallback(content_id: &str) -> Self {
        Self {
            content_id: content_id.to_owned(),
            audio_url: fallback_audio_url(content_id),
            source: AudioSource::FallbackStream,
            cached: false,
            size_bytes: None,
        }
    }
}

/// One link of the priority chain.
pub trait AudioProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` means "not me, ask the next provider". Providers swallow their
    /// own transient failures; only the engine decides what is fatal.
    fn try_resolve(&self, record: &ContentRecord) -> Option<AudioDescriptor>;
}

/// Serves entries whose size is at or above the validity threshold.
struct LocalCacheProvider {
    cache: Arc<dyn CacheIndex>,
    min_valid_bytes: u64,
}

impl AudioProvider for LocalCacheProvider {
    fn name(&self) -> &'static str {
        "local-cache"
    }

    fn try_resolve(&self, record: &ContentRecord) -> Option<AudioDescriptor> {
        match valid_size(self.cache.as_ref(), &record.id, self.min_valid_bytes) {
            Ok(Some(size)) => Some(AudioDescriptor::local_cache(
                &record.id,
                self.cache.public_url(&record.id),
                size,
            )),
            Ok(None) => None,
            Err(err) => {
                warn!(id = %record.id, error = %format!("{err:#}"), "cache stat failed; treating as miss");
                None
            }
        }
    }
}

struct RelayProvider {
    relay: Arc<dyn Relay>,
}

impl AudioProvider for RelayProvider {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn try_resolve(&self, record: &ContentRecord) -> Option<AudioDescriptor> {
        let remote_ref = record.remote_ref.as_deref()?;
        if !self.relay.health_check() {
            warn!(id = %record.id, "relay unavailable; falling back");
            return None;
        }
        Some(AudioDescriptor::relay(
            &record.id,
            self.relay.stream_url(remote_ref),
        ))
    }
}

struct FallbackProvider;

impl AudioProvider for FallbackProvider {
    fn name(&self) -> &'static str {
        "fallback-stream"
    }

    fn try_resolve(&self, record: &ContentRecord) -> Option<AudioDescriptor> {
        Some(AudioDescriptor::fallback(&record.id))
    }
}

/// Returns the entry size when it exists and is large enough to serve.
fn valid_size(cache: &dyn CacheIndex, id: &str, min_valid_bytes: u64) -> anyhow::Result<Option<u64>> {
    Ok(cache.stat(id)?.filter(|size| *size >= min_valid_bytes))
}

/// Outcome of a single materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializeOutcome {
    pub content_id: String,
    pub cached: bool,
    pub size_bytes: u64,
    /// False when a valid entry already existed and nothing was fetched.
    pub downloaded: bool,
}

/// Selection rule for bulk warming: duration strictly inside the window,
/// and a relay reference present. Records without a reference are not
/// candidates at all, so they never count toward `total_considered`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmPolicy {
    /// Exclusive lower bound on duration.
    pub min_duration_secs: u64,
    /// Exclusive upper bound on duration.
    pub max_duration_secs: u64,
    pub batch_size: usize,
}

impl Default for WarmPolicy {
    fn default() -> Self {
        Self {
            min_duration_secs: 60,
            max_duration_secs: 3600,
            batch_size: 20,
        }
    }
}

impl WarmPolicy {
    /// Episodes without a relay reference can never be materialized, so
    /// they never take a batch slot.
    pub fn matches(&self, record: &ContentRecord) -> bool {
        record.duration_seconds > self.min_duration_secs
            && record.duration_seconds < self.max_duration_secs
            && record.remote_ref.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmFailure {
    pub content_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmSummary {
    pub cached_count: usize,
    pub failed_count: usize,
    pub total_considered: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<WarmFailure>,
}

/// Diagnostic listing of the cache directory. Counts every entry, including
/// ones too small for [`ResolutionEngine::resolve`] to serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub file_count: usize,
    pub total_size_bytes: u64,
    pub files: Vec<CacheEntry>,
}

/// Rejects relay bodies that end before reaching the validity threshold, so
/// a truncated download fails the write instead of landing in the cache.
struct MinLengthReader<R> {
    inner: R,
    read: u64,
    min: u64,
}

impl<R: Read> Read for MinLengthReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() && self.read < self.min {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "relay returned {} bytes, below the {} byte minimum",
                    self.read, self.min
                ),
            ));
        }
        self.read += n as u64;
        Ok(n)
    }
}

pub struct ResolutionEngine {
    catalog: Arc<dyn Catalog>,
    cache: Arc<dyn CacheIndex>,
    relay: Arc<dyn Relay>,
    providers: Vec<Box<dyn AudioProvider>>,
    min_valid_bytes: u64,
    /// Per-ID locks held while materializing.
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResolutionEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        cache: Arc<dyn CacheIndex>,
        relay: Arc<dyn Relay>,
        min_valid_bytes: u64,
    ) -> Self {
        let providers: Vec<Box<dyn AudioProvider>> = vec![
            Box::new(LocalCacheProvider {
                cache: cache.clone(),
                min_valid_bytes,
            }),
            Box::new(RelayProvider {
                relay: relay.clone(),
            }),
            Box::new(FallbackProvider),
        ];
        Self {
            catalog,
            cache,
            relay,
            providers,
            min_valid_bytes,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Catalog lookup. Unsafe IDs are reported as missing without touching
    /// the catalog.
    pub fn lookup(&self, id: &str) -> ResolveResult<ContentRecord> {
        if !is_safe_content_id(id) {
            return Err(ResolveError::NotFound(id.to_owned()));
        }
        self.catalog
            .get(id)
            .map_err(ResolveError::Catalog)?
            .ok_or_else(|| ResolveError::NotFound(id.to_owned()))
    }

    pub fn resolve(&self, id: &str) -> ResolveResult<AudioDescriptor> {
        let record = self.lookup(id)?;
        Ok(self.resolve_record(&record))
    }

    /// Runs the provider chain for an already looked-up record.
    pub fn resolve_record(&self, record: &ContentRecord) -> AudioDescriptor {
        for provider in &self.providers {
            if let Some(descriptor) = provider.try_resolve(record) {
                debug!(id = %record.id, provider = provider.name(), "audio resolved");
                return descriptor;
            }
        }
        AudioDescriptor::fallback(&record.id)
    }

    /// Downloads `id` from the relay into the cache unless a valid entry is
    /// already there. Concurrent calls for the same ID are serialized; the
    /// later caller finds the entry the first one wrote.
    ///
    /// The cache is checked before the remote reference, so a record without
    /// one still reports its existing valid entry; only a real download
    /// requires the reference (`NoSourceAvailable` otherwise).
    pub fn materialize_one(&self, id: &str) -> ResolveResult<MaterializeOutcome> {
        let record = self.lookup(id)?;
        let slot = self.in_flight_slot(&record.id);
        let result = {
            let _guard = slot.lock();
            self.materialize_locked(&record)
        };
        self.release_in_flight_slot(&record.id, slot);
        result
    }

    fn materialize_locked(&self, record: &ContentRecord) -> ResolveResult<MaterializeOutcome> {
        let id = record.id.as_str();
        if let Some(size) = valid_size(self.cache.as_ref(), id, self.min_valid_bytes)
            .map_err(ResolveError::Cache)?
        {
            debug!(id, size, "already cached");
            return Ok(MaterializeOutcome {
                content_id: id.to_owned(),
                cached: true,
                size_bytes: size,
                downloaded: false,
            });
        }

        let remote_ref = record
            .remote_ref
            .as_deref()
            .ok_or_else(|| ResolveError::NoSourceAvailable(id.to_owned()))?;

        let download_failed = |err: anyhow::Error| ResolveError::DownloadFailed {
            id: id.to_owned(),
            reason: format!("{err:#}"),
        };

        info!(id, remote_ref, "materializing from relay");
        let stream = self.relay.fetch_stream(remote_ref).map_err(download_failed)?;
        let mut reader = MinLengthReader {
            inner: stream,
            read: 0,
            min: self.min_valid_bytes,
        };
        let size = self.cache.put(id, &mut reader).map_err(download_failed)?;
        info!(id, size, "cached");

        Ok(MaterializeOutcome {
            content_id: id.to_owned(),
            cached: true,
            size_bytes: size,
            downloaded: true,
        })
    }

    fn in_flight_slot(&self, id: &str) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .entry(id.to_owned())
            .or_default()
            .clone()
    }

    fn release_in_flight_slot(&self, id: &str, slot: Arc<Mutex<()>>) {
        let mut table = self.in_flight.lock();
        // One reference in the table plus ours: nobody else is waiting.
        if Arc::strong_count(&slot) == 2 {
            table.remove(id);
        }
    }

    /// Materializes up to `policy.batch_size` matching episodes one after the
    /// other. Individual failures are counted, never fatal.
    pub fn warm_popular(&self, policy: &WarmPolicy) -> ResolveResult<WarmSummary> {
        let candidates: Vec<ContentRecord> = self
            .catalog
            .list()
            .map_err(ResolveError::Catalog)?
            .into_iter()
            .filter(|record| policy.matches(record))
            .take(policy.batch_size)
            .collect();

        let mut summary = WarmSummary {
            total_considered: candidates.len(),
            ..WarmSummary::default()
        };
        info!(candidates = candidates.len(), "warming cache");

        for (index, record) in candidates.iter().enumerate() {
            match self.materialize_one(&record.id) {
                Ok(outcome) => {
                    summary.cached_count += 1;
                    info!(
                        id = %record.id,
                        size = outcome.size_bytes,
                        downloaded = outcome.downloaded,
                        "[{}/{}] cached",
                        index + 1,
                        candidates.len()
                    );
                }
                Err(err) => {
                    summary.failed_count += 1;
                    warn!(id = %record.id, error = %err, "[{}/{}] failed", index + 1, candidates.len());
                    summary.failures.push(WarmFailure {
                        content_id: record.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(summary)
    }

    pub fn cache_status(&self) -> ResolveResult<CacheStatus> {
        let files = self.cache.list().map_err(ResolveError::Cache)?;
        Ok(CacheStatus {
            file_count: files.len(),
            total_size_bytes: files.iter().map(|entry| entry.size_bytes).sum(),
            files,
        })
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FsCacheIndex;
    use crate::catalog::JsonCatalog;
    use anyhow::{Result, anyhow};
    use std::{
        fs,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
        time::Duration,
    };
    use tempfile::{TempDir, tempdir};

    const THRESHOLD: u64 = 100_000;

    #[derive(Default)]
    struct FakeCatalog {
        records: Vec<ContentRecord>,
        lookups: AtomicUsize,
    }

    impl Catalog for FakeCatalog {
        fn get(&self, id: &str) -> Result<Option<ContentRecord>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.iter().find(|r| r.id == id).cloned())
        }

        fn list(&self) -> Result<Vec<ContentRecord>> {
            Ok(self.records.clone())
        }
    }

    #[derive(Default)]
    struct FakeRelay {
        healthy: AtomicBool,
        health_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
        fetch_delay: Option<Duration>,
        bodies: Mutex<HashMap<String, Result<Vec<u8>, String>>>,
    }

    impl FakeRelay {
        fn healthy() -> Self {
            let relay = Self::default();
            relay.healthy.store(true, Ordering::SeqCst);
            relay
        }

        fn with_body(self, remote_ref: &str, body: Vec<u8>) -> Self {
            self.bodies.lock().insert(remote_ref.into(), Ok(body));
            self
        }

        fn with_failure(self, remote_ref: &str) -> Self {
            self.bodies
                .lock()
                .insert(remote_ref.into(), Err("connection reset".into()));
            self
        }
    }

    impl Relay for FakeRelay {
        fn health_check(&self) -> bool {
            self.health_calls.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }

        fn fetch_stream(&self, remote_ref: &str) -> Result<Box<dyn Read + Send>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.fetch_delay {
                thread::sleep(delay);
            }
            match self.bodies.lock().get(remote_ref).cloned() {
                Some(Ok(body)) => Ok(Box::new(io::Cursor::new(body))),
                Some(Err(reason)) => Err(anyhow!(reason)),
                None => Err(anyhow!("unknown reference {remote_ref}")),
            }
        }

        fn stream_url(&self, remote_ref: &str) -> String {
            format!("http://127.0.0.1:8765/stream/{remote_ref}")
        }
    }

    /// Filesystem cache that counts `stat` calls.
    struct CountingCache {
        inner: FsCacheIndex,
        stats: AtomicUsize,
    }

    impl CacheIndex for CountingCache {
        fn stat(&self, id: &str) -> Result<Option<u64>> {
            self.stats.fetch_add(1, Ordering::SeqCst);
            self.inner.stat(id)
        }

        fn put(&self, id: &str, reader: &mut dyn Read) -> Result<u64> {
            self.inner.put(id, reader)
        }

        fn list(&self) -> Result<Vec<CacheEntry>> {
            self.inner.list()
        }

        fn public_url(&self, id: &str) -> String {
            self.inner.public_url(id)
        }
    }

    fn record(id: &str, duration_seconds: u64, remote_ref: Option<&str>) -> ContentRecord {
        ContentRecord {
            id: id.into(),
            display_title: format!("Episode {id}"),
            uploader: "@show".into(),
            category: "General".into(),
            duration_seconds,
            created_at: None,
            youtube_url: None,
            remote_ref: remote_ref.map(str::to_owned),
        }
    }

    struct Harness {
        _temp: TempDir,
        catalog: Arc<FakeCatalog>,
        cache: Arc<CountingCache>,
        relay: Arc<FakeRelay>,
        engine: Arc<ResolutionEngine>,
    }

    impl Harness {
        fn new(records: Vec<ContentRecord>, relay: FakeRelay) -> Self {
            let temp = tempdir().unwrap();
            let catalog = Arc::new(FakeCatalog {
                records,
                ..FakeCatalog::default()
            });
            let cache = Arc::new(CountingCache {
                inner: FsCacheIndex::open(temp.path(), "m4a").unwrap(),
                stats: AtomicUsize::new(0),
            });
            let relay = Arc::new(relay);
            let engine = Arc::new(ResolutionEngine::new(
                catalog.clone(),
                cache.clone(),
                relay.clone(),
                THRESHOLD,
            ));
            Self {
                _temp: temp,
                catalog,
                cache,
                relay,
                engine,
            }
        }

        fn write_cache_file(&self, id: &str, size: usize) {
            fs::write(self.cache.inner.path_for(id).unwrap(), vec![1u8; size]).unwrap();
        }
    }

    fn abc() -> Vec<ContentRecord> {
        vec![record("abc", 120, Some("msg42"))]
    }

    #[test]
    fn falls_back_when_relay_is_down() {
        let h = Harness::new(abc(), FakeRelay::default());
        let descriptor = h.engine.resolve("abc").unwrap();
        assert_eq!(
            descriptor,
            AudioDescriptor {
                content_id: "abc".into(),
                audio_url: "/api/youtube-audio/abc".into(),
                source: AudioSource::FallbackStream,
                cached: false,
                size_bytes: None,
            }
        );
        assert_eq!(h.relay.health_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn uses_relay_when_healthy() {
        let h = Harness::new(abc(), FakeRelay::healthy());
        let descriptor = h.engine.resolve("abc").unwrap();
        assert_eq!(descriptor.source, AudioSource::Relay);
        assert!(!descriptor.cached);
        assert_eq!(descriptor.audio_url, "http://127.0.0.1:8765/stream/msg42");
    }

    #[test]
    fn valid_cache_entry_wins_without_contacting_relay() {
        let h = Harness::new(abc(), FakeRelay::healthy());
        h.write_cache_file("abc", 5_000_000);

        let descriptor = h.engine.resolve("abc").unwrap();
        assert_eq!(descriptor.source, AudioSource::LocalCache);
        assert!(descriptor.cached);
        assert_eq!(descriptor.size_bytes, Some(5_000_000));
        assert_eq!(descriptor.audio_url, "/audio_cache/abc.m4a");
        assert_eq!(h.relay.health_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.relay.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_remote_ref_skips_relay_entirely() {
        let h = Harness::new(vec![record("abc", 120, None)], FakeRelay::healthy());
        let descriptor = h.engine.resolve("abc").unwrap();
        assert_eq!(descriptor.source, AudioSource::FallbackStream);
        assert_eq!(h.relay.health_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_id_is_not_found_without_io() {
        let h = Harness::new(abc(), FakeRelay::healthy());
        let err = h.engine.resolve("nope").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(ref id) if id == "nope"));
        assert_eq!(h.cache.stats.load(Ordering::SeqCst), 0);
        assert_eq!(h.relay.health_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsafe_id_never_reaches_catalog() {
        let h = Harness::new(abc(), FakeRelay::healthy());
        let err = h.engine.resolve("../abc").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
        assert_eq!(h.catalog.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn undersized_entry_is_a_miss_but_still_listed() {
        let h = Harness::new(abc(), FakeRelay::default());
        h.write_cache_file("abc", 10);

        let descriptor = h.engine.resolve("abc").unwrap();
        assert_eq!(descriptor.source, AudioSource::FallbackStream);

        let status = h.engine.cache_status().unwrap();
        assert_eq!(status.file_count, 1);
        assert_eq!(status.total_size_bytes, 10);
        assert_eq!(status.files[0].id, "abc");
    }

    #[test]
    fn threshold_is_inclusive() {
        let h = Harness::new(abc(), FakeRelay::default());
        h.write_cache_file("abc", THRESHOLD as usize);
        assert_eq!(h.engine.resolve("abc").unwrap().source, AudioSource::LocalCache);
    }

    #[test]
    fn resolve_never_writes_to_cache() {
        let h = Harness::new(
            abc(),
            FakeRelay::healthy().with_body("msg42", vec![0u8; 200_000]),
        );
        h.engine.resolve("abc").unwrap();
        assert_eq!(h.engine.cache_status().unwrap().file_count, 0);
        assert_eq!(h.relay.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn materialize_is_idempotent() {
        let h = Harness::new(
            abc(),
            FakeRelay::healthy().with_body("msg42", vec![3u8; 150_000]),
        );

        let first = h.engine.materialize_one("abc").unwrap();
        assert!(first.cached);
        assert!(first.downloaded);
        assert_eq!(first.size_bytes, 150_000);

        let second = h.engine.materialize_one("abc").unwrap();
        assert!(second.cached);
        assert!(!second.downloaded);
        assert_eq!(h.relay.fetch_calls.load(Ordering::SeqCst), 1);

        assert_eq!(h.engine.resolve("abc").unwrap().source, AudioSource::LocalCache);
        assert_eq!(h.engine.in_flight_len(), 0);
    }

    #[test]
    fn materialize_without_remote_ref_is_rejected() {
        let h = Harness::new(vec![record("abc", 120, None)], FakeRelay::healthy());
        let err = h.engine.materialize_one("abc").unwrap_err();
        assert!(matches!(err, ResolveError::NoSourceAvailable(_)));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn materialize_unknown_id_is_not_found() {
        let h = Harness::new(abc(), FakeRelay::healthy());
        let err = h.engine.materialize_one("zzz").unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn transport_failure_leaves_no_entry() {
        let h = Harness::new(abc(), FakeRelay::healthy().with_failure("msg42"));
        let err = h.engine.materialize_one("abc").unwrap_err();
        assert!(matches!(err, ResolveError::DownloadFailed { .. }));
        assert_eq!(h.engine.cache_status().unwrap().file_count, 0);
        assert_eq!(h.engine.resolve("abc").unwrap().source, AudioSource::Relay);
    }

    #[test]
    fn truncated_body_is_not_persisted() {
        let h = Harness::new(
            abc(),
            FakeRelay::healthy().with_body("msg42", vec![0u8; 500]),
        );
        let err = h.engine.materialize_one("abc").unwrap_err();
        assert!(err.to_string().contains("below the 100000 byte minimum"));
        assert_eq!(h.engine.cache_status().unwrap().file_count, 0);
    }

    #[test]
    fn undersized_entry_is_replaced_by_materialize() {
        let h = Harness::new(
            abc(),
            FakeRelay::healthy().with_body("msg42", vec![0u8; 120_000]),
        );
        h.write_cache_file("abc", 10);
        let outcome = h.engine.materialize_one("abc").unwrap();
        assert!(outcome.downloaded);
        assert_eq!(h.cache.inner.stat("abc").unwrap(), Some(120_000));
    }

    // Overlapping materializations of one ID must not both write the entry:
    // the second caller waits on the per-ID lock and reuses the first download.
    #[test]
    fn concurrent_materializations_share_one_download() {
        let relay = FakeRelay {
            fetch_delay: Some(Duration::from_millis(200)),
            ..FakeRelay::healthy().with_body("msg42", vec![9u8; 150_000])
        };
        let h = Harness::new(abc(), relay);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = h.engine.clone();
                thread::spawn(move || engine.materialize_one("abc"))
            })
            .collect();
        let outcomes: Vec<MaterializeOutcome> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();

        assert!(outcomes.iter().all(|o| o.cached && o.size_bytes == 150_000));
        assert_eq!(outcomes.iter().filter(|o| o.downloaded).count(), 1);
        assert_eq!(h.relay.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.in_flight_len(), 0);
    }

    #[test]
    fn warm_popular_counts_partial_failures() {
        let relay = FakeRelay::healthy()
            .with_body("r1", vec![0u8; 100_000])
            .with_failure("r2")
            .with_body("r3", vec![0u8; 100_000]);
        let h = Harness::new(
            vec![
                record("one", 120, Some("r1")),
                record("two", 300, Some("r2")),
                record("three", 900, Some("r3")),
            ],
            relay,
        );

        let summary = h.engine.warm_popular(&WarmPolicy::default()).unwrap();
        assert_eq!(summary.cached_count, 2);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.total_considered, 3);
        assert_eq!(summary.failures[0].content_id, "two");
        assert_eq!(h.engine.cache_status().unwrap().file_count, 2);
    }

    #[test]
    fn warm_policy_filters_and_caps_batch() {
        let mut records = vec![
            record("short", 60, Some("r")),
            record("long", 3600, Some("r")),
            record("unsourced", 600, None),
        ];
        for i in 0..25 {
            records.push(record(&format!("ok{i}"), 61 + i, Some("r")));
        }
        let h = Harness::new(records, FakeRelay::healthy());

        let summary = h.engine.warm_popular(&WarmPolicy::default()).unwrap();
        assert_eq!(summary.total_considered, 20);
        assert_eq!(summary.failed_count, 20);
        assert!(summary.failures.iter().all(|f| f.content_id.starts_with("ok")));
        assert_eq!(h.relay.fetch_calls.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn json_catalog_keys_drive_warming_and_resolution() {
        let temp = tempdir().unwrap();
        let catalog_path = temp.path().join("podcasts.json");
        fs::write(
            &catalog_path,
            r#"{"abc": {"id": "ABC", "duration": 120, "telegram_message_id": "m1"}}"#,
        )
        .unwrap();
        let cache = FsCacheIndex::open(temp.path().join("cache"), "m4a").unwrap();
        let engine = ResolutionEngine::new(
            Arc::new(JsonCatalog::new(&catalog_path)),
            Arc::new(cache),
            Arc::new(FakeRelay::default().with_body("m1", vec![0u8; 100_000])),
            THRESHOLD,
        );

        let summary = engine.warm_popular(&WarmPolicy::default()).unwrap();
        assert_eq!(summary.cached_count, 1);
        assert!(summary.failures.is_empty());

        let descriptor = engine.resolve("abc").unwrap();
        assert_eq!(descriptor.content_id, "abc");
        assert_eq!(descriptor.source, AudioSource::LocalCache);
        assert_eq!(descriptor.audio_url, "/audio_cache/abc.m4a");
    }

    #[test]
    fn descriptor_serializes_source_tag() {
        let json = serde_json::to_value(AudioDescriptor::fallback("abc")).unwrap();
        assert_eq!(json["source"], "FALLBACK_STREAM");
        assert_eq!(json["cached"], false);
        assert!(json.get("size_bytes").is_none());

        let json =
            serde_json::to_value(AudioDescriptor::local_cache("abc", "/audio_cache/abc.m4a".into(), 5))
                .unwrap();
        assert_eq!(json["source"], "LOCAL_CACHE");
        assert_eq!(json["size_bytes"], 5);
    }
}
