use bytes::Bytes;
use image::{ImageFormat, ImageReader};
use lru::LruCache;
use metrics::{counter, histogram};
use std::fmt;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::http::validate_url;
use crate::source::AssetFetcher;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error("invalid asset locator '{locator}': {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("asset is empty")]
    Empty,

    #[error("asset too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("image could not be decoded: {0}")]
    Undecodable(String),

    #[error("image dimensions {width}x{height} outside 1..={max}")]
    BadDimensions { width: u32, height: u32, max: u32 },

    #[error("prefetcher shut down")]
    Closed,

    #[error(transparent)]
    Fetch(#[from] RemoteError),
}

/// Where an asset lives. Only `http`/`https` URLs are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetLocator(Url);

impl AssetLocator {
    pub fn parse(raw: &str) -> Result<Self, AssetError> {
        validate_url(raw)
            .map(Self)
            .map_err(|e| AssetError::InvalidLocator {
                locator: raw.chars().take(100).collect(),
                reason: e.to_string(),
            })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.0
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for AssetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetState {
    Pending,
    Ready { bytes: Bytes, width: u32, height: u32 },
    Failed { reason: String },
}

impl AssetState {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetLimits {
    pub max_bytes: usize,
    pub max_dimension: u32,
}

impl From<&SyncConfig> for AssetLimits {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_bytes: config.max_asset_bytes,
            max_dimension: config.max_asset_dimension,
        }
    }
}

/// Check that `bytes` is a png/jpeg/webp image of acceptable size, reading
/// only the header. Returns `(width, height)`.
pub fn validate_asset(bytes: &[u8], limits: AssetLimits) -> Result<(u32, u32), AssetError> {
    if bytes.is_empty() {
        return Err(AssetError::Empty);
    }
    if bytes.len() > limits.max_bytes {
        return Err(AssetError::TooLarge {
            size: bytes.len(),
            max: limits.max_bytes,
        });
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AssetError::Undecodable(e.to_string()))?;
    match reader.format() {
        Some(ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP) => {}
        _ => return Err(AssetError::UnsupportedFormat),
    }

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| AssetError::Undecodable(e.to_string()))?;
    let max = limits.max_dimension;
    if width == 0 || height == 0 || width > max || height > max {
        return Err(AssetError::BadDimensions { width, height, max });
    }
    Ok((width, height))
}

struct Shared<F> {
    fetcher: F,
    entries: Mutex<LruCache<AssetLocator, AssetState>>,
    permits: Semaphore,
    limits: AssetLimits,
}

impl<F> Shared<F> {
    fn lock_entries(&self) -> MutexGuard<'_, LruCache<AssetLocator, AssetState>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fire-and-forget fetch and validation of cover images.
///
/// Entries live in a bounded LRU. Fetches run on the ambient tokio runtime,
/// at most `max_concurrent_prefetches` at a time, and never report errors to
/// the caller: a failure only marks the entry `Failed`.
pub struct AssetPrefetcher<F> {
    inner: Arc<Shared<F>>,
}

impl<F> Clone for AssetPrefetcher<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: AssetFetcher> AssetPrefetcher<F> {
    pub fn new(fetcher: F, config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                fetcher,
                entries: Mutex::new(LruCache::new(config.asset_cache_capacity_nonzero())),
                permits: Semaphore::new(config.max_concurrent_prefetches.max(1)),
                limits: AssetLimits::from(config),
            }),
        }
    }

    /// Start fetching `locator` unless it already has an entry. Returns the
    /// task handle when a fetch was started.
    ///
    /// `Failed` entries are left alone; use [`Self::retry`] for those.
    pub fn prefetch(&self, locator: &AssetLocator) -> Option<JoinHandle<()>> {
        {
            let mut entries = self.inner.lock_entries();
            if entries.get(locator).is_some() {
                return None;
            }
            entries.put(locator.clone(), AssetState::Pending);
        }
        self.spawn(locator)
    }

    /// Fetch again an asset whose previous attempt failed.
    pub fn retry(&self, locator: &AssetLocator) -> Option<JoinHandle<()>> {
        {
            let mut entries = self.inner.lock_entries();
            if !entries.get(locator).is_some_and(AssetState::is_failed) {
                return None;
            }
            entries.put(locator.clone(), AssetState::Pending);
        }
        self.spawn(locator)
    }

    pub fn prefetch_all<'a, I>(&self, locators: I) -> Vec<JoinHandle<()>>
    where
        I: IntoIterator<Item = &'a AssetLocator>,
    {
        locators
            .into_iter()
            .filter_map(|locator| self.prefetch(locator))
            .collect()
    }

    /// Current state without touching recency.
    #[must_use]
    pub fn state(&self, locator: &AssetLocator) -> Option<AssetState> {
        self.inner.lock_entries().peek(locator).cloned()
    }

    /// Bytes of a ready asset. Marks the entry as recently used.
    #[must_use]
    pub fn ready_bytes(&self, locator: &AssetLocator) -> Option<Bytes> {
        match self.inner.lock_entries().get(locator) {
            Some(AssetState::Ready { bytes, .. }) => Some(bytes.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn(&self, locator: &AssetLocator) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(locator = %locator, "no async runtime, asset prefetch skipped");
            self.inner.lock_entries().put(
                locator.clone(),
                AssetState::Failed {
                    reason: "no async runtime".to_string(),
                },
            );
            return None;
        };
        counter!("asset.prefetch.requests").increment(1);
        Some(handle.spawn(run(Arc::clone(&self.inner), locator.clone())))
    }
}

#[instrument(skip(shared, locator), fields(locator = %locator))]
async fn run<F: AssetFetcher>(shared: Arc<Shared<F>>, locator: AssetLocator) {
    let start = Instant::now();
    let state = match load(&shared, &locator).await {
        Ok((bytes, width, height)) => {
            histogram!("asset.prefetch.duration_ms").record(start.elapsed().as_secs_f64() * 1000.0);
            debug!(width, height, size = bytes.len(), "asset ready");
            AssetState::Ready {
                bytes,
                width,
                height,
            }
        }
        Err(e) => {
            counter!("asset.prefetch.failures").increment(1);
            warn!(error = %e, "asset prefetch failed");
            AssetState::Failed {
                reason: e.to_string(),
            }
        }
    };
    shared.lock_entries().put(locator, state);
}

async fn load<F: AssetFetcher>(
    shared: &Shared<F>,
    locator: &AssetLocator,
) -> Result<(Bytes, u32, u32), AssetError> {
    let _permit = shared.permits.acquire().await.map_err(|_| AssetError::Closed)?;
    let bytes = shared.fetcher.fetch(locator).await?;

    let limits = shared.limits;
    let header = bytes.clone();
    let (width, height) = tokio::task::spawn_blocking(move || validate_asset(&header, limits))
        .await
        .map_err(|e| AssetError::Undecodable(e.to_string()))??;
    Ok((bytes, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ExtendedColorType, ImageEncoder};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn create_test_png(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![200u8; (width * height * 4) as usize];
        let mut buffer = Vec::new();
        image::codecs::png::PngEncoder::new(&mut buffer)
            .write_image(&pixels, width, height, ExtendedColorType::Rgba8)
            .unwrap();
        buffer
    }

    fn locator(name: &str) -> AssetLocator {
        AssetLocator::parse(&format!("https://covers.example.com/{name}.png")).unwrap()
    }

    #[derive(Default)]
    struct MapFetcher {
        assets: HashMap<String, Bytes>,
        calls: AtomicUsize,
    }

    impl MapFetcher {
        fn with(mut self, name: &str, bytes: Vec<u8>) -> Self {
            self.assets.insert(locator(name).to_string(), Bytes::from(bytes));
            self
        }
    }

    #[async_trait::async_trait]
    impl AssetFetcher for MapFetcher {
        async fn fetch(&self, locator: &AssetLocator) -> Result<Bytes, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.assets
                .get(locator.as_str())
                .cloned()
                .ok_or_else(|| RemoteError::permanent("not found").with_status(404))
        }
    }

    const LIMITS: AssetLimits = AssetLimits {
        max_bytes: 1024 * 1024,
        max_dimension: 64,
    };

    #[test]
    fn test_validate_png_dimensions() {
        assert_eq!(validate_asset(&create_test_png(8, 4), LIMITS), Ok((8, 4)));
    }

    #[test]
    fn test_validate_rejects_garbage_and_limits() {
        assert_eq!(validate_asset(&[], LIMITS), Err(AssetError::Empty));
        assert_eq!(
            validate_asset(b"definitely not an image", LIMITS),
            Err(AssetError::UnsupportedFormat)
        );
        assert!(matches!(
            validate_asset(&create_test_png(65, 1), LIMITS),
            Err(AssetError::BadDimensions { width: 65, .. })
        ));

        let tiny = AssetLimits {
            max_bytes: 10,
            ..LIMITS
        };
        assert!(matches!(
            validate_asset(&create_test_png(2, 2), tiny),
            Err(AssetError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_locator_rejects_non_http() {
        assert!(AssetLocator::parse("file:///tmp/cover.png").is_err());
        assert!(AssetLocator::parse("").is_err());
    }

    #[tokio::test]
    async fn test_prefetch_marks_ready_and_dedups() {
        let fetcher = MapFetcher::default().with("a", create_test_png(4, 3));
        let prefetcher = AssetPrefetcher::new(fetcher, &SyncConfig::default());
        let a = locator("a");

        let handle = prefetcher.prefetch(&a).unwrap();
        assert!(prefetcher.prefetch(&a).is_none());
        handle.await.unwrap();

        assert!(matches!(
            prefetcher.state(&a),
            Some(AssetState::Ready {
                width: 4,
                height: 3,
                ..
            })
        ));
        assert!(prefetcher.prefetch(&a).is_none());
        assert!(prefetcher.ready_bytes(&a).is_some());
        assert_eq!(prefetcher.inner.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_retried() {
        let fetcher = MapFetcher::default().with("bad", b"<html>oops</html>".to_vec());
        let prefetcher = AssetPrefetcher::new(fetcher, &SyncConfig::default());
        let bad = locator("bad");
        let missing = locator("missing");

        for handle in prefetcher.prefetch_all([&bad, &missing]) {
            handle.await.unwrap();
        }

        assert!(prefetcher.state(&bad).unwrap().is_failed());
        assert!(prefetcher.state(&missing).unwrap().is_failed());
        assert!(prefetcher.prefetch(&bad).is_none());
        assert_eq!(prefetcher.inner.fetcher.calls.load(Ordering::SeqCst), 2);

        prefetcher.retry(&bad).unwrap().await.unwrap();
        assert_eq!(prefetcher.inner.fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let fetcher = MapFetcher::default()
            .with("a", create_test_png(1, 1))
            .with("b", create_test_png(1, 1));
        let config = SyncConfig::default().with_asset_cache_capacity(1);
        let prefetcher = AssetPrefetcher::new(fetcher, &config);

        prefetcher.prefetch(&locator("a")).unwrap().await.unwrap();
        prefetcher.prefetch(&locator("b")).unwrap().await.unwrap();

        assert_eq!(prefetcher.len(), 1);
        assert!(prefetcher.state(&locator("a")).is_none());
        assert!(prefetcher.state(&locator("b")).unwrap().is_ready());
    }

    struct GatedFetcher {
        gate: Semaphore,
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
        png: Bytes,
    }

    #[async_trait::async_trait]
    impl AssetFetcher for GatedFetcher {
        async fn fetch(&self, _locator: &AssetLocator) -> Result<Bytes, RemoteError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(self.png.clone())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetches_are_capped() {
        let fetcher = GatedFetcher {
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            png: Bytes::from(create_test_png(2, 2)),
        };
        let config = SyncConfig::default().with_max_concurrent_prefetches(2);
        let prefetcher = AssetPrefetcher::new(fetcher, &config);
        let locators: Vec<_> = (0..6).map(|i| locator(&format!("c{i}"))).collect();

        let handles = prefetcher.prefetch_all(&locators);
        while prefetcher.inner.fetcher.in_flight.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(prefetcher.inner.fetcher.max_seen.load(Ordering::SeqCst), 2);

        prefetcher.inner.fetcher.gate.add_permits(6);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(prefetcher.inner.fetcher.max_seen.load(Ordering::SeqCst), 2);
        assert!(locators
            .iter()
            .all(|l| prefetcher.state(l).is_some_and(|s| s.is_ready())));
    }
}
