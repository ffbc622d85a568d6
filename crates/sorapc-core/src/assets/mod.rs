//! Image asset loader.
//!
//! Remote images (product pictures, avatars) are served from three tiers:
//!
//! - an in-memory LRU of decoded images, looked up synchronously,
//! - a disk cache of encoded bytes,
//! - the network.
//!
//! [`ImageAssetLoader::load`] never blocks: it either hands out a
//! [`VisibleImage`] right away or a [`PendingImage`] that resolves once the
//! image has been read or fetched and decoded on the runtime. Dropping the
//! pending handle aborts that work.

mod disk;
mod fetch;
mod memory;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ImageCacheConfig;
use crate::{Error, Result};
use disk::DiskCache;
use memory::MemoryCache;

pub use fetch::{HttpImageFetcher, ImageFetcher};
pub use memory::DecodedImage;

/// An image that is ready to draw.
///
/// While any handle is alive the image stays in the memory cache.
#[derive(Debug, Clone)]
pub struct VisibleImage {
    uri: String,
    image: Arc<DecodedImage>,
}

impl VisibleImage {
    /// Source URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height
    }

    /// RGBA8 pixels, row-major.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.image.pixels
    }
}

/// An image still being loaded.
///
/// Await it to get the [`VisibleImage`]; drop it to cancel the load.
#[derive(Debug)]
pub struct PendingImage {
    uri: String,
    task: JoinHandle<Result<VisibleImage>>,
}

impl PendingImage {
    /// Source URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Future for PendingImage {
    type Output = Result<VisibleImage>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(e.into()),
        })
    }
}

impl Drop for PendingImage {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of [`ImageAssetLoader::load`].
#[derive(Debug)]
pub enum ImageLoad {
    /// Served from memory.
    Ready(VisibleImage),
    /// Loading in the background.
    Pending(PendingImage),
}

struct Shared {
    memory: Mutex<MemoryCache>,
    disk: DiskCache,
    fetcher: Arc<dyn ImageFetcher>,
}

impl Shared {
    fn lookup(&self, uri: &str) -> Option<VisibleImage> {
        let image = self
            .memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)?;
        Some(VisibleImage {
            uri: uri.to_string(),
            image,
        })
    }

    fn store(&self, uri: String, decoded: DecodedImage) -> VisibleImage {
        let image = self
            .memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&uri, decoded);
        VisibleImage { uri, image }
    }

    async fn resolve(self: Arc<Self>, uri: String) -> Result<VisibleImage> {
        // Another load of the same URI may have finished in the meantime.
        if let Some(visible) = self.lookup(&uri) {
            return Ok(visible);
        }

        if let Some(bytes) = self.disk.read(&uri).await? {
            debug!(%uri, "Image served from disk cache");
            match decode(bytes).await {
                Ok(decoded) => return Ok(self.store(uri, decoded)),
                Err(e) => {
                    warn!(%uri, "Discarding unreadable cached image: {e}");
                    self.disk.remove(&uri).await;
                }
            }
        }

        let bytes = self.fetcher.fetch(&uri).await?;
        if let Err(e) = self.disk.write(&uri, &bytes).await {
            warn!(%uri, "Failed to write image to disk cache: {e}");
        }
        let decoded = decode(bytes).await?;
        Ok(self.store(uri, decoded))
    }
}

async fn decode(bytes: Vec<u8>) -> Result<DecodedImage> {
    tokio::task::spawn_blocking(move || -> Result<DecodedImage> {
        let rgba = image::load_from_memory(&bytes)?.to_rgba8();
        Ok(DecodedImage {
            width: rgba.width(),
            height: rgba.height(),
            pixels: rgba.into_raw(),
        })
    })
    .await?
}

/// Loads remote images through the memory and disk caches.
#[derive(Clone)]
pub struct ImageAssetLoader {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl std::fmt::Debug for ImageAssetLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAssetLoader")
            .field("disk", &self.shared.disk)
            .finish_non_exhaustive()
    }
}

impl ImageAssetLoader {
    /// Creates a loader whose background work runs on `runtime`.
    #[must_use]
    pub fn new(config: &ImageCacheConfig, fetcher: Arc<dyn ImageFetcher>, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                memory: Mutex::new(MemoryCache::new(config.memory_budget_bytes)),
                disk: DiskCache::new(config.resolved_disk_dir(), config.disk_budget_bytes),
                fetcher,
            }),
            runtime,
        }
    }

    /// Load an image.
    ///
    /// Only the memory lookup happens on the calling thread.
    #[must_use]
    pub fn load(&self, uri: &str) -> ImageLoad {
        if let Some(visible) = self.shared.lookup(uri) {
            return ImageLoad::Ready(visible);
        }

        let task = self
            .runtime
            .spawn(Arc::clone(&self.shared).resolve(uri.to_string()));
        ImageLoad::Pending(PendingImage {
            uri: uri.to_string(),
            task,
        })
    }

    /// Decoded bytes currently held in memory.
    #[must_use]
    pub fn memory_usage(&self) -> u64 {
        self.shared
            .memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .used_bytes()
    }

    /// Whether the image is in the memory cache.
    #[must_use]
    pub fn is_cached(&self, uri: &str) -> bool {
        self.shared
            .memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(uri)
    }
}
