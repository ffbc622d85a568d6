//! In-memory LRU of decoded images.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

/// A decoded RGBA8 image.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Row-major RGBA8 pixels.
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    /// Bytes the decoded image occupies (`width * height * 4`).
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * 4
    }
}

#[derive(Debug)]
struct Entry {
    image: Arc<DecodedImage>,
    last_access: u64,
}

impl Entry {
    /// Live handles hold extra references to the image.
    fn is_pinned(&self) -> bool {
        Arc::strong_count(&self.image) > 1
    }
}

/// Byte-bounded LRU keyed by URI.
///
/// Recency is a monotonic access tick, not wall-clock time. Entries still
/// referenced by a handle outside the cache are never evicted, so the cache
/// may exceed its budget while everything in it is on screen.
#[derive(Debug)]
pub(crate) struct MemoryCache {
    entries: HashMap<String, Entry>,
    budget_bytes: u64,
    used_bytes: u64,
    tick: u64,
}

impl MemoryCache {
    pub(crate) fn new(budget_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            budget_bytes,
            used_bytes: 0,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up an image and mark it as most recently used.
    pub(crate) fn get(&mut self, uri: &str) -> Option<Arc<DecodedImage>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(uri)?;
        entry.last_access = tick;
        Some(Arc::clone(&entry.image))
    }

    /// Insert an image and evict down to the budget.
    ///
    /// Returns the cached image, which is the existing one if another load
    /// of the same URI got there first.
    pub(crate) fn insert(&mut self, uri: &str, image: DecodedImage) -> Arc<DecodedImage> {
        if let Some(existing) = self.get(uri) {
            return existing;
        }

        let tick = self.next_tick();
        let image = Arc::new(image);
        self.used_bytes += image.byte_size();
        self.entries.insert(
            uri.to_string(),
            Entry {
                image: Arc::clone(&image),
                last_access: tick,
            },
        );

        self.evict();
        image
    }

    fn evict(&mut self) {
        while self.used_bytes > self.budget_bytes {
            let victim = self
                .entries
                .iter()
                .filter(|(_, entry)| !entry.is_pinned())
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(uri, _)| uri.clone());

            let Some(uri) = victim else {
                debug!(
                    used = self.used_bytes,
                    budget = self.budget_bytes,
                    "Image memory over budget, everything visible"
                );
                break;
            };
            if let Some(entry) = self.entries.remove(&uri) {
                self.used_bytes -= entry.image.byte_size();
                debug!(%uri, "Evicted image from memory");
            }
        }
    }

    pub(crate) fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    pub(crate) const fn used_bytes(&self) -> u64 {
        self.used_bytes
    }
}
