//! Per-tag concurrency ceilings.
//!
//! One fair `tokio::sync::Semaphore` per configured tag. Waiters are served
//! in arrival order, capacities are fixed at construction, and a tag that
//! has no configured capacity is unlimited.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use mf_core::{Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct Bucket {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Shared limiter, the only cross-file mutable state in a run.
pub struct ConcurrencyLimiter {
    buckets: HashMap<String, Bucket>,
}

impl ConcurrencyLimiter {
    /// Build from `tag -> capacity`.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if any capacity is zero.
    pub fn new(capacities: &BTreeMap<String, usize>) -> Result<Self> {
        let mut buckets = HashMap::with_capacity(capacities.len());
        for (tag, &capacity) in capacities {
            if capacity == 0 {
                return Err(Error::Validation(format!(
                    "concurrency capacity for '{tag}' must be at least 1"
                )));
            }
            buckets.insert(
                tag.clone(),
                Bucket {
                    semaphore: Arc::new(Semaphore::new(capacity)),
                    capacity,
                },
            );
        }
        Ok(Self { buckets })
    }

    /// A limiter where every tag is unlimited.
    pub fn unlimited() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    /// Wait for a slot on `tag`. `None` and unconfigured tags return at once.
    pub async fn acquire(&self, tag: Option<&str>) -> Result<ConcurrencySlot> {
        let Some(bucket) = tag.and_then(|t| self.buckets.get(t)) else {
            return Ok(ConcurrencySlot {
                tag: tag.map(String::from),
                permit: None,
            });
        };

        let permit = Arc::clone(&bucket.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(format!("concurrency limiter closed: {e}")))?;
        Ok(ConcurrencySlot {
            tag: tag.map(String::from),
            permit: Some(permit),
        })
    }

    /// Give a slot back. Releasing twice is a no-op.
    pub fn release(&self, slot: &mut ConcurrencySlot) {
        slot.release();
    }

    /// Configured capacity, `None` if unlimited.
    pub fn capacity(&self, tag: &str) -> Option<usize> {
        self.buckets.get(tag).map(|b| b.capacity)
    }

    /// Currently free slots, `None` if unlimited.
    pub fn available(&self, tag: &str) -> Option<usize> {
        self.buckets.get(tag).map(|b| b.semaphore.available_permits())
    }

    /// Configured tags in sorted order.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.buckets.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for tag in self.tags() {
            map.entry(&tag, &self.buckets[tag].capacity);
        }
        map.finish()
    }
}

/// A lease on one slot. Released on drop, including during unwinding.
#[derive(Debug)]
pub struct ConcurrencySlot {
    tag: Option<String>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ConcurrencySlot {
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Whether the slot still holds a permit.
    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }

    /// Give the slot back early. Idempotent.
    pub fn release(&mut self) {
        self.permit.take();
    }
}
