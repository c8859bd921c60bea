use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::limits::{QuotaKey, QuotaRecord, QuotaStore, QuotaStoreError};
use super::{Clock, SystemClock};

const GC_INTERVAL_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, Copy)]
struct WindowUsage {
    count: u64,
    reset_at_ms: u64,
}

#[derive(Debug, Default)]
struct Inner {
    usage: HashMap<QuotaKey, WindowUsage>,
    last_gc_ms: u64,
}

/// Process-local quota store. The whole read-modify-write happens under one lock.
#[derive(Clone)]
pub struct MemoryQuotaStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryQuotaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQuotaStore")
            .field("keys", &self.len())
            .finish()
    }
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().usage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current count for a key without incrementing it; expired windows read as absent.
    pub fn peek(&self, key: &QuotaKey) -> Option<u64> {
        let now = self.clock.now_epoch_millis();
        self.lock()
            .usage
            .get(key)
            .filter(|usage| usage.reset_at_ms > now)
            .map(|usage| usage.count)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn increment_at(&self, key: &QuotaKey, limit: u64, window_ms: u64, now: u64) -> QuotaRecord {
        let window_ms = window_ms.max(1);
        let mut inner = self.lock();

        if now.saturating_sub(inner.last_gc_ms) >= GC_INTERVAL_MS {
            inner.usage.retain(|_, usage| usage.reset_at_ms > now);
            inner.last_gc_ms = now;
        }

        let usage = inner.usage.entry(key.clone()).or_insert(WindowUsage {
            count: 0,
            reset_at_ms: now.saturating_add(window_ms),
        });

        if usage.reset_at_ms <= now {
            usage.count = 0;
            // Skip every window that fully elapsed while the key was idle.
            let behind = now - usage.reset_at_ms;
            let windows = behind / window_ms + 1;
            usage.reset_at_ms = usage
                .reset_at_ms
                .saturating_add(windows.saturating_mul(window_ms));
        }

        usage.count = usage.count.saturating_add(1);

        QuotaRecord {
            key: key.clone(),
            count: usage.count,
            reset_at_ms: usage.reset_at_ms,
            limit,
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn increment(
        &self,
        key: &QuotaKey,
        limit: u64,
        window_ms: u64,
    ) -> Result<QuotaRecord, QuotaStoreError> {
        let now = self.clock.now_epoch_millis();
        Ok(self.increment_at(key, limit, window_ms, now))
    }
}
