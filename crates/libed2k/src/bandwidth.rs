// Token-bucket rate limiting. Each direction has a channel per transfer and
// a session-global channel; a request traverses both and is granted when
// both buckets can cover it. Waiters queue FIFO inside the limiter; the
// queued-byte counters exist so the engine can assert that queued bandwidth
// matches outstanding requests at any time.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use governor::DefaultDirectRateLimiter as RateLimiter;
use governor::Quota;

struct Channel {
    limiter: ArcSwapOption<RateLimiter>,
    current_bps: AtomicU32,
    queued_bytes: AtomicU64,
}

struct QueuedGuard<'a> {
    counter: &'a AtomicU64,
    bytes: u64,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        // Runs on grant and on cancellation alike, so a disconnected peer's
        // queued bytes are subtracted when its request future is dropped.
        self.counter.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

impl Channel {
    fn new_inner(bps: Option<NonZeroU32>) -> Option<Arc<RateLimiter>> {
        let bps = bps?;
        Some(Arc::new(RateLimiter::direct(Quota::per_second(bps))))
    }

    fn new(bps: Option<NonZeroU32>) -> Self {
        Self {
            limiter: ArcSwapOption::new(Self::new_inner(bps)),
            current_bps: AtomicU32::new(bps.map(|v| v.get()).unwrap_or(0)),
            queued_bytes: AtomicU64::new(0),
        }
    }

    async fn acquire(&self, size: NonZeroU32) -> crate::Result<()> {
        let lim = self.limiter.load().clone();
        if let Some(rl) = lim.as_ref() {
            self.queued_bytes
                .fetch_add(size.get() as u64, Ordering::Relaxed);
            let _guard = QueuedGuard {
                counter: &self.queued_bytes,
                bytes: size.get() as u64,
            };
            rl.until_n_ready(size).await?;
        }
        Ok(())
    }

    fn set(&self, limit: Option<NonZeroU32>) {
        let new = Self::new_inner(limit);
        self.limiter.swap(new);
        self.current_bps
            .store(limit.map(|v| v.get()).unwrap_or(0), Ordering::Relaxed);
    }

    fn get(&self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.current_bps.load(Ordering::Relaxed))
    }
}

pub struct BandwidthManager {
    down: Channel,
    up: Channel,
}

impl BandwidthManager {
    pub fn new(download_bps: Option<NonZeroU32>, upload_bps: Option<NonZeroU32>) -> Self {
        Self {
            down: Channel::new(download_bps),
            up: Channel::new(upload_bps),
        }
    }

    pub async fn prepare_for_upload(&self, len: NonZeroU32) -> crate::Result<()> {
        self.up.acquire(len).await
    }

    pub async fn prepare_for_download(&self, len: NonZeroU32) -> crate::Result<()> {
        self.down.acquire(len).await
    }

    pub fn set_upload_bps(&self, bps: Option<NonZeroU32>) {
        self.up.set(bps);
    }

    pub fn set_download_bps(&self, bps: Option<NonZeroU32>) {
        self.down.set(bps);
    }

    pub fn get_upload_bps(&self) -> Option<NonZeroU32> {
        self.up.get()
    }

    pub fn get_download_bps(&self) -> Option<NonZeroU32> {
        self.down.get()
    }

    pub fn queued_upload_bytes(&self) -> u64 {
        self.up.queued_bytes.load(Ordering::Relaxed)
    }

    pub fn queued_download_bytes(&self) -> u64 {
        self.down.queued_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn nz(v: u32) -> NonZeroU32 {
        NonZeroU32::new(v).unwrap()
    }

    #[tokio::test]
    async fn test_unlimited_grants_immediately() {
        let m = BandwidthManager::new(None, None);
        m.prepare_for_download(nz(1_000_000)).await.unwrap();
        m.prepare_for_upload(nz(1_000_000)).await.unwrap();
        assert_eq!(m.queued_download_bytes(), 0);
        assert_eq!(m.queued_upload_bytes(), 0);
    }

    #[tokio::test]
    async fn test_limit_throttles() {
        // Burst of 100 bytes/s: the second 100-byte acquire must wait.
        let m = Arc::new(BandwidthManager::new(Some(nz(100)), None));
        m.prepare_for_download(nz(100)).await.unwrap();
        let m2 = m.clone();
        let pending = tokio::spawn(async move { m2.prepare_for_download(nz(100)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert_eq!(m.queued_download_bytes(), 100);
        pending.abort();
        let _ = pending.await;
        // Cancellation subtracts the queued bytes.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(m.queued_download_bytes(), 0);
    }

    #[tokio::test]
    async fn test_set_limit_applies_to_new_requests() {
        let m = BandwidthManager::new(None, None);
        assert!(m.get_upload_bps().is_none());
        m.set_upload_bps(Some(nz(1024)));
        assert_eq!(m.get_upload_bps(), Some(nz(1024)));
        m.set_upload_bps(None);
        assert!(m.get_upload_bps().is_none());
    }

    #[tokio::test]
    async fn test_oversize_request_fails() {
        let m = BandwidthManager::new(Some(nz(10)), None);
        // A request larger than the bucket can ever hold errors instead of
        // waiting forever.
        assert!(m.prepare_for_download(nz(1_000_000)).await.is_err());
        assert_eq!(m.queued_download_bytes(), 0);
    }
}
