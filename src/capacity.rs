//! Process-wide token-slot accounting.
//!
//! [`CapacityGauge`] bounds how much generation work is in flight at once.
//! Reservations are taken before a provider call dispatches and released
//! when the corresponding slice terminates. The gauge is advisory on top of
//! that: the batcher stops emitting new batches while 80% of the capacity is
//! reserved, keeping headroom for recoveries that re-reserve on retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long an acquirer sleeps between capacity checks.
const ACQUIRE_POLL: Duration = Duration::from_millis(50);

/// Shared reservation counter: `(reserved, total)` token slots.
#[derive(Debug)]
pub struct CapacityGauge {
    reserved: AtomicU64,
    total: u64,
}

impl CapacityGauge {
    pub fn new(total: u64) -> Arc<CapacityGauge> {
        Arc::new(CapacityGauge {
            reserved: AtomicU64::new(0),
            total,
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Cooperatively block until `reserved + n <= total`, then reserve `n`
    /// slots. The returned guard releases them exactly once.
    pub async fn acquire(self: &Arc<Self>, n: u64) -> CapacityReservation {
        loop {
            let current = self.reserved.load(Ordering::Relaxed);
            if current + n <= self.total {
                if self
                    .reserved
                    .compare_exchange(current, current + n, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    return CapacityReservation {
                        gauge: Arc::clone(self),
                        slots: n,
                    };
                }
                continue;
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    /// Release `n` slots. Never drops the counter below zero.
    pub fn release(&self, n: u64) {
        let _ = self
            .reserved
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(n))
            });
    }

    /// Whether dispatching more work now would eat into the recovery
    /// headroom (`reserved >= 0.8 * total`).
    pub fn would_throttle(&self) -> bool {
        self.reserved() * 10 >= self.total * 8
    }
}

/// RAII guard for reserved slots; releases on drop.
#[derive(Debug)]
pub struct CapacityReservation {
    gauge: Arc<CapacityGauge>,
    slots: u64,
}

impl CapacityReservation {
    pub fn slots(&self) -> u64 {
        self.slots
    }
}

impl Drop for CapacityReservation {
    fn drop(&mut self) {
        self.gauge.release(self.slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release_round_trip() {
        let gauge = CapacityGauge::new(10);
        let res = gauge.acquire(4).await;
        assert_eq!(gauge.reserved(), 4);
        drop(res);
        assert_eq!(gauge.reserved(), 0);
    }

    #[tokio::test]
    async fn test_release_never_underflows() {
        let gauge = CapacityGauge::new(10);
        gauge.release(5);
        assert_eq!(gauge.reserved(), 0);
    }

    #[tokio::test]
    async fn test_throttle_at_80_percent() {
        let gauge = CapacityGauge::new(10);
        let _a = gauge.acquire(7).await;
        assert!(!gauge.would_throttle());
        let _b = gauge.acquire(1).await;
        assert!(gauge.would_throttle());
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_released() {
        let gauge = CapacityGauge::new(2);
        let held = gauge.acquire(2).await;

        let gauge2 = Arc::clone(&gauge);
        let waiter = tokio::spawn(async move { gauge2.acquire(1).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire should unblock")
            .expect("task should not panic");
        assert_eq!(res.slots(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_respect_total() {
        // 15 single-slot requests against a total of 10: never more than 10
        // reserved at once, all eventually complete.
        let gauge = CapacityGauge::new(10);
        let peak = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..15 {
            let gauge = Arc::clone(&gauge);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let res = gauge.acquire(1).await;
                peak.fetch_max(gauge.reserved(), Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(res);
            }));
        }
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("all requests should complete")
                .expect("task should not panic");
        }

        assert!(peak.load(Ordering::Relaxed) <= 10);
        assert_eq!(gauge.reserved(), 0);
    }
}
