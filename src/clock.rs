use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

/// Injectable sleep, so retry-backoff timing (property P6) is observable in
/// tests instead of merely plausible.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real clock: sleeps on the tokio runtime.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns the exponential backoff delay for retry attempt `k` (0-indexed):
/// `2^k` seconds.
pub fn exp_backoff_secs(k: u32) -> u64 {
    1u64 << k
}

#[cfg(test)]
pub struct FakeClock {
    sleeps: Mutex<Vec<Duration>>,
    calls: AtomicUsize,
}

#[cfg(test)]
impl FakeClock {
    pub fn new() -> Self {
        Self {
            sleeps: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Clock for FakeClock {
    async fn sleep(&self, duration: Duration) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        assert_eq!(exp_backoff_secs(0), 1);
        assert_eq!(exp_backoff_secs(1), 2);
        assert_eq!(exp_backoff_secs(2), 4);
    }

    #[tokio::test]
    async fn fake_clock_records_sleeps() {
        let clock = FakeClock::new();
        clock.sleep(Duration::from_secs(1)).await;
        clock.sleep(Duration::from_secs(2)).await;
        assert_eq!(
            clock.recorded(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }
}
