use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

/// Process-global token source enforcing a strict minimum inter-request
/// interval against the upstream classifier (§4.1).
///
/// Deliberately hand-rolled rather than built on a token-bucket crate: the
/// spec requires strict pacing with no burst capacity, which is exactly
/// `max(0, interval - elapsed)` against a single shared timestamp, not a
/// bucket that can accumulate credit while idle.
pub struct RateGate {
    interval: Duration,
    last_release: Arc<Mutex<Option<Instant>>>,
}

impl RateGate {
    pub fn new(requests_per_second: u32) -> Self {
        let rps = requests_per_second.max(1);
        Self {
            interval: Duration::from_millis(1000 / rps as u64),
            last_release: Arc::new(Mutex::new(None)),
        }
    }

    /// Blocks until it is safe to issue the next upstream request, then
    /// records the release time. Two successive returns from `acquire()` are
    /// always separated by at least `interval` of real time.
    pub async fn acquire(&self) {
        let mut last = self.last_release.lock().await;
        let now = Instant::now();

        if let Some(prev) = *last {
            let elapsed = now.saturating_duration_since(prev);
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

impl Clone for RateGate {
    fn clone(&self) -> Self {
        Self {
            interval: self.interval,
            last_release: Arc::clone(&self.last_release),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn enforces_minimum_interval() {
        let gate = RateGate::new(4); // 250ms interval

        let t0 = Instant::now();
        gate.acquire().await;
        let first = Instant::now().saturating_duration_since(t0);
        assert!(first < Duration::from_millis(50));

        gate.acquire().await;
        let second = Instant::now().saturating_duration_since(t0);
        assert!(second >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_wait_if_interval_already_elapsed() {
        let gate = RateGate::new(4);
        gate.acquire().await;

        tokio::time::advance(Duration::from_millis(300)).await;

        let before = Instant::now();
        gate.acquire().await;
        let elapsed = Instant::now().saturating_duration_since(before);
        assert!(elapsed < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn shared_clone_paces_across_callers() {
        let gate = RateGate::new(2); // 500ms interval
        let other = gate.clone();

        let t0 = Instant::now();
        gate.acquire().await;
        other.acquire().await;
        let elapsed = Instant::now().saturating_duration_since(t0);
        assert!(elapsed >= Duration::from_millis(500));
    }
}
