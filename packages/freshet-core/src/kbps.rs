//! Sliding-window rate accounting.
//!
//! Connections and sources count bytes or packets into a [`Pps`]; the
//! sampler converts the monotone counter into per-window averages (10s, 30s,
//! 1m, 5m, 60m) on demand. The `sugar` field is a scratch counter for call
//! sites that do not keep their own tally.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::clock::Clock;

/// One window of a rate sampler.
#[derive(Debug, Clone, Copy)]
pub struct RateSample {
    /// Counter value at the window boundary.
    pub total: i64,
    /// When the window was last rolled, `None` before the first update.
    pub time: Option<Instant>,
    /// Average rate of the last completed window, per second.
    pub rate: i64,
}

impl RateSample {
    fn new() -> Self {
        Self {
            total: 0,
            time: None,
            rate: 0,
        }
    }

    fn update(&mut self, nn: i64, t: Instant, rate: i64) {
        self.total = nn;
        self.time = Some(t);
        self.rate = rate;
    }
}

struct PpsInner {
    sample_10s: RateSample,
    sample_30s: RateSample,
    sample_1m: RateSample,
    sample_5m: RateSample,
    sample_60m: RateSample,
    sugar: i64,
}

/// A per-second rate sampler over a monotone counter.
pub struct Pps {
    clock: Arc<dyn Clock>,
    inner: Mutex<PpsInner>,
}

impl Pps {
    /// Creates a sampler on the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(PpsInner {
                sample_10s: RateSample::new(),
                sample_30s: RateSample::new(),
                sample_1m: RateSample::new(),
                sample_5m: RateSample::new(),
                sample_60m: RateSample::new(),
                sugar: 0,
            }),
        }
    }

    /// Adds to the scratch counter.
    pub fn sugar_add(&self, nn: i64) {
        self.inner.lock().sugar += nn;
    }

    /// Rolls the windows using the scratch counter as the target.
    pub fn update(&self) {
        let sugar = self.inner.lock().sugar;
        self.update_with(sugar);
    }

    /// Rolls the windows against the given monotone counter value.
    pub fn update_with(&self, nn: i64) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        Self::roll(&mut inner.sample_10s, nn, now, Duration::from_secs(10));
        Self::roll(&mut inner.sample_30s, nn, now, Duration::from_secs(30));
        Self::roll(&mut inner.sample_1m, nn, now, Duration::from_secs(60));
        Self::roll(&mut inner.sample_5m, nn, now, Duration::from_secs(300));
        Self::roll(&mut inner.sample_60m, nn, now, Duration::from_secs(3600));
    }

    fn roll(sample: &mut RateSample, nn: i64, now: Instant, window: Duration) {
        let Some(time) = sample.time else {
            sample.update(nn, now, 0);
            return;
        };

        let elapsed = now.duration_since(time);
        if elapsed >= window {
            let secs = elapsed.as_secs().max(1) as i64;
            let rate = (nn - sample.total) / secs;
            sample.update(nn, now, rate.max(0));
        }
    }

    /// The 10s average, per second.
    pub fn r10s(&self) -> i64 {
        self.inner.lock().sample_10s.rate
    }

    /// The 30s average, per second.
    pub fn r30s(&self) -> i64 {
        self.inner.lock().sample_30s.rate
    }

    /// The 1m average, per second.
    pub fn r1m(&self) -> i64 {
        self.inner.lock().sample_1m.rate
    }
}

/// Byte-rate helper: same windows, reported in kbps.
pub struct Kbps {
    pps: Pps,
}

impl Kbps {
    /// Creates a byte-rate sampler on the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pps: Pps::new(clock),
        }
    }

    /// Adds sent/received bytes.
    pub fn add_bytes(&self, bytes: i64) {
        self.pps.sugar_add(bytes);
    }

    /// Rolls the windows.
    pub fn sample(&self) {
        self.pps.update();
    }

    /// The 10s average in kbps.
    pub fn kbps_10s(&self) -> i64 {
        self.pps.r10s() * 8 / 1000
    }

    /// The 30s average in kbps.
    pub fn kbps_30s(&self) -> i64 {
        self.pps.r30s() * 8 / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    #[tokio::test(start_paused = true)]
    async fn rate_is_zero_until_first_window_completes() {
        let pps = Pps::new(TokioClock::arc());
        pps.update_with(1000);
        assert_eq!(pps.r10s(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        pps.update_with(5000);
        assert_eq!(pps.r10s(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ten_second_window_averages_delta() {
        let pps = Pps::new(TokioClock::arc());
        pps.update_with(0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        pps.update_with(1000);
        assert_eq!(pps.r10s(), 100);

        // Another full window at a higher rate.
        tokio::time::sleep(Duration::from_secs(10)).await;
        pps.update_with(6000);
        assert_eq!(pps.r10s(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn windows_roll_independently() {
        let pps = Pps::new(TokioClock::arc());
        pps.update_with(0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        pps.update_with(3000);
        assert_eq!(pps.r10s(), 100);
        assert_eq!(pps.r30s(), 100);
        // 1m window has not completed yet.
        assert_eq!(pps.r1m(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn kbps_reports_bits() {
        let kbps = Kbps::new(TokioClock::arc());
        kbps.add_bytes(0);
        kbps.sample();

        tokio::time::sleep(Duration::from_secs(10)).await;
        // 125_000 bytes/s = 1000 kbps.
        kbps.add_bytes(1_250_000);
        kbps.sample();
        assert_eq!(kbps.kbps_10s(), 1000);
    }
}
