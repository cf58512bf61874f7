//! Rate-limited logging stages.
//!
//! Steady-state loops (publisher reads, player writes, segment reaps) log
//! through a pithy print so a thousand clients on one stage still produce
//! one line per interval: the stage tracks its client count and elects one
//! printer per `interval * clients` of accumulated age.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::clock::Clock;

/// Stage ids, one per steady-state loop kind.
pub mod stage {
    pub const RTMP_PLAY: u32 = 1;
    pub const RTMP_PUBLISH: u32 = 2;
    pub const HLS: u32 = 3;
    pub const CASTER: u32 = 4;
    pub const HTTP_STREAM: u32 = 5;
    pub const RTC_PLAY: u32 = 6;
    pub const RTC_RECV: u32 = 7;
    pub const RTC_SEND: u32 = 8;
    pub const SRT_PLAY: u32 = 9;
    pub const SRT_PUBLISH: u32 = 10;
}

/// Shared per-stage accounting.
struct StageInfo {
    interval: Duration,
    nb_clients: u32,
    age: Duration,
    /// Number of `can_print` elections that succeeded.
    nn_count: u32,
    interval_ratio: f64,
}

impl StageInfo {
    fn new(interval: Duration, ratio: f64) -> Self {
        Self {
            interval,
            nb_clients: 0,
            age: Duration::ZERO,
            nn_count: 0,
            interval_ratio: ratio,
        }
    }

    fn elapse(&mut self, diff: Duration) {
        self.age += diff;
    }

    fn can_print(&mut self) -> bool {
        let clients = self.nb_clients.max(1);
        let threshold = self.interval.mul_f64(self.interval_ratio) * clients;
        if self.age >= threshold {
            self.age = Duration::ZERO;
            self.nn_count += 1;
            true
        } else {
            false
        }
    }
}

/// Registry of stages, shared by every printer of the process.
pub struct StageManager {
    interval: Duration,
    stages: Mutex<HashMap<u32, Arc<Mutex<StageInfo>>>>,
}

impl StageManager {
    /// Creates a manager with the configured print interval.
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval,
            stages: Mutex::new(HashMap::new()),
        })
    }

    fn fetch_or_create(&self, stage_id: u32, ratio: f64) -> Arc<Mutex<StageInfo>> {
        let mut stages = self.stages.lock();
        Arc::clone(
            stages
                .entry(stage_id)
                .or_insert_with(|| Arc::new(Mutex::new(StageInfo::new(self.interval, ratio)))),
        )
    }
}

/// Factory for printers, wired once at the composition root.
pub struct PithyPrints {
    manager: Arc<StageManager>,
    clock: Arc<dyn Clock>,
}

impl PithyPrints {
    /// Creates the factory.
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            manager: StageManager::new(interval),
            clock,
        })
    }

    fn create(&self, stage_id: u32) -> PithyPrint {
        let stage = self.manager.fetch_or_create(stage_id, 1.0);
        stage.lock().nb_clients += 1;
        PithyPrint {
            stage,
            age: Duration::ZERO,
            previous_tick: self.clock.now(),
            clock: Arc::clone(&self.clock),
        }
    }

    /// Printer for RTMP player loops.
    pub fn rtmp_play(&self) -> PithyPrint {
        self.create(stage::RTMP_PLAY)
    }

    /// Printer for RTMP publisher loops.
    pub fn rtmp_publish(&self) -> PithyPrint {
        self.create(stage::RTMP_PUBLISH)
    }

    /// Printer for the HLS muxer.
    pub fn hls(&self) -> PithyPrint {
        self.create(stage::HLS)
    }

    /// Printer for TS/UDP caster loops.
    pub fn caster(&self) -> PithyPrint {
        self.create(stage::CASTER)
    }

    /// Printer for HTTP-FLV player loops.
    pub fn http_stream(&self) -> PithyPrint {
        self.create(stage::HTTP_STREAM)
    }

    /// Printer for RTC player sessions.
    pub fn rtc_play(&self) -> PithyPrint {
        self.create(stage::RTC_PLAY)
    }

    /// Printer for RTC publisher sessions.
    pub fn rtc_recv(&self) -> PithyPrint {
        self.create(stage::RTC_RECV)
    }
}

/// Per-client handle onto a shared stage.
pub struct PithyPrint {
    stage: Arc<Mutex<StageInfo>>,
    age: Duration,
    previous_tick: Instant,
    clock: Arc<dyn Clock>,
}

impl PithyPrint {
    /// Accumulates elapsed time since the previous call.
    pub fn elapse(&mut self) {
        let now = self.clock.now();
        let diff = now.duration_since(self.previous_tick);
        self.previous_tick = now;
        self.age += diff;
        self.stage.lock().elapse(diff);
    }

    /// Whether this client won the election for the current interval.
    pub fn can_print(&self) -> bool {
        self.stage.lock().can_print()
    }

    /// Total age of this client.
    pub fn age(&self) -> Duration {
        self.age
    }
}

impl Drop for PithyPrint {
    fn drop(&mut self) {
        let mut stage = self.stage.lock();
        stage.nb_clients = stage.nb_clients.saturating_sub(1);
    }
}

/// Per-error-code rate limiter for packet-path logging.
///
/// The first occurrence of a code always prints; later ones print once per
/// interval. Used where every incoming UDP packet may fail the same way.
pub struct ErrorPithyPrint {
    interval: Duration,
    clock: Arc<dyn Clock>,
    ticks: Mutex<HashMap<&'static str, Instant>>,
    /// Total occurrences across all codes.
    pub nn_count: Mutex<u64>,
}

impl ErrorPithyPrint {
    /// Creates a limiter with the given per-code interval.
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            clock,
            ticks: Mutex::new(HashMap::new()),
            nn_count: Mutex::new(0),
        }
    }

    /// Whether the given error code is due for printing.
    pub fn can_print(&self, code: &'static str) -> bool {
        *self.nn_count.lock() += 1;
        let now = self.clock.now();
        let mut ticks = self.ticks.lock();
        match ticks.get(code) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                ticks.insert(code, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    #[tokio::test(start_paused = true)]
    async fn single_client_prints_once_per_interval() {
        let prints = PithyPrints::new(Duration::from_secs(10), TokioClock::arc());
        let mut print = prints.rtmp_play();

        print.elapse();
        assert!(!print.can_print());

        tokio::time::sleep(Duration::from_secs(10)).await;
        print.elapse();
        assert!(print.can_print());
        // Age reset: immediately after printing, nothing to print.
        assert!(!print.can_print());
    }

    #[tokio::test(start_paused = true)]
    async fn two_clients_share_one_print_per_interval() {
        let prints = PithyPrints::new(Duration::from_secs(10), TokioClock::arc());
        let mut a = prints.rtmp_play();
        let mut b = prints.rtmp_play();

        tokio::time::sleep(Duration::from_secs(10)).await;
        a.elapse();
        b.elapse();

        // Combined stage age is 20s against a 20s threshold (10s x 2
        // clients): exactly one of the two elections wins.
        let wins = [a.can_print(), b.can_print()];
        assert_eq!(wins.iter().filter(|w| **w).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_client_releases_stage_slot() {
        let prints = PithyPrints::new(Duration::from_secs(10), TokioClock::arc());
        let mut a = prints.rtmp_publish();
        let b = prints.rtmp_publish();
        drop(b);

        tokio::time::sleep(Duration::from_secs(10)).await;
        a.elapse();
        assert!(a.can_print());
    }

    #[tokio::test(start_paused = true)]
    async fn error_print_limits_per_code() {
        let errs = ErrorPithyPrint::new(Duration::from_secs(1), TokioClock::arc());
        assert!(errs.can_print("ts_demux"));
        assert!(!errs.can_print("ts_demux"));
        // Different code has its own tick.
        assert!(errs.can_print("pes_parse"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(errs.can_print("ts_demux"));
    }
}
