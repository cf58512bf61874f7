//! CPU-pressure circuit breaker.
//!
//! Subscribed to the 1s shared timer. Each tick reads the process CPU
//! percentage and updates three water levels; consumers poll the monotone
//! predicates (`dying` implies `critical` implies `high`) to voluntarily
//! degrade: NACK generation stops under critical, forwarding under dying.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ServerResult;
use crate::runtime::timer::FastTimerHandler;

/// Source of the process CPU percentage, substitutable for tests.
pub trait CpuSource: Send + Sync {
    /// Current process CPU usage in percent (may exceed 100 on multicore).
    fn cpu_percent(&self) -> f32;
}

/// Reads CPU usage from `/proc/self/stat` deltas.
pub struct ProcSelfStat {
    state: parking_lot::Mutex<ProcSample>,
}

#[derive(Default, Clone, Copy)]
struct ProcSample {
    total_ticks: u64,
    wall: Option<std::time::Instant>,
    percent: f32,
}

impl ProcSelfStat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: parking_lot::Mutex::new(ProcSample::default()),
        })
    }

    #[cfg(unix)]
    fn read_ticks() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // utime and stime are fields 14 and 15, after the parenthesized comm.
        let rest = stat.rsplit(')').next()?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    #[cfg(not(unix))]
    fn read_ticks() -> Option<u64> {
        None
    }

    #[cfg(unix)]
    fn ticks_per_second() -> f32 {
        // SAFETY: sysconf is async-signal-safe and has no preconditions.
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if hz > 0 {
            hz as f32
        } else {
            100.0
        }
    }
}

impl CpuSource for ProcSelfStat {
    fn cpu_percent(&self) -> f32 {
        let Some(ticks) = Self::read_ticks() else {
            return 0.0;
        };
        let now = std::time::Instant::now();
        let mut state = self.state.lock();
        if let Some(prev_wall) = state.wall {
            let elapsed = now.duration_since(prev_wall).as_secs_f32();
            if elapsed > 0.0 {
                let delta = ticks.saturating_sub(state.total_ticks) as f32;
                #[cfg(unix)]
                let hz = Self::ticks_per_second();
                #[cfg(not(unix))]
                let hz = 100.0;
                state.percent = delta / hz / elapsed * 100.0;
            }
        }
        state.total_ticks = ticks;
        state.wall = Some(now);
        state.percent
    }
}

/// Breaker thresholds and pulses, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub high_threshold: i32,
    pub high_pulse: i32,
    pub critical_threshold: i32,
    pub critical_pulse: i32,
    pub dying_threshold: i32,
    pub dying_pulse: i32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_threshold: 90,
            high_pulse: 2,
            critical_threshold: 95,
            critical_pulse: 1,
            dying_threshold: 99,
            dying_pulse: 5,
        }
    }
}

/// The breaker itself; share it and poll the predicates.
pub struct CircuitBreaker {
    config: BreakerConfig,
    cpu: Arc<dyn CpuSource>,
    high_level: AtomicI32,
    critical_level: AtomicI32,
    dying_level: AtomicI32,
}

impl CircuitBreaker {
    /// Creates a breaker reading from the given CPU source.
    pub fn new(config: BreakerConfig, cpu: Arc<dyn CpuSource>) -> Arc<Self> {
        log::info!(
            "[Breaker] enabled={}, high={}x{}, critical={}x{}, dying={}x{}",
            config.enabled,
            config.high_pulse,
            config.high_threshold,
            config.critical_pulse,
            config.critical_threshold,
            config.dying_pulse,
            config.dying_threshold
        );
        Arc::new(Self {
            config,
            cpu,
            high_level: AtomicI32::new(0),
            critical_level: AtomicI32::new(0),
            dying_level: AtomicI32::new(0),
        })
    }

    /// High water level: consider shedding optional work.
    pub fn high_water_level(&self) -> bool {
        self.config.enabled
            && (self.critical_water_level() || self.high_level.load(Ordering::SeqCst) > 0)
    }

    /// Critical water level: NACK generation and similar extras stop.
    pub fn critical_water_level(&self) -> bool {
        self.config.enabled
            && (self.dying_water_level() || self.critical_level.load(Ordering::SeqCst) > 0)
    }

    /// Dying water level: only essential forwarding continues.
    pub fn dying_water_level(&self) -> bool {
        self.config.enabled
            && self.config.dying_pulse > 0
            && self.dying_level.load(Ordering::SeqCst) >= self.config.dying_pulse
    }

    fn tick(&self, cpu_percent: f32) {
        let cfg = &self.config;

        // The pulse is how many calm ticks a level survives: recharge to
        // pulse+1 under pressure, decay by one per calm tick.
        if cpu_percent > cfg.high_threshold as f32 {
            self.high_level.store(cfg.high_pulse + 1, Ordering::SeqCst);
        } else if self.high_level.load(Ordering::SeqCst) > 0 {
            self.high_level.fetch_sub(1, Ordering::SeqCst);
        }

        if cpu_percent > cfg.critical_threshold as f32 {
            self.critical_level.store(cfg.critical_pulse + 1, Ordering::SeqCst);
        } else if self.critical_level.load(Ordering::SeqCst) > 0 {
            self.critical_level.fetch_sub(1, Ordering::SeqCst);
        }

        // Dying saturates upward and resets outright when pressure stops.
        if cpu_percent > cfg.dying_threshold as f32 {
            let next = (self.dying_level.load(Ordering::SeqCst) + 1).min(cfg.dying_pulse + 1);
            self.dying_level.store(next, Ordering::SeqCst);
        } else {
            self.dying_level.store(0, Ordering::SeqCst);
        }

        if self.config.enabled && (self.high_water_level() || self.critical_water_level()) {
            log::info!(
                "[Breaker] cpu={:.1}%, break={},{},{}",
                cpu_percent,
                self.high_water_level(),
                self.critical_water_level(),
                self.dying_water_level()
            );
        }
    }
}

#[async_trait]
impl FastTimerHandler for CircuitBreaker {
    async fn on_timer(&self, _interval: Duration) -> ServerResult<()> {
        self.tick(self.cpu.cpu_percent());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCpu(f32);

    impl CpuSource for FixedCpu {
        fn cpu_percent(&self) -> f32 {
            self.0
        }
    }

    fn breaker(high: i32, hp: i32, critical: i32, cp: i32, dying: i32, dp: i32) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(
            BreakerConfig {
                enabled: true,
                high_threshold: high,
                high_pulse: hp,
                critical_threshold: critical,
                critical_pulse: cp,
                dying_threshold: dying,
                dying_pulse: dp,
            },
            Arc::new(FixedCpu(0.0)),
        )
    }

    #[test]
    fn ladder_follows_the_sample_sequence() {
        // Thresholds 75/85/95 with pulses 2/1/1.
        let b = breaker(75, 2, 85, 1, 95, 1);
        let samples = [60.0, 80.0, 80.0, 90.0, 98.0, 98.0, 40.0, 40.0, 40.0];
        let expected = [
            (false, false, false),
            (true, false, false),
            (true, false, false),
            (true, true, false),
            (true, true, true),
            (true, true, true),
            (true, true, false),
            (true, false, false),
            (false, false, false),
        ];

        for (cpu, want) in samples.iter().zip(expected.iter()) {
            b.tick(*cpu);
            let got = (
                b.high_water_level(),
                b.critical_water_level(),
                b.dying_water_level(),
            );
            assert_eq!(got, *want, "cpu sample {}", cpu);
        }
    }

    #[test]
    fn predicates_are_monotone() {
        let b = breaker(75, 2, 85, 1, 95, 1);
        for cpu in [50.0, 80.0, 90.0, 99.0, 99.0, 70.0, 20.0, 99.0, 0.0] {
            b.tick(cpu);
            if b.dying_water_level() {
                assert!(b.critical_water_level());
            }
            if b.critical_water_level() {
                assert!(b.high_water_level());
            }
        }
    }

    #[test]
    fn disabled_breaker_reports_all_false() {
        let b = CircuitBreaker::new(
            BreakerConfig {
                enabled: false,
                ..Default::default()
            },
            Arc::new(FixedCpu(100.0)),
        );
        b.tick(100.0);
        b.tick(100.0);
        assert!(!b.high_water_level());
        assert!(!b.critical_water_level());
        assert!(!b.dying_water_level());
    }

    #[test]
    fn dying_saturates_and_resets() {
        let b = breaker(75, 2, 85, 1, 95, 3);
        for _ in 0..10 {
            b.tick(99.0);
        }
        assert!(b.dying_water_level());
        b.tick(10.0);
        assert!(!b.dying_water_level());
    }
}
