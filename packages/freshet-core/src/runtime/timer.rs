//! Periodic dispatch: the hourglass and the shared fast timers.
//!
//! The hourglass drives subscribers registered at arbitrary intervals from a
//! single resolution-sleep loop. Fast timers are simpler: one coroutine per
//! rate bucket invoking a list of handlers, shared process-wide so we never
//! start a timer per connection.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::context::ContextId;
use crate::error::ServerResult;
use crate::runtime::coroutine::{Coroutine, CoroutineHandler, TaskSpawner};

/// Handler for hourglass ticks.
#[async_trait]
pub trait HourglassHandler: Send + Sync {
    /// Called when a registered (event, interval) pair is due. `tick` is the
    /// total elapsed time of the hourglass in resolution multiples.
    async fn notify(&self, event: u32, interval: Duration, tick: Duration) -> ServerResult<()>;
}

/// A multi-rate periodic dispatcher.
///
/// Subscribers register (event, interval) pairs; a single coroutine sleeps
/// the fixed resolution and fires every pair whose interval divides the
/// elapsed tick. A 100ms hourglass with subscribers at 300ms/500ms/700ms
/// fires them interleaved in least-common-multiple order.
pub struct Hourglass {
    label: String,
    co: Arc<Coroutine>,
    handler: Mutex<Option<Arc<dyn HourglassHandler>>>,
    resolution: Duration,
    ticks: Mutex<HashMap<u32, Duration>>,
}

impl Hourglass {
    /// Creates an hourglass with the given resolution.
    pub fn new(label: impl Into<String>, resolution: Duration) -> Arc<Self> {
        let label = label.into();
        Arc::new(Self {
            co: Coroutine::new(format!("hourglass-{}", label), ContextId::new()),
            label,
            handler: Mutex::new(None),
            resolution,
            ticks: Mutex::new(HashMap::new()),
        })
    }

    /// Registers an (event, interval) pair.
    ///
    /// The interval should be a multiple of the resolution; non-multiples
    /// fire at the next resolution boundary past each due time.
    pub fn tick(&self, event: u32, interval: Duration) {
        self.ticks.lock().insert(event, interval);
    }

    /// Removes the tick registered for `event`.
    pub fn untick(&self, event: u32) {
        self.ticks.lock().remove(&event);
    }

    /// Starts the dispatch coroutine with the given handler.
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner, handler: Arc<dyn HourglassHandler>) {
        *self.handler.lock() = Some(handler);
        self.co.start(spawner, Arc::clone(self) as Arc<dyn CoroutineHandler>);
    }

    /// Stops the dispatch coroutine.
    pub fn stop(&self) {
        self.co.stop();
    }
}

#[async_trait]
impl CoroutineHandler for Hourglass {
    async fn cycle(&self) -> ServerResult<()> {
        let mut total_elapse = Duration::ZERO;
        loop {
            self.co.pull()?;

            let due: Vec<(u32, Duration)> = {
                let ticks = self.ticks.lock();
                ticks
                    .iter()
                    .filter(|(_, interval)| {
                        !interval.is_zero()
                            && total_elapse.as_millis() % interval.as_millis() == 0
                    })
                    .map(|(event, interval)| (*event, *interval))
                    .collect()
            };

            let handler = self.handler.lock().clone();
            if let Some(handler) = handler {
                for (event, interval) in due {
                    if let Err(err) = handler.notify(event, interval, total_elapse).await {
                        log::warn!(
                            "[Hourglass] {} notify event={} failed: {}",
                            self.label,
                            event,
                            err
                        );
                    }
                }
            }

            total_elapse += self.resolution;
            self.co.sleep(self.resolution).await?;
        }
    }
}

/// Handler for fast-timer ticks. Handlers must be non-blocking: every
/// subscriber of a rate bucket shares the same coroutine.
#[async_trait]
pub trait FastTimerHandler: Send + Sync {
    /// Tick when the timer fires.
    async fn on_timer(&self, interval: Duration) -> ServerResult<()>;
}

/// A single-rate shared timer.
///
/// Subscribers are held weakly: a dropped subscriber is pruned on the next
/// tick, so components need not unsubscribe on teardown.
pub struct FastTimer {
    label: String,
    co: Arc<Coroutine>,
    interval: Duration,
    handlers: Mutex<Vec<Weak<dyn FastTimerHandler>>>,
}

impl FastTimer {
    /// Creates a timer with the given rate.
    pub fn new(label: impl Into<String>, interval: Duration) -> Arc<Self> {
        let label = label.into();
        Arc::new(Self {
            co: Coroutine::new(format!("timer-{}", label), ContextId::new()),
            label,
            interval,
            handlers: Mutex::new(Vec::new()),
        })
    }

    /// Subscribes a handler to the timer.
    pub fn subscribe(&self, handler: &Arc<dyn FastTimerHandler>) {
        self.handlers.lock().push(Arc::downgrade(handler));
    }

    /// Unsubscribes a handler from the timer.
    pub fn unsubscribe(&self, handler: &Arc<dyn FastTimerHandler>) {
        self.handlers
            .lock()
            .retain(|w| w.upgrade().map_or(true, |h| !Arc::ptr_eq(&h, handler)));
    }

    /// Starts the timer coroutine.
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        self.co.start(spawner, Arc::clone(self) as Arc<dyn CoroutineHandler>);
    }

    /// Stops the timer coroutine.
    pub fn stop(&self) {
        self.co.stop();
    }
}

#[async_trait]
impl CoroutineHandler for FastTimer {
    async fn cycle(&self) -> ServerResult<()> {
        loop {
            self.co.pull()?;
            self.co.sleep(self.interval).await?;

            let handlers: Vec<Arc<dyn FastTimerHandler>> = {
                let mut list = self.handlers.lock();
                list.retain(|w| w.strong_count() > 0);
                list.iter().filter_map(Weak::upgrade).collect()
            };

            for handler in handlers {
                if let Err(err) = handler.on_timer(self.interval).await {
                    log::warn!("[FastTimer] {} handler failed: {}", self.label, err);
                }
            }
        }
    }
}

/// Wall-clock drift monitor on the 20ms timer.
///
/// A single-threaded scheduler stalls when some handler blocks; the gap
/// between consecutive 20ms ticks then stretches well past the interval.
pub struct ClockWallMonitor {
    last_tick: Mutex<Option<Instant>>,
}

impl ClockWallMonitor {
    /// Drift beyond this is logged at warn level.
    const WARN_DRIFT: Duration = Duration::from_millis(160);
    /// Drift beyond this is logged at debug level.
    const DEBUG_DRIFT: Duration = Duration::from_millis(40);

    /// Creates a new monitor.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_tick: Mutex::new(None),
        })
    }
}

#[async_trait]
impl FastTimerHandler for ClockWallMonitor {
    async fn on_timer(&self, interval: Duration) -> ServerResult<()> {
        let now = Instant::now();
        let mut last = self.last_tick.lock();
        if let Some(prev) = last.replace(now) {
            let drift = now.duration_since(prev).saturating_sub(interval);
            if drift >= Self::WARN_DRIFT {
                log::warn!(
                    "[Clock] scheduler stalled: {}ms behind the {}ms timer",
                    drift.as_millis(),
                    interval.as_millis()
                );
            } else if drift >= Self::DEBUG_DRIFT {
                log::debug!("[Clock] timer drift {}ms", drift.as_millis());
            }
        }
        Ok(())
    }
}

/// The process-wide timer rates.
///
/// Never start a timer per connection or per publisher: subscribe to one of
/// these instead.
pub struct SharedTimers {
    timer20ms: Arc<FastTimer>,
    timer100ms: Arc<FastTimer>,
    timer1s: Arc<FastTimer>,
    timer5s: Arc<FastTimer>,
    clock_monitor: Arc<dyn FastTimerHandler>,
}

impl SharedTimers {
    /// Creates the four shared rates with the wall-clock monitor subscribed
    /// to the 20ms bucket.
    pub fn new() -> Arc<Self> {
        let timer20ms = FastTimer::new("20ms", Duration::from_millis(20));
        let clock_monitor: Arc<dyn FastTimerHandler> = ClockWallMonitor::new();
        timer20ms.subscribe(&clock_monitor);

        Arc::new(Self {
            timer20ms,
            timer100ms: FastTimer::new("100ms", Duration::from_millis(100)),
            timer1s: FastTimer::new("1s", Duration::from_secs(1)),
            timer5s: FastTimer::new("5s", Duration::from_secs(5)),
            clock_monitor,
        })
    }

    /// Starts all timer coroutines.
    pub fn start(&self, spawner: &dyn TaskSpawner) {
        self.timer20ms.start(spawner);
        self.timer100ms.start(spawner);
        self.timer1s.start(spawner);
        self.timer5s.start(spawner);
    }

    /// Stops all timer coroutines.
    pub fn stop(&self) {
        self.timer20ms.stop();
        self.timer100ms.stop();
        self.timer1s.stop();
        self.timer5s.stop();
    }

    /// The 20ms timer (NACK scans, session sweeps).
    pub fn timer20ms(&self) -> &Arc<FastTimer> {
        &self.timer20ms
    }

    /// The 100ms timer.
    pub fn timer100ms(&self) -> &Arc<FastTimer> {
        &self.timer100ms
    }

    /// The 1s timer (circuit breaker).
    pub fn timer1s(&self) -> &Arc<FastTimer> {
        &self.timer1s
    }

    /// The 5s timer.
    pub fn timer5s(&self) -> &Arc<FastTimer> {
        &self.timer5s
    }
}
