//! Cooperative task runtime primitives.
//!
//! The server multiplexes every connection on one scheduler: coroutines are
//! named tokio tasks carrying a [`ContextId`](crate::context::ContextId),
//! stopped cooperatively via [`Coroutine::pull`], and woken through
//! conditions and timers. Suspension only happens at explicit awaits, so
//! state shared between components needs no locking beyond reestablishing
//! invariants before each await.
//!
//! - [`coroutine`]: named tasks, stop/interrupt, conditions, wait groups
//! - [`timer`]: the hourglass and the shared fast timers
//! - [`async_call`]: a background worker for off-critical-path blocking work

pub mod async_call;
pub mod coroutine;
pub mod timer;

pub use async_call::{AsyncCallTask, AsyncCallWorker};
pub use coroutine::{CoCond, Coroutine, CoroutineHandler, TaskSpawner, TokioSpawner, WaitGroup};
pub use timer::{
    ClockWallMonitor, FastTimer, FastTimerHandler, Hourglass, HourglassHandler, SharedTimers,
};
