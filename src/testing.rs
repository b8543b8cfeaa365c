//! Deterministic clock and scheduler for exercising the retry and bundling
//! engines without real timers.
//!
//! [`FakeClock`] is an atomic nanosecond counter; [`RecordingScheduler`]
//! records every sleep it is asked for, advances the fake clock by that
//! amount, and completes the sleep immediately (scheduled tasks are spawned
//! right away). Together they make backoff schedules observable: a test
//! runs a callable to completion and then asserts on the exact sequence of
//! sleep durations the engine requested.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::scheduler::{Clock, Scheduler, TimerHandle};

/// Synthetic monotonic clock backed by an atomic nanosecond counter.
#[derive(Debug, Default)]
pub struct FakeClock {
    nanos: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now: Duration) {
        self.nanos.store(now.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Scheduler that records sleeps, advances a [`FakeClock`] in place of real
/// waiting, and runs scheduled tasks immediately.
pub struct RecordingScheduler {
    clock: Arc<FakeClock>,
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingScheduler {
    pub fn new(clock: Arc<FakeClock>) -> Self {
        Self {
            clock,
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Every sleep duration delivered to this scheduler, in order.
    pub fn sleep_durations(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("recording lock").clone()
    }

    fn record(&self, delay: Duration) {
        self.sleeps.lock().expect("recording lock").push(delay);
        self.clock.advance(delay);
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        self.record(delay);
        tokio::spawn(task);
        TimerHandle::noop()
    }

    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        self.record(delay);
        Box::pin(async {})
    }
}
