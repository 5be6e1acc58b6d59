//! Owning-sequence primitives.
//!
//! All engine state is mutated on one thread. Blocking work is posted to a
//! [`TaskRunner`], which runs it on a worker thread and hands the result
//! back through a channel; the owner drains results when it chooses to.
//! Deferred work uses [`OneShotTimer`]s that are checked against a
//! [`Clock`] whenever the owner runs pending work.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one clone and hand the
/// other to the engine.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, time: SystemTime) {
        *self.now.lock() = time;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_704_067_200))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// A single-shot deadline.
///
/// A running timer fires at most once; it never queues extra firings.
#[derive(Debug, Default, Clone)]
pub struct OneShotTimer {
    deadline: Option<SystemTime>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer unless it is already running.
    pub fn start(&mut self, now: SystemTime, delay: Duration) {
        if self.deadline.is_none() {
            self.deadline = Some(now + delay);
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    /// Disarm and return `true` if the deadline has passed.
    pub fn take_if_due(&mut self, now: SystemTime) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Result of one posted job.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Done(T),
    /// The job panicked; carries the value supplied for that case
    Aborted(T),
}

impl<T> TaskOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            TaskOutcome::Done(value) | TaskOutcome::Aborted(value) => value,
        }
    }
}

/// Runs blocking jobs on worker threads and collects their results.
///
/// The in-flight count is only touched by the owning thread, so a job that
/// has been posted but not yet drained is always counted.
pub struct TaskRunner<T> {
    tx: Sender<TaskOutcome<T>>,
    rx: Receiver<TaskOutcome<T>>,
    in_flight: Cell<usize>,
}

impl<T: Send + 'static> TaskRunner<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            in_flight: Cell::new(0),
        }
    }

    /// Run `job` on a worker thread.
    ///
    /// If the job panics, `on_abort` is delivered in its place.
    pub fn post<F>(&self, name: &str, job: F, on_abort: T)
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let tx = self.tx.clone();
        let task = name.to_string();
        self.in_flight.set(self.in_flight.get() + 1);
        let spawned = thread::Builder::new()
            .name(format!("k2filter-{}", name))
            .spawn(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                    Ok(value) => TaskOutcome::Done(value),
                    Err(_) => {
                        log::error!("Background task {} panicked", task);
                        TaskOutcome::Aborted(on_abort)
                    }
                };
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn background task {}: {}", name, e);
            self.in_flight.set(self.in_flight.get() - 1);
        }
    }

    /// Take one finished result without blocking.
    pub fn try_next(&self) -> Option<TaskOutcome<T>> {
        let outcome = self.rx.try_recv().ok()?;
        self.in_flight.set(self.in_flight.get() - 1);
        Some(outcome)
    }

    /// Wait up to `timeout` for one finished result.
    ///
    /// Returns `None` immediately when nothing is in flight.
    pub fn next_timeout(&self, timeout: Duration) -> Option<TaskOutcome<T>> {
        if self.in_flight.get() == 0 {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => {
                self.in_flight.set(self.in_flight.get() - 1);
                Some(outcome)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Number of posted jobs whose results have not been drained.
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.get() == 0
    }
}

impl<T: Send + 'static> Default for TaskRunner<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::default();
        let other = clock.clone();
        let start = clock.now();
        other.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), start + Duration::from_secs(5));
    }

    #[test]
    fn test_timer_start_does_not_extend() {
        let clock = ManualClock::default();
        let mut timer = OneShotTimer::new();
        timer.start(clock.now(), Duration::from_secs(10));
        let deadline = timer.deadline();

        clock.advance(Duration::from_secs(5));
        timer.start(clock.now(), Duration::from_secs(10));
        assert_eq!(timer.deadline(), deadline);

        assert!(!timer.take_if_due(clock.now()));
        clock.advance(Duration::from_secs(5));
        assert!(timer.take_if_due(clock.now()));
        // Fires once
        assert!(!timer.take_if_due(clock.now()));
        assert!(!timer.is_running());
    }

    #[test]
    fn test_timer_start_keeps_deadline_and_stop() {
        let clock = ManualClock::default();
        let mut timer = OneShotTimer::new();
        timer.start(clock.now(), Duration::from_secs(1));
        timer.start(clock.now(), Duration::from_secs(10));
        assert_eq!(timer.deadline(), Some(clock.now() + Duration::from_secs(1)));
        clock.advance(Duration::from_secs(1));
        assert!(timer.is_running());
        timer.stop();
        assert!(!timer.take_if_due(clock.now()));
    }

    #[test]
    fn test_runner_delivers_results() {
        let runner: TaskRunner<u32> = TaskRunner::new();
        runner.post("double", || 21 * 2, 0);
        runner.post("one", || 1, 0);
        assert_eq!(runner.in_flight(), 2);

        let mut results = Vec::new();
        while let Some(outcome) = runner.next_timeout(Duration::from_secs(5)) {
            results.push(outcome.into_inner());
        }
        results.sort_unstable();
        assert_eq!(results, vec![1, 42]);
        assert!(runner.is_idle());
        assert!(runner.try_next().is_none());
    }

    #[test]
    fn test_runner_reports_panics() {
        let runner: TaskRunner<&'static str> = TaskRunner::new();
        runner.post("boom", || panic!("boom"), "aborted");
        match runner.next_timeout(Duration::from_secs(5)) {
            Some(TaskOutcome::Aborted(value)) => assert_eq!(value, "aborted"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(runner.is_idle());
    }
}
