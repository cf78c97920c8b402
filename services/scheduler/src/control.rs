//! Control-loop framework.
//!
//! Every long-running activity of the scheduler (one loop per transaction,
//! the rolling deployment controller) is a [`ControlLoop`] driven by
//! [`spawn_loop`]:
//! - ticks on a fixed interval while *open*
//! - takes `Open`/`Close`/`Stop` signals on a bounded queue, checked before ticks
//! - backs off on transient errors and exits on permanent ones
//!
//! Closing a loop stops new cycles; a tick that already started runs to
//! completion. This is how leadership loss quiesces the scheduler.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// What a loop wants after one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Continue,
    /// The loop reached its end state and exits.
    Done,
}

/// A unit of periodic work.
#[async_trait]
pub trait ControlLoop: Send + 'static {
    /// Loop name for logging.
    fn name(&self) -> &str;

    async fn tick(&mut self) -> Result<LoopStatus, LoopError>;

    /// Called once before the loop task exits for any reason.
    async fn on_stop(&mut self) {}
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum LoopError {
    /// Retried after a backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Ends the loop.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("loop stopped")]
    Stopped,

    #[error("control queue full")]
    QueueFull,
}

// =============================================================================
// Handle
// =============================================================================

/// Control signals, processed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Open,
    Close,
    Stop,
}

/// Why a loop task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Done,
    Stopped,
    Failed(String),
}

/// Handle to a spawned loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct LoopHandle {
    name: String,
    tx: mpsc::Sender<ControlSignal>,
    task: JoinHandle<LoopExit>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn signal(&self, signal: ControlSignal) -> Result<(), LoopError> {
        self.tx.try_send(signal).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LoopError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => LoopError::Stopped,
        })
    }

    pub fn open(&self) -> Result<(), LoopError> {
        self.signal(ControlSignal::Open)
    }

    pub fn close(&self) -> Result<(), LoopError> {
        self.signal(ControlSignal::Close)
    }

    pub fn stop(&self) -> Result<(), LoopError> {
        self.signal(ControlSignal::Stop)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop task to end.
    pub async fn join(self) -> LoopExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => LoopExit::Failed(e.to_string()),
        }
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);
        let jittered = delay + delay * self.jitter * unit_jitter();
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Uniform value in [-1, 1], taken from the random bits of a fresh ULID.
fn unit_jitter() -> f64 {
    let random = ulid::Ulid::new().random() as u64;
    (random as f64 / u64::MAX as f64) * 2.0 - 1.0
}

// =============================================================================
// Loop runner
// =============================================================================

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub interval: Duration,
    pub queue_depth: usize,
    pub backoff: BackoffPolicy,
    /// Whether the loop ticks before receiving `Open`.
    pub start_open: bool,
}

impl LoopOptions {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            queue_depth: 16,
            backoff: BackoffPolicy::default(),
            start_open: true,
        }
    }

    pub fn closed(mut self) -> Self {
        self.start_open = false;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

pub fn spawn_loop<L: ControlLoop>(control: L, options: LoopOptions) -> LoopHandle {
    let name = control.name().to_string();
    let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
    let task = tokio::spawn(run_loop(control, rx, options));
    debug!(loop_name = %name, "Spawned control loop");
    LoopHandle { name, tx, task }
}

async fn run_loop<L: ControlLoop>(
    mut control: L,
    mut rx: mpsc::Receiver<ControlSignal>,
    options: LoopOptions,
) -> LoopExit {
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut open = options.start_open;
    let mut failures: u32 = 0;

    let exit = loop {
        tokio::select! {
            biased;

            signal = rx.recv() => match signal {
                Some(ControlSignal::Open) => {
                    if !open {
                        debug!(loop_name = %control.name(), "Loop opened");
                        ticker.reset();
                    }
                    open = true;
                }
                Some(ControlSignal::Close) => {
                    debug!(loop_name = %control.name(), "Loop closed");
                    open = false;
                }
                Some(ControlSignal::Stop) | None => break LoopExit::Stopped,
            },

            _ = ticker.tick(), if open => match control.tick().await {
                Ok(LoopStatus::Continue) => failures = 0,
                Ok(LoopStatus::Done) => break LoopExit::Done,
                Err(LoopError::Transient(e)) => {
                    let delay = options.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        loop_name = %control.name(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Loop tick failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(loop_name = %control.name(), error = %e, "Loop failed");
                    break LoopExit::Failed(e.to_string());
                }
            },
        }
    };

    control.on_stop().await;
    debug!(loop_name = %control.name(), exit = ?exit, "Control loop exited");
    exit
}

/// Retries `op` with backoff until it succeeds or `shutdown` flips to true.
pub async fn retry_with_backoff<T, E, F, Fut>(
    what: &str,
    policy: &BackoffPolicy,
    shutdown: &mut watch::Receiver<bool>,
    mut op: F,
) -> Result<T, LoopError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return Err(LoopError::Stopped);
        }
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(what = %what, attempts = attempt + 1, "Succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                warn!(
                    what = %what,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Err(LoopError::Stopped);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    struct Counter {
        ticks: Arc<AtomicU32>,
        done_after: Option<u32>,
        fail_first: u32,
    }

    #[async_trait]
    impl ControlLoop for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn tick(&mut self) -> Result<LoopStatus, LoopError> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(LoopError::Transient("not yet".into()));
            }
            if self.done_after.is_some_and(|d| n >= d) {
                return Ok(LoopStatus::Done);
            }
            Ok(LoopStatus::Continue)
        }
    }

    fn counter(done_after: Option<u32>) -> (Counter, Arc<AtomicU32>) {
        let ticks = Arc::new(AtomicU32::new(0));
        (
            Counter {
                ticks: ticks.clone(),
                done_after,
                fail_first: 0,
            },
            ticks,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_until_done() {
        let (c, ticks) = counter(Some(3));
        let handle = spawn_loop(c, LoopOptions::new(Duration::from_secs(1)));
        assert_eq!(handle.join().await, LoopExit::Done);
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_loop_does_not_tick() {
        let (c, ticks) = counter(None);
        let handle = spawn_loop(c, LoopOptions::new(Duration::from_secs(1)).closed());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        handle.open().unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let after_open = ticks.load(Ordering::SeqCst);
        assert!(after_open >= 2);

        handle.close().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let frozen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), frozen);

        handle.stop().unwrap();
        assert_eq!(handle.join().await, LoopExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let (mut c, ticks) = counter(Some(4));
        c.fail_first = 2;
        let handle = spawn_loop(c, LoopOptions::new(Duration::from_millis(100)));
        assert_eq!(handle.join().await, LoopExit::Done);
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_loop() {
        let (c, ticks) = counter(None);
        let handle = spawn_loop(c, LoopOptions::new(Duration::from_secs(1)));
        let LoopHandle { task, tx, .. } = handle;
        drop(tx);
        assert_eq!(task.await.unwrap(), LoopExit::Stopped);
        assert!(ticks.load(Ordering::SeqCst) <= 1);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let policy = BackoffPolicy::default();
        let attempts = Arc::new(AtomicU32::new(0));

        let task = {
            let attempts = attempts.clone();
            tokio::spawn(async move {
                retry_with_backoff("always failing", &policy, &mut rx, |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("nope") }
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.send(true).unwrap();
        assert!(matches!(task.await.unwrap(), Err(LoopError::Stopped)));
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }
}
