//! Scheduler.
//!
//! Suspends the cycle until a wall-clock instant using tokio's timer (no
//! polling), draws a 1 Hz countdown while waiting, and aborts pending waits
//! when shutdown is signalled so nothing fires after Ctrl-C.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// The countdown stops this long before the target.
const COUNTDOWN_LEAD: Duration = Duration::from_secs(1);
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system UTC clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock pinned to `anchor` at creation and advanced by tokio's
/// monotonic timer. Under a paused tokio runtime it becomes a virtual clock
/// that moves only when timers fire.
#[derive(Debug, Clone)]
pub struct AnchoredClock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl AnchoredClock {
    pub fn new(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: Instant::now(),
        }
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor + elapsed
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Returned when a pending wait is aborted by shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("scheduled wait cancelled by shutdown")]
pub struct Cancelled;

/// Sending half of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    /// Cancel every pending and future wait.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle(tx), rx)
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
    countdown: bool,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            clock,
            shutdown,
            countdown: false,
        }
    }

    /// Draw the remaining time on stdout while waiting.
    pub fn with_countdown(mut self, enabled: bool) -> Self {
        self.countdown = enabled;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Suspend until the clock reads `at` or later.
    ///
    /// Returns immediately for instants already in the past.
    pub async fn wait_until(&self, at: DateTime<Utc>) -> Result<(), Cancelled> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return Err(Cancelled);
        }

        let remaining = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        info!(
            target_time = %at.to_rfc3339(),
            wait_secs = remaining.as_secs(),
            "Waiting for scheduled time"
        );

        let deadline = Instant::now() + remaining;
        let countdown_end = deadline.checked_sub(COUNTDOWN_LEAD).unwrap_or(deadline);
        let mut ticker = tokio::time::interval(COUNTDOWN_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let mut shutdown_open = true;
        let mut drawn = false;

        let result = loop {
            tokio::select! {
                biased;
                changed = shutdown.changed(), if shutdown_open => {
                    match changed {
                        Ok(()) if *shutdown.borrow_and_update() => break Err(Cancelled),
                        Ok(()) => {}
                        // Sender gone: no shutdown can arrive any more.
                        Err(_) => shutdown_open = false,
                    }
                }
                _ = &mut sleep => break Ok(()),
                _ = ticker.tick(), if self.countdown => {
                    let now = Instant::now();
                    if now < countdown_end {
                        draw_countdown(countdown_end - now);
                        drawn = true;
                    }
                }
            }
        };

        if drawn {
            clear_countdown();
        }
        match result {
            Ok(()) => debug!(target_time = %at.to_rfc3339(), "Scheduled time reached"),
            Err(_) => info!(target_time = %at.to_rfc3339(), "Scheduled wait cancelled"),
        }
        result
    }

    /// Run `callback` once `at` is reached.
    ///
    /// The callback is never invoked if shutdown arrives first.
    pub async fn schedule_at<F, Fut, T>(&self, at: DateTime<Utc>, callback: F) -> Result<T, Cancelled>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.wait_until(at).await?;
        Ok(callback().await)
    }
}

/// `HH:MM:SS` for a number of seconds. Hours are not wrapped at 24.
pub fn format_countdown(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

fn draw_countdown(remaining: Duration) {
    let secs = remaining.as_secs_f64().round() as u64;
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "\r{}", format_countdown(secs));
    let _ = out.flush();
}

fn clear_countdown() {
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "\r{:width$}\r", "", width = 16);
    let _ = out.flush();
}
