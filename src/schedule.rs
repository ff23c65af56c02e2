//! Midnight-aligned refresh scheduling
//!
//! Date-keyed data (today's shifts, today's announcements) goes stale the
//! moment the local date rolls over, not when its TTL runs out. The
//! [`MidnightScheduler`] runs a refresh callback at the next local midnight
//! and every 24 hours after that, one timer per key, with rescheduling and
//! cancellation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Days, Local, TimeZone};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// One civil day, the period between scheduled refreshes.
pub const DAILY_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Time remaining from `now` until the next midnight in `now`'s zone.
///
/// Always in `(0, 24h]`: at exactly midnight the next midnight is a full
/// day away. If a zone transition lands on midnight, the earlier of the two
/// candidate instants is used; if the transition removes midnight entirely,
/// falls back to a flat day.
pub fn delay_until_next_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> Duration {
    let tz = now.timezone();
    let next_day = now.date_naive() + Days::new(1);
    match next_day
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
    {
        Some(midnight) => (midnight - now).to_std().unwrap_or(DAILY_PERIOD),
        None => DAILY_PERIOD,
    }
}

/// Per-key daily refresh timers.
///
/// Dropping the scheduler cancels every armed timer.
pub struct MidnightScheduler {
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MidnightScheduler {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `refresh` at the next local midnight and daily from then on.
    ///
    /// Scheduling a key that already has a timer replaces it; the old timer
    /// never fires again. Refresh errors are logged and the timer keeps
    /// running.
    pub fn schedule<F, Fut>(&self, key: impl Into<String>, refresh: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let initial_delay = delay_until_next_midnight(Local::now());
        self.schedule_at(key, initial_delay, DAILY_PERIOD, refresh);
    }

    /// General form of [`schedule`](Self::schedule): first run after
    /// `initial_delay`, then every `period`.
    pub fn schedule_at<F, Fut>(
        &self,
        key: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
        refresh: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let key = key.into();
        debug!(key = %key, delay_ms = initial_delay.as_millis() as u64, "refresh scheduled");

        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                debug!(key = %task_key, "scheduled refresh firing");
                if let Err(e) = refresh().await {
                    warn!(key = %task_key, error = %e, "scheduled refresh failed");
                }
                tokio::time::sleep(period).await;
            }
        });

        let mut timers = self.lock_timers();
        if let Some(previous) = timers.insert(key.clone(), handle) {
            previous.abort();
            debug!(key = %key, "previous timer replaced");
        }
    }

    /// Disarms the timer for `key`. Returns whether one was armed.
    pub fn cancel(&self, key: &str) -> bool {
        match self.lock_timers().remove(key) {
            Some(handle) => {
                handle.abort();
                debug!(key, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Disarms every timer.
    pub fn cancel_all(&self) {
        let mut timers = self.lock_timers();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Keys that currently have an armed timer.
    pub fn scheduled_keys(&self) -> Vec<String> {
        self.lock_timers().keys().cloned().collect()
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MidnightScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MidnightScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
