//! Per-account sliding-window quota manager
//!
//! Gmail charges every API call a number of quota units (see
//! [`OperationKind::cost`](crate::models::OperationKind::cost)) against a
//! per-user budget. This module keeps one usage ledger per account:
//! - Entries are `(instant, units)` pairs inside a trailing window
//! - Entries older than the window are pruned lazily on every access
//! - Admission blocks until the window has room instead of overshooting
//! - Admitted-but-unfinished calls hold a reservation that counts toward
//!   the window, so concurrent callers cannot both see the same free room
//! - Reservations do not expire with the window; a call that is still
//!   retrying keeps its units until it records or releases them
//!
//! A sliding window is used rather than a periodic reset so that callers
//! waiting at a window boundary do not all fire at once.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::QuotaConfig;
use crate::error::{GmailError, Result};

#[derive(Debug, Clone, Copy)]
struct UsageEntry {
    at: Instant,
    units: i64,
}

/// Usage ledger for one account
#[derive(Debug, Default)]
struct UsageLedger {
    /// Completed calls, oldest first
    recorded: VecDeque<UsageEntry>,
    /// Admitted calls that have not been recorded or released yet
    reserved: VecDeque<UsageEntry>,
    total_consumed: u64,
    total_operations: u64,
}

impl UsageLedger {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.recorded.front() {
            if now.duration_since(front.at) >= window {
                self.recorded.pop_front();
            } else {
                break;
            }
        }
    }

    fn used(&self) -> i64 {
        self.recorded.iter().map(|e| e.units).sum()
    }

    fn reserved_units(&self) -> i64 {
        self.reserved.iter().map(|e| e.units).sum()
    }

    fn window_sum(&self) -> i64 {
        self.used() + self.reserved_units()
    }

    /// Remove the oldest reservation of exactly `units`
    fn take_reservation(&mut self, units: i64) -> bool {
        match self.reserved.iter().position(|e| e.units == units) {
            Some(index) => {
                self.reserved.remove(index);
                true
            }
            None => false,
        }
    }

    /// How long until at least `needed` recorded units roll out of the window
    ///
    /// Reservations never age out; they leave only through a record or a
    /// release, so they are not counted here.
    fn time_until_freed(&self, now: Instant, window: Duration, needed: i64) -> Option<Duration> {
        let mut freed = 0;
        for entry in &self.recorded {
            freed += entry.units;
            if freed >= needed {
                let age = now.duration_since(entry.at);
                return Some(window.saturating_sub(age));
            }
        }
        None
    }
}

/// Snapshot of an account's quota usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub account: String,
    pub enabled: bool,
    /// Units recorded inside the current window
    pub used: i64,
    /// Units admitted but not yet recorded
    pub reserved: i64,
    pub remaining: i64,
    pub budget: i64,
    pub window_secs: u64,
    /// Units recorded since the manager was created
    pub total_consumed: u64,
    pub total_operations: u64,
}

/// Sliding-window quota manager shared by every caller of an account
///
/// Cloning is cheap and clones share state.
#[derive(Debug, Clone)]
pub struct QuotaManager {
    inner: Arc<QuotaManagerInner>,
}

#[derive(Debug)]
struct QuotaManagerInner {
    enabled: bool,
    budget: i64,
    window: Duration,
    poll_interval: Duration,
    ledgers: RwLock<HashMap<String, Arc<Mutex<UsageLedger>>>>,
}

impl QuotaManager {
    /// Create a quota manager from configuration
    pub fn new(config: &QuotaConfig) -> Self {
        Self::build(
            config.enabled,
            config.budget,
            Duration::from_secs(config.window_secs),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    /// Create an enabled quota manager with explicit limits
    ///
    /// # Arguments
    /// * `budget` - Quota units allowed per account inside one window
    /// * `window` - Length of the trailing window
    /// * `poll_interval` - Longest single sleep before re-checking the window
    pub fn with_limits(budget: i64, window: Duration, poll_interval: Duration) -> Self {
        Self::build(true, budget, window, poll_interval)
    }

    /// A manager whose operations are no-ops that always admit
    pub fn disabled() -> Self {
        let defaults = QuotaConfig::default();
        Self::new(&QuotaConfig {
            enabled: false,
            ..defaults
        })
    }

    fn build(enabled: bool, budget: i64, window: Duration, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(QuotaManagerInner {
                enabled,
                budget,
                window,
                poll_interval,
                ledgers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn budget(&self) -> i64 {
        self.inner.budget
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    async fn ledger(&self, account: &str) -> Arc<Mutex<UsageLedger>> {
        if let Some(ledger) = self.inner.ledgers.read().await.get(account) {
            return Arc::clone(ledger);
        }
        let mut ledgers = self.inner.ledgers.write().await;
        Arc::clone(ledgers.entry(account.to_string()).or_default())
    }

    /// Record `units` consumed by a completed call at the current time
    ///
    /// A matching reservation left by [`wait_for_quota`](Self::wait_for_quota)
    /// is consumed so the call is only counted once.
    pub async fn record_usage(&self, account: &str, units: i64) -> Result<()> {
        if units < 0 {
            return Err(GmailError::InvalidQuotaUnits(units));
        }
        if !self.inner.enabled {
            return Ok(());
        }

        let ledger = self.ledger(account).await;
        let mut ledger = ledger.lock().await;
        let now = Instant::now();
        ledger.prune(now, self.inner.window);
        ledger.take_reservation(units);
        ledger.recorded.push_back(UsageEntry { at: now, units });
        ledger.total_consumed += units as u64;
        ledger.total_operations += 1;

        trace!(
            account,
            units,
            used = ledger.used(),
            reserved = ledger.reserved_units(),
            "Recorded quota usage"
        );
        Ok(())
    }

    /// Wait until `units` fit in the account's window, then reserve them
    ///
    /// The window is re-evaluated after every sleep, since other callers may
    /// consume or release budget while this one waits.
    pub async fn wait_for_quota(&self, account: &str, units: i64) -> Result<()> {
        if units < 0 {
            return Err(GmailError::InvalidQuotaUnits(units));
        }
        if !self.inner.enabled {
            return Ok(());
        }
        if units > self.inner.budget {
            return Err(GmailError::QuotaExceeded(format!(
                "request needs {} units but the budget is {} per {:?}",
                units, self.inner.budget, self.inner.window
            )));
        }

        let ledger = self.ledger(account).await;
        let mut waited = Duration::ZERO;

        loop {
            let wait_time = {
                let mut ledger = ledger.lock().await;
                let now = Instant::now();
                ledger.prune(now, self.inner.window);

                let in_window = ledger.window_sum();
                trace!(
                    account,
                    in_window,
                    budget = self.inner.budget,
                    requested = units,
                    "Quota window state"
                );

                if in_window + units <= self.inner.budget {
                    ledger.reserved.push_back(UsageEntry { at: now, units });
                    if waited > Duration::ZERO {
                        debug!(
                            "Admitted {} units for {} after waiting {:.2}s",
                            units,
                            account,
                            waited.as_secs_f64()
                        );
                    }
                    return Ok(());
                }

                let needed = in_window + units - self.inner.budget;
                ledger
                    .time_until_freed(now, self.inner.window, needed)
                    .unwrap_or(self.inner.poll_interval)
                    .min(self.inner.poll_interval)
                    .max(Duration::from_millis(1))
            };

            // Sleep outside the lock so other callers can record and release
            debug!(
                "Quota window full for {}, re-checking in {:.3}s ({} units requested)",
                account,
                wait_time.as_secs_f64(),
                units
            );
            tokio::time::sleep(wait_time).await;
            waited += wait_time;
        }
    }

    /// Drop a reservation whose call failed and will not be recorded
    pub async fn release(&self, account: &str, units: i64) {
        if !self.inner.enabled || units <= 0 {
            return;
        }
        let ledger = self.ledger(account).await;
        let mut ledger = ledger.lock().await;
        if ledger.take_reservation(units) {
            trace!(account, units, "Released quota reservation");
        }
    }

    /// Current window consumption and remaining budget, without waiting
    pub async fn get_usage(&self, account: &str) -> QuotaUsage {
        let window_secs = self.inner.window.as_secs();
        if !self.inner.enabled {
            return QuotaUsage {
                account: account.to_string(),
                enabled: false,
                used: 0,
                reserved: 0,
                remaining: self.inner.budget,
                budget: self.inner.budget,
                window_secs,
                total_consumed: 0,
                total_operations: 0,
            };
        }

        let ledger = self.ledger(account).await;
        let mut ledger = ledger.lock().await;
        ledger.prune(Instant::now(), self.inner.window);
        let used = ledger.used();
        let reserved = ledger.reserved_units();

        QuotaUsage {
            account: account.to_string(),
            enabled: true,
            used,
            reserved,
            remaining: (self.inner.budget - used - reserved).max(0),
            budget: self.inner.budget,
            window_secs,
            total_consumed: ledger.total_consumed,
            total_operations: ledger.total_operations,
        }
    }
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::new(&QuotaConfig::default())
    }
}
