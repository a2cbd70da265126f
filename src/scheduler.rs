//! Periodic trigger for reconciliation ticks.
//!
//! The tick timer only marshals a [`AppEvent::Tick`] onto the event loop
//! through a bounded queue. A [`TickBudget`] keeps at most two ticks queued or
//! running so that the burst of fires following a resume from sleep does not
//! pile up. A second, slow watchdog timer rebuilds the tick timer from scratch
//! every `full_restart_interval`.

use crate::app::AppEvent;
use crate::timer::PeriodicTimer;
use anyhow::{ensure, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Maximum number of ticks queued or running at the same time.
pub const MAX_PENDING_TICKS: usize = 2;

/// Count of ticks dispatched but not yet started by the event loop.
#[derive(Debug)]
pub struct TickBudget {
    pending: AtomicUsize,
}

impl Default for TickBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl TickBudget {
    /// The budget starts at one, standing for the initial tick run at start.
    pub fn new() -> Self {
        Self {
            pending: AtomicUsize::new(1),
        }
    }

    /// Reserve a slot for a new tick; `false` means the tick must be dropped.
    pub fn try_acquire(&self) -> bool {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending > MAX_PENDING_TICKS {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Give back a slot when a tick starts; returns the remaining count.
    pub fn release(&self) -> usize {
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed,
    Stopped,
}

/// Diagnostics returned when the event loop starts a tick.
#[derive(Debug, Clone, Copy)]
pub struct TickStart {
    /// Time since the previous tick started.
    pub elapsed: Duration,
    /// Ticks still queued after this one.
    pub pending: usize,
}

struct Shared {
    budget: TickBudget,
    sender: SyncSender<AppEvent>,
    interval: Duration,
    stopped: AtomicBool,
    last_tick: Mutex<Instant>,
    /// Whole seconds since the previous tick, sampled when a fire is accepted.
    last_total_elapsed: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    renewals: AtomicU64,
}

impl Shared {
    fn on_timer_fired(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        // Protection against reentering too many times after a sleep/wake up.
        if !self.budget.try_acquire() {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return false;
        }

        let elapsed = self
            .last_tick
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.last_total_elapsed
            .store(elapsed.as_secs_f64().round() as u64, Ordering::SeqCst);

        match self.sender.try_send(AppEvent::Tick) {
            Ok(()) => {
                self.dispatched.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.budget.release();
                self.dropped.fetch_add(1, Ordering::SeqCst);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.budget.release();
                false
            }
        }
    }
}

fn build_tick_timer(shared: &Arc<Shared>) -> Result<PeriodicTimer> {
    let callback_shared = shared.clone();
    let timer = PeriodicTimer::new("update-lock-tick", move || {
        callback_shared.on_timer_fired();
    })
    .context("create tick timer")?;
    timer.change(Some(shared.interval), Some(shared.interval));
    Ok(timer)
}

fn renew_tick_timer(shared: &Arc<Shared>, slot: &Mutex<Option<PeriodicTimer>>, next_check: Duration) {
    if shared.stopped.load(Ordering::SeqCst) {
        return;
    }
    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(old) = slot.take() {
        tracing::info!("Restarting the timer");
        old.disable();
        drop(old);
        match build_tick_timer(shared) {
            Ok(timer) => {
                *slot = Some(timer);
                shared.renewals.fetch_add(1, Ordering::SeqCst);
                tracing::info!("Timer restarted");
            }
            Err(err) => tracing::error!("(from renew_tick_timer) {err:#}"),
        }
    } else {
        tracing::info!("No timer to restart");
    }

    let now = chrono::Utc::now();
    match chrono::Duration::from_std(next_check)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
    {
        Some(next) => tracing::info!("Next check scheduled at {next}"),
        None => tracing::info!("Next check scheduled at never"),
    }
}

pub struct TickScheduler {
    shared: Arc<Shared>,
    full_restart_interval: Duration,
    tick_timer: Arc<Mutex<Option<PeriodicTimer>>>,
    watchdog: Option<PeriodicTimer>,
    state: SchedulerState,
}

impl TickScheduler {
    /// Create an idle scheduler sending ticks to `sender`.
    pub fn new(interval: Duration, full_restart_interval: Duration, sender: SyncSender<AppEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                budget: TickBudget::new(),
                sender,
                interval,
                stopped: AtomicBool::new(false),
                last_tick: Mutex::new(Instant::now()),
                last_total_elapsed: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                renewals: AtomicU64::new(0),
            }),
            full_restart_interval,
            tick_timer: Arc::new(Mutex::new(None)),
            watchdog: None,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Queue the initial tick and arm both timers.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SchedulerState::Idle {
            return Ok(());
        }
        ensure!(
            !self.shared.interval.is_zero() && !self.full_restart_interval.is_zero(),
            "tick and restart intervals must be positive"
        );

        // The budget is pre-armed for this tick.
        if let Err(err) = self.shared.sender.try_send(AppEvent::Tick) {
            tracing::warn!("initial tick not queued: {err}");
            self.shared.budget.release();
        }

        let timer = build_tick_timer(&self.shared)?;
        *self.tick_timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(timer);

        let shared = self.shared.clone();
        let slot = self.tick_timer.clone();
        let period = self.full_restart_interval;
        let watchdog = PeriodicTimer::new("update-lock-watchdog", move || {
            renew_tick_timer(&shared, &slot, period);
        })
        .context("create watchdog timer")?;
        watchdog.change(Some(period), Some(period));
        self.watchdog = Some(watchdog);

        self.state = SchedulerState::Armed;
        tracing::debug!(
            "tick scheduler armed: every {:?}, timer rebuilt every {:?}",
            self.shared.interval,
            period
        );
        Ok(())
    }

    /// Entry point of a tick timer fire. Returns `true` when a tick was queued.
    pub fn on_timer_fired(&self) -> bool {
        self.shared.on_timer_fired()
    }

    /// Called by the event loop when it starts processing a tick.
    pub fn begin_tick(&self) -> TickStart {
        let pending = self.shared.budget.release();
        let elapsed = {
            let mut last = self
                .shared
                .last_tick
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        tracing::debug!(
            "Watch restarted, Elapsed = {}, pending count = {}",
            self.shared.last_total_elapsed.load(Ordering::SeqCst),
            pending
        );
        TickStart { elapsed, pending }
    }

    /// Rebuild the tick timer now, as the watchdog does periodically.
    pub fn renew_tick_timer(&self) {
        renew_tick_timer(&self.shared, &self.tick_timer, self.full_restart_interval);
    }

    /// Disable both timers without destroying them. Ticks already queued are
    /// still delivered.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(watchdog) = &self.watchdog {
            watchdog.disable();
        }
        if let Some(timer) = self
            .tick_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            timer.disable();
        }
        self.state = SchedulerState::Stopped;
        tracing::debug!("tick scheduler stopped");
    }

    pub fn is_tick_timer_armed(&self) -> bool {
        self.tick_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| t.is_armed())
            .unwrap_or(false)
    }

    pub fn pending_ticks(&self) -> usize {
        self.shared.budget.pending()
    }

    pub fn dispatched_ticks(&self) -> u64 {
        self.shared.dispatched.load(Ordering::SeqCst)
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    pub fn timer_renewals(&self) -> u64 {
        self.shared.renewals.load(Ordering::SeqCst)
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        // The watchdog goes first so it cannot rebuild a timer being destroyed.
        self.watchdog.take();
        self.tick_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}
