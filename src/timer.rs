use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TimerState {
    next_due: Option<Instant>,
    period: Option<Duration>,
    shutdown: bool,
}

struct Inner {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Thread-backed timer calling a callback after a due time and then every
/// period.
///
/// A disabled timer keeps its thread parked until it is changed again or
/// dropped. Dropping the timer stops and joins the thread.
pub struct PeriodicTimer {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    /// Create a disabled timer.
    pub fn new<F>(name: &str, callback: F) -> io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let inner = Arc::new(Inner {
            state: Mutex::new(TimerState {
                next_due: None,
                period: None,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });
        let thread_inner = inner.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(thread_inner, callback))?;
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    /// Re-arm the timer. `due: None` disables it; `period: None` makes it
    /// fire once. A due time beyond the range of [`Instant`] never fires.
    pub fn change(&self, due: Option<Duration>, period: Option<Duration>) {
        let mut state = self.inner.lock();
        state.next_due = due.and_then(|d| Instant::now().checked_add(d));
        state.period = period;
        self.inner.condvar.notify_one();
    }

    pub fn disable(&self) {
        self.change(None, None);
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().next_due.is_some()
    }

    fn run<F: Fn()>(inner: Arc<Inner>, callback: F) {
        let mut state = inner.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.next_due {
                None => {
                    state = inner.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
                }
                Some(due) => {
                    let now = Instant::now();
                    if due <= now {
                        // Fires missed while the machine slept collapse into one.
                        state.next_due = state.period.and_then(|p| now.checked_add(p));
                        drop(state);
                        callback();
                        state = inner.lock();
                    } else {
                        state = inner
                            .condvar
                            .wait_timeout(state, due - now)
                            .unwrap_or_else(|e| e.into_inner())
                            .0;
                    }
                }
            }
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.shutdown = true;
            self.inner.condvar.notify_one();
        }
        if let Some(handle) = self.thread.take() {
            // A callback dropping its own timer cannot join itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn disabled_timer_never_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = PeriodicTimer::new("test-timer", move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!timer.is_armed());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn one_shot_fires_once_and_disarms() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = PeriodicTimer::new("test-timer", move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        timer.change(Some(Duration::from_millis(10)), None);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[test]
    fn periodic_timer_fires_until_disabled() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = PeriodicTimer::new("test-timer", move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        timer.change(Some(Duration::ZERO), Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(200));
        timer.disable();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "fired {fired} times");

        std::thread::sleep(Duration::from_millis(50));
        let settled = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn unreachable_due_time_disarms_instead_of_panicking() {
        let timer = PeriodicTimer::new("test-timer", || {}).unwrap();
        timer.change(Some(Duration::MAX), Some(Duration::MAX));
        assert!(!timer.is_armed());
    }

    #[test]
    fn drop_joins_the_timer_thread() {
        let timer = PeriodicTimer::new("test-timer", || {}).unwrap();
        timer.change(Some(Duration::from_secs(3600)), Some(Duration::from_secs(3600)));
        drop(timer);
    }
}
