//! Stall detection for the scheduler loop.
//!
//! The scheduler bumps a [`Heartbeat`] on every tick. A [`Watchdog`] runs on
//! its own OS thread, so it keeps working when the async runtime is wedged,
//! and fires its restart hook if the heartbeat stops advancing for longer
//! than the configured stall threshold.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Exit status used by the default restart hook, so a supervisor can tell a
/// watchdog restart from a crash.
pub const WATCHDOG_EXIT_CODE: i32 = 75;

pub type RestartHook = Arc<dyn Fn() + Send + Sync>;

/// Exit the process with [`WATCHDOG_EXIT_CODE`].
pub fn exit_hook() -> RestartHook {
    Arc::new(|| std::process::exit(WATCHDOG_EXIT_CODE))
}

/// Monotonic "last alive" marker, in milliseconds since creation.
pub struct Heartbeat {
    origin: Instant,
    last_ms: AtomicU64,
    beats: AtomicU64,
}

/// Whole milliseconds in `d`, saturating.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
            beats: AtomicU64::new(0),
        }
    }

    pub fn beat(&self) {
        let ms = millis(self.origin.elapsed());
        self.last_ms.store(ms, Ordering::Release);
        self.beats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    /// Time since the last beat.
    pub fn silence(&self) -> Duration {
        let now = millis(self.origin.elapsed());
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Acquire)))
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

struct Stop {
    stopped: Mutex<bool>,
    cv: Condvar,
}

pub struct Watchdog {
    stop: Arc<Stop>,
    fired: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start watching `heartbeat`. The hook runs at most once.
    pub fn spawn(heartbeat: Arc<Heartbeat>, stall: Duration, hook: RestartHook) -> std::io::Result<Self> {
        let stop = Arc::new(Stop {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });
        let fired = Arc::new(AtomicBool::new(false));
        let check_every = (stall / 4).max(Duration::from_millis(10));

        let thread = {
            let stop = Arc::clone(&stop);
            let fired = Arc::clone(&fired);
            std::thread::Builder::new()
                .name("tessera-watchdog".into())
                .spawn(move || {
                    let mut stopped = stop.stopped.lock().unwrap_or_else(PoisonError::into_inner);
                    loop {
                        let (guard, _) = stop
                            .cv
                            .wait_timeout(stopped, check_every)
                            .unwrap_or_else(PoisonError::into_inner);
                        stopped = guard;
                        if *stopped {
                            return;
                        }
                        let silence = heartbeat.silence();
                        if silence >= stall {
                            tracing::error!(
                                silent_ms = millis(silence),
                                stall_ms = millis(stall),
                                "scheduler loop stalled, restarting"
                            );
                            fired.store(true, Ordering::SeqCst);
                            hook();
                            return;
                        }
                    }
                })?
        };

        Ok(Self {
            stop,
            fired,
            thread: Some(thread),
        })
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Stop the watchdog thread and wait for it.
    pub fn stop(&mut self) {
        *self.stop.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.stop.cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_hook() -> (RestartHook, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        let hook: RestartHook = Arc::new(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });
        (hook, count)
    }

    #[test]
    fn millis_saturates_instead_of_wrapping() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
        // twice u64::MAX milliseconds
        assert_eq!(millis(Duration::from_secs(u64::MAX / 500)), u64::MAX);
    }

    #[test]
    fn fires_once_when_heartbeat_stops() {
        let heartbeat = Arc::new(Heartbeat::new());
        heartbeat.beat();
        let (hook, count) = counting_hook();
        let mut dog = Watchdog::spawn(Arc::clone(&heartbeat), Duration::from_millis(50), hook).unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert!(dog.has_fired());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        dog.stop();
    }

    #[test]
    fn quiet_while_heartbeat_advances() {
        let heartbeat = Arc::new(Heartbeat::new());
        let (hook, count) = counting_hook();
        let mut dog = Watchdog::spawn(Arc::clone(&heartbeat), Duration::from_millis(200), hook).unwrap();

        for _ in 0..30 {
            heartbeat.beat();
            std::thread::sleep(Duration::from_millis(10));
        }
        dog.stop();
        assert!(!dog.has_fired());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(heartbeat.beats() >= 30);
    }
}
