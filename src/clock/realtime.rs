//! Wall-clock pulse source.
//!
//! A background thread sleeps and counts pulses into an atomic. The
//! emulation thread drains the counter at instruction boundaries; the
//! thread itself never touches timer state.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

pub struct RealtimePulser {
    pending: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RealtimePulser {
    /// Spawn the pulse thread.
    ///
    /// Periods shorter than `min_period` are coalesced: the thread sleeps
    /// `min_period` and credits the number of periods that fit in it.
    pub fn spawn(period: Duration, min_period: Duration) -> io::Result<Self> {
        let period = period.max(Duration::from_micros(1));
        let sleep = period.max(min_period);
        let per_wake = u64::try_from(sleep.as_nanos().div_ceil(period.as_nanos()))
            .unwrap_or(u64::MAX)
            .max(1);

        let pending = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let pending = pending.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("relic-clock".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        thread::sleep(sleep);
                        pending.fetch_add(per_wake, Ordering::AcqRel);
                    }
                })?
        };
        debug!("clock: pulse thread started ({:?} x{})", sleep, per_wake);

        Ok(Self {
            pending,
            stop,
            handle: Some(handle),
        })
    }

    /// Take every pulse accumulated since the last drain.
    pub fn drain(&self) -> u64 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!("clock: pulse thread stopped");
        }
    }
}

impl Drop for RealtimePulser {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_pulses_accumulate_and_stop_promptly() {
        let mut pulser =
            RealtimePulser::spawn(Duration::from_millis(1), Duration::from_millis(1)).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(pulser.drain() > 0);

        let started = Instant::now();
        pulser.stop();
        assert!(started.elapsed() < Duration::from_millis(500));

        pulser.drain();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(pulser.drain(), 0);
    }

    #[test]
    fn test_short_periods_are_coalesced() {
        let mut pulser =
            RealtimePulser::spawn(Duration::from_micros(100), Duration::from_millis(2)).unwrap();
        thread::sleep(Duration::from_millis(20));
        pulser.stop();
        let total = pulser.drain();
        assert!(total > 0);
        assert_eq!(total % 20, 0);
    }
}
