use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Adaptive backoff for the dispatch loop: sleeps longer the more consecutive
/// iterations pass without a message moving, and collapses back to the floor
/// the instant one does.
///
/// The sleep is wakeable: a shutdown request cuts it short without treating the
/// wake as a failure, distinguishing it from a genuinely spurious wake on the
/// underlying condition variable, which is treated as fatal (see [`LoopControl::sleep`]).
#[derive(Debug)]
pub struct LoopControl {
    max_sleep: Duration,
    current_sleep: Mutex<Duration>,
    processed_this_iteration: Mutex<u64>,
    wake: Condvar,
    wake_lock: Mutex<bool>,
}

const FLOOR: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum LoopControlError {
    #[error("wakeable sleep observed a spurious wake unrelated to shutdown")]
    SpuriousWake,
}

impl LoopControl {
    pub fn new(max_sleep: Duration) -> Self {
        Self {
            max_sleep,
            current_sleep: Mutex::new(FLOOR),
            processed_this_iteration: Mutex::new(0),
            wake: Condvar::new(),
            wake_lock: Mutex::new(false),
        }
    }

    /// Called once per message moved (inbound delivered or outbound posted).
    pub fn increment_processed(&self) {
        *self.processed_this_iteration.lock().unwrap() += 1;
    }

    /// End-of-iteration barrier: resets the backoff on activity, otherwise
    /// sleeps the current backoff duration and doubles it, clamped to the
    /// configured ceiling.
    pub fn iteration_finished(&self) -> Result<(), LoopControlError> {
        let mut processed = self.processed_this_iteration.lock().unwrap();
        if *processed > 0 {
            *processed = 0;
            *self.current_sleep.lock().unwrap() = FLOOR;
            return Ok(());
        }
        drop(processed);

        let slept = self.current_sleep();
        self.sleep(slept)?;

        let mut current = self.current_sleep.lock().unwrap();
        *current = (*current * 2).min(self.max_sleep);
        Ok(())
    }

    pub fn current_sleep(&self) -> Duration {
        *self.current_sleep.lock().unwrap()
    }

    /// Requests that any in-progress or future sleep return immediately. Not
    /// itself a failure; the loop observes this as a normal wake.
    pub fn wake(&self) {
        *self.wake_lock.lock().unwrap() = true;
        self.wake.notify_all();
    }

    fn sleep(&self, duration: Duration) -> Result<(), LoopControlError> {
        let guard = self.wake_lock.lock().unwrap();
        if *guard {
            return Ok(());
        }
        let (guard, timeout) = self
            .wake
            .wait_timeout(guard, duration)
            .map_err(|_| LoopControlError::SpuriousWake)?;

        if *guard {
            // Shutdown requested the wake; not a failure.
            Ok(())
        } else if timeout.timed_out() {
            // The sleep simply elapsed; also not a failure.
            Ok(())
        } else {
            // Condvar reported neither timeout nor a set flag: a spurious
            // wake on the underlying primitive itself, not a requested one.
            Err(LoopControlError::SpuriousWake)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resets_to_floor_on_activity() {
        let lc = LoopControl::new(Duration::from_millis(64));
        lc.increment_processed();
        lc.iteration_finished().unwrap();
        assert_eq!(lc.current_sleep(), FLOOR);
    }

    #[test]
    fn doubles_on_idle_iterations_and_clamps() {
        let lc = LoopControl::new(Duration::from_millis(8));
        let expected = [1u64, 2, 4, 8, 8, 8];
        for expect_ms in expected {
            lc.iteration_finished().unwrap();
            assert_eq!(lc.current_sleep(), Duration::from_millis(expect_ms));
        }
    }

    #[test]
    fn activity_after_backoff_collapses_to_floor() {
        let lc = LoopControl::new(Duration::from_millis(64));
        for _ in 0..5 {
            lc.iteration_finished().unwrap();
        }
        assert!(lc.current_sleep() > FLOOR);

        lc.increment_processed();
        lc.iteration_finished().unwrap();
        assert_eq!(lc.current_sleep(), FLOOR);
    }

    #[test]
    fn wake_cuts_sleep_short() {
        use std::sync::Arc;
        use std::thread;

        let lc = Arc::new(LoopControl::new(Duration::from_secs(5)));
        let lc2 = Arc::clone(&lc);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            lc2.wake();
        });

        let started = std::time::Instant::now();
        lc.iteration_finished().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }
}
