use std::sync::{Condvar, Mutex};
use std::thread;

use anyhow::{anyhow, Result};

struct State {
    in_use: usize,
    err: Option<anyhow::Error>,
}

///////////////////////////////
/// Counting semaphore with error capture. Two idioms:
///   acquire / release            explicit slot management
///   go(scope, f)                 spawn f under the limit, collect its error
/// wait() blocks until all slots are released and returns the first error
/// reported. Workers spawned after an error still run; their errors are
/// discarded. check() is the cooperative cancellation point: it fails as
/// soon as any error has been reported.
pub struct Throttle {
    max: usize,
    state: Mutex<State>,
    cond: Condvar,
}

impl Throttle {
    pub fn new(max: usize) -> Throttle {
        Throttle {
            max: max.max(1),
            state: Mutex::new(State {
                in_use: 0,
                err: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut state = self.state.lock().unwrap();
        while state.in_use >= self.max {
            state = self.cond.wait(state).unwrap();
        }
        state.in_use += 1;
    }

    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_use -= 1;
        self.cond.notify_all();
    }

    /// Record err if it is the first one seen.
    pub fn report(&self, err: anyhow::Error) {
        let mut state = self.state.lock().unwrap();
        if state.err.is_none() {
            state.err = Some(err);
        }
        self.cond.notify_all();
    }

    /// Cancellation point: fails once any worker has reported an error.
    pub fn check(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.err.is_some() {
            Err(anyhow!("cancelled after earlier error"))
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().err.is_some()
    }

    /// Spawn f on the scope once a slot is free; release the slot and
    /// capture the error when it finishes.
    pub fn go<'scope, 'env>(
        &'scope self,
        scope: &'scope thread::Scope<'scope, 'env>,
        f: impl FnOnce() -> Result<()> + Send + 'scope,
    ) {
        self.acquire();
        scope.spawn(move || {
            if let Err(err) = f() {
                self.report(err);
            }
            self.release();
        });
    }

    /// Wait for all slots, then return the first reported error (taking it;
    /// a second wait() returns Ok).
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while state.in_use > 0 {
            state = self.cond.wait(state).unwrap();
        }
        match state.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bounds_concurrency() {
        let throttle = Throttle::new(3);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..20 {
                throttle.go(s, || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(std::time::Duration::from_millis(2));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                });
            }
            assert!(throttle.wait().is_ok());
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn first_error_wins_and_later_workers_still_run() {
        let throttle = Throttle::new(2);
        let ran = AtomicUsize::new(0);
        thread::scope(|s| {
            throttle.go(s, || Err(anyhow!("boom 1")));
            // make sure the first error lands before the rest spawn
            while !throttle.is_cancelled() {
                thread::yield_now();
            }
            for _ in 0..4 {
                throttle.go(s, || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow!("late"))
                });
            }
            let err = throttle.wait().unwrap_err();
            assert_eq!(err.to_string(), "boom 1");
        });
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn check_reports_cancellation() {
        let throttle = Throttle::new(1);
        assert!(throttle.check().is_ok());
        throttle.report(anyhow!("stop"));
        assert!(throttle.check().is_err());
        assert!(throttle.is_cancelled());
    }
}
