// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{error, span, Level};

/// Represents the current state of a requested transition.
#[derive(PartialEq)]
enum TransitionState {
    Idle,
    Pending,
}

/// A transition is requested by one thread and completed by another. The requester can wait
/// for completion with a deadline.
#[derive(Clone)]
pub struct Transition {
    state: Arc<Mutex<TransitionState>>,
    condvar: Arc<Condvar>,
}

impl Transition {
    /// Creates a new, idle transition.
    pub fn new() -> Transition {
        Transition {
            state: Arc::new(Mutex::new(TransitionState::Idle)),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// Marks the transition as in flight.
    pub fn begin(&self) {
        *self.state.lock() = TransitionState::Pending;
    }

    /// Returns true if the transition has been requested and not yet completed.
    pub fn is_pending(&self) -> bool {
        *self.state.lock() == TransitionState::Pending
    }

    /// Completes the transition and wakes any waiters.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if *state == TransitionState::Pending {
            *state = TransitionState::Idle;
            self.condvar.notify_all();
        }
    }

    /// Waits for the transition to complete. Returns false if the timeout elapsed first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let result = self.condvar.wait_while_for(
            &mut state,
            |state| *state == TransitionState::Pending,
            timeout,
        );
        !result.timed_out() || *state == TransitionState::Idle
    }
}

impl Default for Transition {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a closure periodically on a dedicated thread until stopped. Shutdown is cooperative:
/// the running flag is polled once per period.
pub struct Ticker {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    /// Spawns a named ticker thread.
    pub fn spawn<F>(name: &str, period: Duration, mut tick: F) -> io::Result<Ticker>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            let name = name.to_string();
            thread::Builder::new().name(name.clone()).spawn(move || {
                let span = span!(Level::INFO, "ticker", name = name.as_str());
                let _enter = span.enter();

                while running.load(Ordering::Relaxed) {
                    let started = Instant::now();
                    tick();
                    spin_sleep::sleep(period.saturating_sub(started.elapsed()));
                }
            })?
        };

        Ok(Ticker {
            running,
            handle: Some(handle),
        })
    }

    /// Returns true until the ticker has been asked to stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the ticker and waits for its thread to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testutil::eventually;

    #[test]
    fn test_transition_completed() {
        let transition = Transition::new();
        transition.begin();
        assert!(transition.is_pending());

        let join = {
            let transition = transition.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                transition.complete();
            })
        };

        assert!(transition.wait(Duration::from_secs(5)));
        assert!(!transition.is_pending());
        assert!(join.join().is_ok());
    }

    #[test]
    fn test_transition_times_out() {
        let transition = Transition::new();
        transition.begin();

        let started = Instant::now();
        assert!(!transition.wait(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(transition.is_pending());
    }

    #[test]
    fn test_transition_idle_returns_immediately() {
        let transition = Transition::new();
        assert!(transition.wait(Duration::from_secs(5)));
    }

    #[test]
    fn test_ticker_runs_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut ticker = {
            let count = count.clone();
            Ticker::spawn("test-ticker", Duration::from_millis(1), move || {
                count.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap()
        };

        eventually(
            || count.load(Ordering::Relaxed) >= 5,
            "Ticker never ticked",
        );
        assert!(ticker.is_running());

        ticker.stop();
        assert!(!ticker.is_running());
        let stopped_at = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(stopped_at, count.load(Ordering::Relaxed));
    }
}
