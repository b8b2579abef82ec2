//! Resettable keep-alive timer.
//!
//! One worker thread, armed on connect and re-armed by every successful
//! send, so the ping only goes out when the line has actually been quiet
//! for a full interval.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

struct State {
    /// `None` while stopped.
    deadline: Option<Instant>,
    interval: Duration,
    shutdown: bool,
}

pub struct KeepAliveTimer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl KeepAliveTimer {
    /// Create a stopped timer. `on_fire` runs on the worker thread each
    /// time a full interval passes without a reset.
    pub fn new(interval: Duration, on_fire: Box<dyn Fn() + Send + Sync>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                deadline: None,
                interval,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || timer_loop(worker_shared, on_fire));

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Arm the timer with a fresh interval.
    pub fn start(&self, interval: Duration) {
        let mut state = self.shared.state.lock();
        state.interval = interval;
        state.deadline = Some(Instant::now() + interval);
        self.shared.wake.notify_one();
    }

    /// Push the deadline out by one interval. Has no effect while stopped.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        if state.deadline.is_some() {
            state.deadline = Some(Instant::now() + state.interval);
        }
    }

    pub fn stop(&self) {
        self.shared.state.lock().deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().deadline.is_some()
    }
}

impl Drop for KeepAliveTimer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn timer_loop(shared: Arc<Shared>, on_fire: Box<dyn Fn() + Send + Sync>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }

        match state.deadline {
            None => {
                shared.wake.wait(&mut state);
            }
            Some(deadline) => {
                if Instant::now() >= deadline {
                    // Periodic: re-arm before firing so a slow callback
                    // cannot stack wakeups.
                    state.deadline = Some(Instant::now() + state.interval);
                    MutexGuard::unlocked(&mut state, || on_fire());
                } else {
                    shared.wake.wait_until(&mut state, deadline);
                }
            }
        }
    }
}
