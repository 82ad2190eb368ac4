// Owned background timers: started with the cache, stopped and joined at close.
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Shortest accepted timer period.
pub(crate) const MIN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    /// Sleep up to `timeout`. Returns true once stop was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cv.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }
}

pub(crate) struct Task {
    name: &'static str,
    interval: Duration,
    run: Box<dyn Fn() + Send>,
}

impl Task {
    pub fn new(name: &'static str, interval: Duration, run: impl Fn() + Send + 'static) -> Self {
        Self {
            name,
            interval: interval.max(MIN_INTERVAL),
            run: Box::new(run),
        }
    }
}

pub(crate) struct Scheduler {
    signal: Arc<StopSignal>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    /// One thread per task; each runs its task every `interval` until stopped.
    /// A tick is never interrupted mid-run.
    pub fn start(tasks: Vec<Task>) -> Result<Self> {
        let signal = Arc::new(StopSignal::default());
        let mut scheduler = Self {
            signal: Arc::clone(&signal),
            handles: Vec::with_capacity(tasks.len()),
        };

        for task in tasks {
            let signal = Arc::clone(&signal);
            let name = task.name;
            let spawned = thread::Builder::new()
                .name(format!("foundation-cache-{name}"))
                .spawn(move || {
                    debug!(task = task.name, interval_secs = task.interval.as_secs(), "timer started");
                    while !signal.wait(task.interval) {
                        (task.run)();
                    }
                    debug!(task = task.name, "timer stopped");
                });
            match spawned {
                Ok(handle) => scheduler.handles.push((name, handle)),
                Err(e) => {
                    scheduler.stop();
                    return Err(e.into());
                }
            }
        }
        info!(timers = scheduler.handles.len(), "background scheduler started");
        Ok(scheduler)
    }

    /// Signal every timer and wait for in-flight ticks to finish.
    pub fn stop(&mut self) {
        self.signal.stop();
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!(task = name, "background timer panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
