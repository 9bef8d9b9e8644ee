use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

/// Registry of detached worker threads so shutdown can account for them.
#[derive(Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `job` on a named thread. If the thread cannot be created the
    /// job runs inline so its side effects are never lost.
    pub fn spawn<F>(&self, name: &str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reap();
        let slot = Arc::new(Mutex::new(Some(job)));
        let thread_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Some(job) = take(&thread_slot) {
                    job();
                }
            });
        match spawned {
            Ok(handle) => {
                self.handles
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((name.to_string(), handle));
            }
            Err(err) => {
                warn!(task = name, error = %err, "thread spawn failed, running inline");
                if let Some(job) = take(&slot) {
                    job();
                }
            }
        }
    }

    /// Drops handles of threads that already finished.
    pub fn reap(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let (done, running): (Vec<_>, Vec<_>) =
            handles.drain(..).partition(|(_, handle)| handle.is_finished());
        *handles = running;
        for (name, handle) in done {
            if handle.join().is_err() {
                warn!(task = %name, "background task panicked");
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.reap();
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Waits up to `timeout` for every task; returns how many are still running.
    pub fn join_all(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.outstanding();
            if remaining == 0 {
                return 0;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "background tasks still running at shutdown");
                return remaining;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Blocks until every registered task has finished.
    #[cfg(test)]
    pub fn wait_idle(&self) {
        loop {
            let batch: Vec<_> = self
                .handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
                .collect();
            if batch.is_empty() {
                return;
            }
            for (name, handle) in batch {
                if handle.join().is_err() {
                    warn!(task = %name, "background task panicked");
                }
            }
        }
    }
}

fn take<F>(slot: &Mutex<Option<F>>) -> Option<F> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn spawned_jobs_run_and_are_joined() {
        let tasks = BackgroundTasks::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = counter.clone();
            tasks.spawn("bump", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tasks.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(tasks.outstanding(), 0);
    }

    #[test]
    fn join_all_reports_stragglers() {
        let tasks = BackgroundTasks::new();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        tasks.spawn("blocked", move || {
            let _ = rx.recv();
        });
        assert_eq!(tasks.join_all(Duration::from_millis(30)), 1);
        drop(tx);
        assert_eq!(tasks.join_all(Duration::from_secs(5)), 0);
    }
}
