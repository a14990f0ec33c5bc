use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::error;
use xiangqi_utils::{ThreadPriority, thread_boot};

use crate::registry::ConnHandle;

/// Default worker count (§2, §4.5), overridable via `ServerConfig`.
pub const DEFAULT_WORKERS: usize = 4;

struct Job {
    handle: ConnHandle,
    payload: Vec<u8>,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    not_empty: Condvar,
    stop: Mutex<bool>,
}

/// A fixed pool of worker threads draining a shared FIFO of
/// `(connection_handle, raw_frame_bytes)` jobs (§4.5). Ordering across the
/// pool is the "adopt option (a)" choice recorded in DESIGN.md: messages
/// from one connection are enqueued in arrival order but may be picked up by
/// distinct, differently-scheduled workers, so they are not guaranteed to be
/// *processed* in that order. Callers rely on per-aggregate locking (the
/// registry lock, the game lock) for correctness, not on dispatch ordering.
pub struct DispatchPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatchPool {
    /// Spawns `worker_count` threads, each running `handle(conn_handle,
    /// payload)` for every job popped off the shared queue until shutdown.
    /// A handler that panics is caught at the worker's outer loop and
    /// logged at `error!`, per §4.5's implementation note: one broken
    /// handler must not take down the remaining workers.
    pub fn start<F>(worker_count: usize, handle: F) -> Self
    where
        F: Fn(ConnHandle, Vec<u8>) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            stop: Mutex::new(false),
        });
        let handle = Arc::new(handle);

        let workers = (0..worker_count.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                let handle = Arc::clone(&handle);
                thread::Builder::new()
                    .name(format!("xiangqi-dispatch-{i}"))
                    .spawn(move || worker_loop(shared, handle))
                    .expect("failed to spawn dispatch worker")
            })
            .collect();

        Self { shared, workers }
    }

    /// Enqueues one parsed-message job; unbounded, per §4.5 ("backpressure
    /// is implicit").
    pub fn enqueue(&self, handle: ConnHandle, payload: Vec<u8>) {
        let mut q = self.shared.queue.lock().expect("dispatch queue poisoned");
        q.push_back(Job { handle, payload });
        self.shared.not_empty.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().expect("dispatch queue poisoned").len()
    }

    /// Sets the shutdown flag and waits for every worker to drain and exit.
    pub fn shutdown(mut self) {
        *self.shared.stop.lock().expect("dispatch stop flag poisoned") = true;
        self.shared.not_empty.notify_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn worker_loop<F>(shared: Arc<Shared>, handle: Arc<F>)
where
    F: Fn(ConnHandle, Vec<u8>) + Send + Sync + 'static,
{
    thread_boot(None, ThreadPriority::OSDefault);
    loop {
        let job = {
            let mut q = shared.queue.lock().expect("dispatch queue poisoned");
            loop {
                if let Some(job) = q.pop_front() {
                    break Some(job);
                }
                if *shared.stop.lock().expect("dispatch stop flag poisoned") {
                    break None;
                }
                q = shared.not_empty.wait(q).expect("dispatch condvar poisoned");
            }
        };
        let Some(job) = job else {
            return;
        };
        let handle_ref = &*handle;
        let result = panic::catch_unwind(AssertUnwindSafe(|| handle_ref(job.handle, job.payload)));
        if let Err(panic) = result {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            error!(%msg, "dispatch handler panicked, worker continues");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn processes_every_enqueued_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let pool = DispatchPool::start(2, move |_h, _p| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        for i in 0..10 {
            pool.enqueue(i, vec![]);
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn a_panicking_handler_does_not_kill_the_pool() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let pool = DispatchPool::start(1, move |h, _p| {
            if h == 0 {
                panic!("boom");
            }
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        pool.enqueue(0, vec![]);
        pool.enqueue(1, vec![]);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
