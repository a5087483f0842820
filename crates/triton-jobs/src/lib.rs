//! # triton-jobs: the job collaborator
//!
//! A fixed-size pool of user threads draining a FIFO of boxed closures.
//! Application handlers and persistence load completions run here, never on
//! the poll pump or the persistence daemon thread. `pend` is non-blocking
//! with a bounded critical section; `stop` drains whatever is already queued
//! before joining the workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A deferred unit of work executed on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    running: AtomicBool,
    queue: Mutex<VecDeque<Job>>,
    work_avail: Condvar,
}

/// A fixed-size user-thread pool.
pub struct JobPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobPool {
    /// Starts a pool of `threads` workers (at least one).
    pub fn start(threads: usize) -> Arc<Self> {
        let inner = Arc::new(PoolInner {
            running: AtomicBool::new(true),
            queue: Mutex::new(VecDeque::new()),
            work_avail: Condvar::new(),
        });

        let threads = threads.max(1);
        triton_log::info!("Starting job pool with {threads} worker(s)...");

        let workers = (0..threads)
            .map(|_| {
                let inner = Arc::clone(&inner);
                std::thread::spawn(move || worker_proc(&inner))
            })
            .collect();

        Arc::new(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Places a job on the pool. Jobs pended after [`JobPool::stop`] are
    /// discarded.
    pub fn pend(&self, job: Job) {
        if !self.inner.running.load(Ordering::Acquire) {
            triton_log::debug!("Job pended on a stopped pool, discarding.");
            return;
        }
        let mut queue = self.inner.queue.lock().unwrap();
        queue.push_back(job);
        drop(queue);
        self.inner.work_avail.notify_one();
    }

    /// Stops the pool: already-queued jobs are drained, then the workers are
    /// joined.
    pub fn stop(&self) {
        triton_log::info!("Stopping job pool...");

        self.inner.running.store(false, Ordering::Release);
        {
            let _queue = self.inner.queue.lock().unwrap();
            self.inner.work_avail.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }

        triton_log::info!("Job pool stopped.");
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

fn worker_proc(inner: &PoolInner) {
    triton_log::set_thread_tag("job");

    loop {
        let job = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if !inner.running.load(Ordering::Acquire) {
                    return;
                }
                queue = inner.work_avail.wait(queue).unwrap();
            }
        };
        job();
    }
}
