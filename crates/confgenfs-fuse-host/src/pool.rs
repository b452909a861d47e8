// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker pool for requests that may block in the content provider.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct PoolQueue {
    jobs: SegQueue<Job>,
    signal: (Mutex<bool>, Condvar),
    shutdown: AtomicBool,
}

impl PoolQueue {
    pub fn submit(&self, job: Job) {
        self.jobs.push(job);
        let (lock, cvar) = &self.signal;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_one();
    }

    fn run(&self) {
        loop {
            if let Some(job) = self.jobs.pop() {
                job();
                continue;
            }
            // Queued jobs still run after shutdown so every reply is sent.
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let (lock, cvar) = &self.signal;
            let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if !*pending {
                pending = match cvar.wait_timeout(pending, Duration::from_millis(5)) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            *pending = false;
        }
    }
}

pub struct RequestPool {
    queue: Arc<PoolQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl RequestPool {
    pub fn new(thread_count: usize) -> Self {
        let queue = Arc::new(PoolQueue {
            jobs: SegQueue::new(),
            signal: (Mutex::new(false), Condvar::new()),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..thread_count.max(1))
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.run())
            })
            .collect();
        Self { queue, workers }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.queue.submit(Box::new(job));
    }

    /// Shared submission side, for producers that outlive a borrow of the pool.
    pub fn queue(&self) -> Arc<PoolQueue> {
        Arc::clone(&self.queue)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for RequestPool {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, Ordering::Release);
        let (lock, cvar) = &self.queue.signal;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn jobs_run_on_workers() {
        let pool = RequestPool::new(3);
        assert_eq!(pool.worker_count(), 3);
        let (tx, rx) = mpsc::channel();
        for i in 0..32 {
            let tx = tx.clone();
            pool.submit(move || tx.send(i).unwrap());
        }
        let mut seen: Vec<i32> = (0..32).map(|_| rx.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn drop_finishes_queued_jobs() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = RequestPool::new(1);
            let queue = pool.queue();
            for _ in 0..100 {
                let done = done.clone();
                queue.submit(Box::new(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn zero_threads_still_gets_a_worker() {
        let pool = RequestPool::new(0);
        assert_eq!(pool.worker_count(), 1);
    }
}
