use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, TrySendError};

/// Fixed set of worker threads fed by a bounded queue.
///
/// `try_submit` never blocks: when every worker is busy and the queue is full
/// the job is handed back so the caller can refuse it. Dropping the pool
/// closes the queue, lets workers finish queued jobs and joins them.
pub(crate) struct WorkerPool<T: Send + 'static> {
    sender: Option<Sender<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F>(name: &str, workers: usize, queue_depth: usize, handler: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded::<T>(queue_depth);
        let handler = Arc::new(handler);
        let mut pool = Self {
            sender: Some(sender),
            workers: Vec::with_capacity(workers),
        };

        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handler = handler.clone();
            let thread_name = format!("{}-{}", name, index);
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if catch_unwind(AssertUnwindSafe(|| handler(job))).is_err() {
                            log::error!("{}: job panicked", thread_name);
                        }
                    }
                })
                .with_context(|| format!("spawn {} worker {}", name, index))?;
            pool.workers.push(handle);
        }
        Ok(pool)
    }

    /// Queue a job, or hand it back if the queue is full.
    pub fn try_submit(&self, job: T) -> std::result::Result<(), T> {
        match &self.sender {
            Some(sender) => sender.try_send(job).map_err(|err| match err {
                TrySendError::Full(job) | TrySendError::Disconnected(job) => job,
            }),
            None => Err(job),
        }
    }

    pub fn shutdown(mut self) {
        self.join_workers();
    }

    fn join_workers(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.join_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_every_submitted_job() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let pool = WorkerPool::new("test", 2, 8, move |n: usize| {
            counter.fetch_add(n, Ordering::SeqCst);
        })
        .unwrap();

        for n in 1..=4 {
            assert!(pool.try_submit(n).is_ok());
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn full_queue_hands_job_back() {
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let pool = WorkerPool::new("test", 1, 1, move |_: u32| {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        })
        .unwrap();

        assert!(pool.try_submit(1).is_ok());
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("first job never started");
        assert!(pool.try_submit(2).is_ok());
        assert_eq!(pool.try_submit(3), Err(3));

        drop(gate_tx);
        pool.shutdown();
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let pool = WorkerPool::new("test", 1, 4, move |n: u32| {
            if n == 0 {
                panic!("boom");
            }
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(pool.try_submit(0).is_ok());
        assert!(pool.try_submit(1).is_ok());
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
