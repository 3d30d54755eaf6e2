use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};

use crate::config::CpuConfig;
use crate::dispatch::{CpuDispatcher, execute};
use crate::engine::ReadyTask;
use crate::error::DispatcherError;

/// Fixed-size pool of worker threads fed from one shared queue.
///
/// Dropping the pool closes the queue; workers drain what is already queued
/// and exit, and the drop waits for them.
#[derive(Debug)]
pub struct DefaultCpuDispatcher {
    sender: Option<Sender<ReadyTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl DefaultCpuDispatcher {
    pub fn new(threads: usize) -> Result<Self, DispatcherError> {
        Self::with_name(threads, &CpuConfig::default().thread_name)
    }

    pub fn from_config(config: &CpuConfig) -> Result<Self, DispatcherError> {
        Self::with_name(config.worker_threads(), &config.thread_name)
    }

    pub fn with_name(threads: usize, name: &str) -> Result<Self, DispatcherError> {
        if threads == 0 {
            return Err(DispatcherError::NoWorkers);
        }

        let (sender, receiver) = unbounded::<ReadyTask>();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    for task in receiver.iter() {
                        execute(task);
                    }
                })?;

            workers.push(worker);
        }

        tracing::debug!(threads, name, "started CPU worker pool");

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }
}

impl CpuDispatcher for DefaultCpuDispatcher {
    fn submit_task(&self, task: ReadyTask) {
        let Some(sender) = &self.sender else {
            execute(task);
            return;
        };

        // Only fails once every worker is gone.
        if let Err(err) = sender.send(task) {
            tracing::warn!("CPU worker pool is gone, running task on the caller");
            execute(err.into_inner());
        }
    }

    fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for DefaultCpuDispatcher {
    fn drop(&mut self) {
        self.sender.take();

        // The last reference to the pool can be dropped by one of its own
        // workers, which must not wait for itself.
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() != current && worker.join().is_err() {
                tracing::error!("CPU worker thread panicked");
            }
        }
    }
}
