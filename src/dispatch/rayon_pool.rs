use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::CpuConfig;
use crate::dispatch::{CpuDispatcher, execute};
use crate::engine::ReadyTask;
use crate::error::DispatcherError;

/// Runs tasks on a dedicated rayon pool.
#[derive(Debug)]
pub struct RayonDispatcher {
    pool: ThreadPool,
}

impl RayonDispatcher {
    pub fn new(threads: usize) -> Result<Self, DispatcherError> {
        Self::with_name(threads, "frametask-rayon")
    }

    pub fn from_config(config: &CpuConfig) -> Result<Self, DispatcherError> {
        Self::with_name(config.worker_threads(), &config.thread_name)
    }

    pub fn with_name(threads: usize, name: &str) -> Result<Self, DispatcherError> {
        if threads == 0 {
            return Err(DispatcherError::NoWorkers);
        }

        let name = name.to_string();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |index| format!("{name}-{index}"))
            .build()?;

        Ok(Self { pool })
    }
}

impl CpuDispatcher for RayonDispatcher {
    fn submit_task(&self, task: ReadyTask) {
        self.pool.spawn(move || execute(task));
    }

    fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::{Sender, bounded};
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::{FnTask, NotificationInterface, TaskManager, TaskType};

    struct Signal(Sender<()>);

    impl NotificationInterface for Signal {
        fn simulation_complete(&self) {
            let _ = self.0.send(());
        }
    }

    #[test]
    fn test_chain_on_rayon() {
        let dispatcher = RayonDispatcher::new(3).unwrap();
        assert_eq!(dispatcher.worker_count(), 3);

        let (tx, rx) = bounded(1);
        let tm = TaskManager::builder()
            .cpu_dispatcher(Arc::new(dispatcher))
            .notification(Arc::new(Signal(tx)))
            .build();
        let order = Arc::new(Mutex::new(Vec::new()));

        tm.reset_dependencies();
        let mut previous = None;
        for step in 0..10 {
            let order = order.clone();
            let id = tm.submit_unnamed_task(
                FnTask::shared(format!("step-{step}"), move || order.lock().push(step)),
                TaskType::Cpu,
            );
            if let Some(previous) = previous {
                tm.start_after(id, previous);
            }
            previous = Some(id);
        }
        tm.start_simulation();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_threads_is_rejected() {
        assert!(matches!(
            RayonDispatcher::new(0),
            Err(DispatcherError::NoWorkers)
        ));
    }
}
