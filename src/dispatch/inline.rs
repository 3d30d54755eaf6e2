use crate::dispatch::{CpuDispatcher, GpuDispatcher, execute};
use crate::engine::ReadyTask;

/// Runs every task on the thread that submits it.
///
/// Submission recurses into the manager when the released task unblocks
/// others, so a long dependency chain runs as a deep call stack. Meant for
/// tests and single-threaded hosts, and as a CPU stand-in for a GPU queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl CpuDispatcher for InlineDispatcher {
    fn submit_task(&self, task: ReadyTask) {
        execute(task);
    }

    fn worker_count(&self) -> usize {
        0
    }
}

impl GpuDispatcher for InlineDispatcher {
    fn submit_task(&self, task: ReadyTask) {
        execute(task);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::engine::{FnTask, NotificationInterface, TaskManager, TaskType};

    #[derive(Default)]
    struct Frames(AtomicU32);

    impl NotificationInterface for Frames {
        fn simulation_complete(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_panicking_task_is_still_released() {
        let frames = Arc::new(Frames::default());
        let tm = TaskManager::builder()
            .cpu_dispatcher(Arc::new(InlineDispatcher))
            .notification(frames.clone())
            .build();

        tm.reset_dependencies();
        let a = tm.submit_unnamed_task(FnTask::shared("bad", || panic!("bad task")), TaskType::Cpu);
        let ran = Arc::new(AtomicU32::new(0));
        let counter = ran.clone();
        let b = tm.submit_unnamed_task(
            FnTask::shared("after", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            TaskType::Cpu,
        );
        tm.finish_before(a, b);
        tm.start_simulation();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(frames.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inline_as_gpu_backend() {
        let tm = TaskManager::new(None, Some(Arc::new(InlineDispatcher)));
        let ran = Arc::new(AtomicU32::new(0));
        let counter = ran.clone();

        tm.reset_dependencies();
        let id = tm.submit_unnamed_task(
            FnTask::shared("kernel", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            TaskType::Gpu,
        );
        assert_eq!(tm.task_type(id), Some(TaskType::Gpu));

        tm.start_simulation();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
