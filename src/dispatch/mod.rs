//! Execution backends for ready tasks.
//!
//! A dispatcher receives every [`ReadyTask`] whose reference count reached
//! zero. Whatever it does with it, it must run the task exactly once and then
//! release it exactly once, never releasing before the body has returned.

mod inline;
mod pool;
mod rayon_pool;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

pub use crate::dispatch::inline::InlineDispatcher;
pub use crate::dispatch::pool::DefaultCpuDispatcher;
pub use crate::dispatch::rayon_pool::RayonDispatcher;
use crate::engine::ReadyTask;

/// Backend for [`TaskType::Cpu`](crate::TaskType::Cpu) tasks and light tasks.
pub trait CpuDispatcher: Send + Sync {
    fn submit_task(&self, task: ReadyTask);

    /// Number of threads tasks may run on concurrently, `0` if tasks run on
    /// the submitting thread.
    fn worker_count(&self) -> usize;
}

/// Backend for [`TaskType::Gpu`](crate::TaskType::Gpu) tasks.
///
/// Besides tasks, the manager forwards frame boundaries and brackets every
/// batch of GPU tasks it dispatches in one pass with
/// [`start_group`](Self::start_group) / [`finish_group`](Self::finish_group),
/// so a driver can flush once per batch.
pub trait GpuDispatcher: Send + Sync {
    fn submit_task(&self, task: ReadyTask);

    fn start_simulation(&self) {}

    fn stop_simulation(&self) {}

    fn start_group(&self) {}

    fn finish_group(&self) {}
}

/// Runs `task` and releases it, also when the body panics.
pub fn execute(task: ReadyTask) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task.run_profiled())) {
        tracing::error!(task = task.name(), "{}", panic_message(&*panic));
    }

    task.release();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boom() {
        panic!("boom")
    }

    fn opaque() {
        std::panic::panic_any(7_u8)
    }

    #[test]
    fn test_panic_message() {
        let payload = catch_unwind(boom).unwrap_err();
        assert_eq!(panic_message(&*payload), "Task panicked: boom");

        let payload = catch_unwind(opaque).unwrap_err();
        assert_eq!(panic_message(&*payload), "Task panicked with unknown payload");
    }
}
