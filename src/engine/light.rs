use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::engine::manager::Shared;
use crate::engine::{ReadyTask, Task, TaskId, TaskManager};
use crate::error::{ErrorCode, report};

/// What a [`LightTask`] unblocks when it completes.
#[derive(Clone)]
pub enum Continuation {
    /// A task registered with the manager. The light task holds one of its
    /// references, so the task and the frame can't finish before it.
    Task(TaskId),
    Light(Arc<LightTask>),
}

impl Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Continuation::Task(id) => write!(f, "Continuation::Task({id:?})"),
            Continuation::Light(light) => write!(f, "Continuation::Light({})", light.name()),
        }
    }
}

struct Binding {
    shared: Arc<Shared>,
    continuation: Option<Continuation>,
}

/// A task that is not registered in the slot table.
///
/// Light tasks have no id, no name lookup and no dependents besides a single
/// continuation. They run on the manager's CPU dispatcher as soon as their own
/// reference count drops to zero, and are not counted towards frame
/// completion. Binding one to a continuation that is a managed task is how a
/// light task keeps the frame open.
pub struct LightTask {
    task: Arc<dyn Task>,
    references: AtomicU32,
    binding: Mutex<Option<Binding>>,
}

impl LightTask {
    pub fn new(task: Arc<dyn Task>) -> Arc<Self> {
        Arc::new(Self {
            task,
            references: AtomicU32::new(0),
            binding: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// Binds the light task to `manager` with one outstanding reference and
    /// takes a reference on `continuation`.
    ///
    /// When chaining light tasks, bind the continuation before the tasks that
    /// lead into it: binding resets the reference count to one.
    pub fn set_continuation(
        &self,
        manager: &TaskManager,
        continuation: Option<Continuation>,
    ) {
        let shared = manager.shared().clone();

        if self.references.load(Ordering::Acquire) != 0 {
            report!(
                shared.errors,
                ErrorCode::InvalidOperation,
                "light task '{}' rebound while it still had references",
                self.name()
            );
        }

        match &continuation {
            Some(Continuation::Task(id)) => shared.add_reference(*id),
            Some(Continuation::Light(light)) => light.add_reference(),
            None => {}
        }

        self.references.store(1, Ordering::Release);
        *self.binding.lock() = Some(Binding {
            shared,
            continuation,
        });
    }

    pub fn continuation(&self) -> Option<Continuation> {
        self.binding
            .lock()
            .as_ref()
            .and_then(|binding| binding.continuation.clone())
    }

    pub fn add_reference(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference, submitting the task to the CPU dispatcher when it
    /// was the last one.
    pub fn remove_reference(self: &Arc<Self>) {
        let previous = self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => self.submit(),
            Ok(_) => {}
            Err(_) => {
                let binding = self.binding.lock();
                match binding.as_ref() {
                    Some(binding) => report!(
                        binding.shared.errors,
                        ErrorCode::InvalidOperation,
                        "reference count of light task '{}' dropped below zero",
                        self.name()
                    ),
                    None => tracing::error!(
                        task = self.name(),
                        "light task released without being bound to a manager"
                    ),
                }
            }
        }
    }

    pub fn reference(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    fn submit(self: &Arc<Self>) {
        let Some(shared) = self.binding.lock().as_ref().map(|b| b.shared.clone()) else {
            tracing::error!(task = self.name(), "light task ready without a manager");
            return;
        };

        let ready = ReadyTask::light(self.task.clone(), self.clone());
        match shared.cpu_dispatcher() {
            Some(cpu) => cpu.submit_task(ready),
            None => {
                report!(
                    shared.errors,
                    ErrorCode::InvalidOperation,
                    "no CPU dispatcher for light task '{}', releasing it without running",
                    self.name()
                );
                ready.release();
            }
        }
    }

    /// Completion callback. The binding is detached before the continuation
    /// is released, so the continuation may rebind this light task.
    pub(crate) fn completed(&self) {
        let binding = self.binding.lock().take();

        let Some(Binding {
            shared,
            continuation: Some(continuation),
        }) = binding
        else {
            return;
        };

        match continuation {
            Continuation::Task(id) => shared.remove_reference(id),
            Continuation::Light(light) => light.remove_reference(),
        }
    }
}

impl Debug for LightTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightTask")
            .field("name", &self.name())
            .field("references", &self.reference())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InlineDispatcher;
    use crate::engine::{FnTask, NotificationInterface, TaskType};
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Done(AtomicBool);

    impl NotificationInterface for Done {
        fn simulation_complete(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn Task> {
        let log = log.clone();
        FnTask::shared(name, move || log.lock().push(name))
    }

    #[test]
    fn test_light_task_holds_its_continuation() {
        let done = Arc::new(Done::default());
        let tm = TaskManager::builder()
            .cpu_dispatcher(Arc::new(InlineDispatcher))
            .notification(done.clone())
            .build();
        let log = Arc::new(Mutex::new(Vec::new()));

        tm.reset_dependencies();
        let merge = tm.submit_named_task(recorder(&log, "merge"), "merge", TaskType::Cpu);

        let light = LightTask::new(recorder(&log, "light"));
        light.set_continuation(&tm, Some(Continuation::Task(merge)));
        assert_eq!(tm.get_reference(merge), Some(2));
        assert_eq!(light.reference(), 1);

        tm.start_simulation();
        assert!(log.lock().is_empty());
        assert!(!done.0.load(Ordering::SeqCst));

        light.remove_reference();
        assert_eq!(*log.lock(), ["light", "merge"]);
        assert!(done.0.load(Ordering::SeqCst));
        assert!(light.continuation().is_none());
    }

    #[test]
    fn test_light_chain() {
        let tm = TaskManager::builder()
            .cpu_dispatcher(Arc::new(InlineDispatcher))
            .build();
        let log = Arc::new(Mutex::new(Vec::new()));

        let tail = LightTask::new(recorder(&log, "tail"));
        let head = LightTask::new(recorder(&log, "head"));
        tail.set_continuation(&tm, None);
        head.set_continuation(&tm, Some(Continuation::Light(tail.clone())));
        assert_eq!(tail.reference(), 2);

        tail.remove_reference();
        assert!(log.lock().is_empty());

        head.remove_reference();
        assert_eq!(*log.lock(), ["head", "tail"]);
    }

    #[test]
    fn test_extra_references_delay_light_task() {
        let tm = TaskManager::builder()
            .cpu_dispatcher(Arc::new(InlineDispatcher))
            .build();
        let log = Arc::new(Mutex::new(Vec::new()));

        let light = LightTask::new(recorder(&log, "light"));
        light.set_continuation(&tm, None);
        light.add_reference();

        light.remove_reference();
        assert!(log.lock().is_empty());
        light.remove_reference();
        assert_eq!(*log.lock(), ["light"]);
    }
}
