use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;
#[cfg(feature = "profile")]
use std::time::Instant;

use crate::engine::light::LightTask;
use crate::engine::manager::Shared;
use crate::engine::registry::Slot;
#[cfg(feature = "profile")]
use crate::engine::TaskExecution;
use crate::engine::{TaskId, TaskType};
use crate::error::{ErrorCode, report};

/// A unit of work scheduled by a [`TaskManager`](crate::TaskManager).
///
/// Task objects are owned by the application and lent to the manager for one
/// frame at a time. The manager keeps all scheduling state (references,
/// dependents, dispatch state) in its own slot table, so the same object can
/// be submitted again after
/// [`reset_dependencies`](crate::TaskManager::reset_dependencies).
pub trait Task: Send + Sync {
    /// Used for lookup in diagnostics and as the name of the profiling span.
    fn name(&self) -> &str;

    /// The work itself. May run concurrently with any task it has no
    /// dependency edge with, and must not wait for other tasks.
    fn run(&self);

    /// Called once every time the task is registered with a manager, before
    /// it can be dispatched. Reset per-frame state here.
    fn submitted(&self) {}
}

/// Task made of a name and a closure.
pub struct FnTask<F> {
    name: Cow<'static, str>,
    func: F,
}

impl<F> FnTask<F>
where
    F: Fn() + Send + Sync + 'static,
{
    pub fn new(name: impl Into<Cow<'static, str>>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }

    /// Shorthand for `Arc::new(FnTask::new(..))`, the form submission wants.
    pub fn shared(name: impl Into<Cow<'static, str>>, func: F) -> Arc<Self> {
        Arc::new(Self::new(name, func))
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn() + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) {
        (self.func)()
    }
}

impl<F> Debug for FnTask<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnTask({}, *)", self.name)
    }
}

/// Where a ready task reports its completion.
pub(crate) enum Origin {
    Managed {
        shared: Arc<Shared>,
        id: TaskId,
        slot: Arc<Slot>,
    },
    Light(Arc<LightTask>),
}

impl Origin {
    fn complete(self) {
        match self {
            Origin::Managed { shared, id, .. } => shared.task_completed(id),
            Origin::Light(light) => light.completed(),
        }
    }
}

/// A task whose reference count reached zero, handed to a dispatcher.
///
/// The dispatcher owns it until it calls [`release`](Self::release), which
/// must happen exactly once and only after [`run_profiled`](Self::run_profiled)
/// (or [`run`](Self::run)) has returned. `release` consumes the ready task, so
/// releasing twice does not compile. A ready task dropped without being
/// released is reported and released on the spot, so a lost task can't stall
/// the frame.
pub struct ReadyTask {
    task: Arc<dyn Task>,
    kind: TaskType,
    origin: Option<Origin>,
}

impl ReadyTask {
    pub(crate) fn managed(
        task: Arc<dyn Task>,
        kind: TaskType,
        shared: Arc<Shared>,
        id: TaskId,
        slot: Arc<Slot>,
    ) -> Self {
        Self {
            task,
            kind,
            origin: Some(Origin::Managed { shared, id, slot }),
        }
    }

    pub(crate) fn light(task: Arc<dyn Task>, light: Arc<LightTask>) -> Self {
        Self {
            task,
            kind: TaskType::Cpu,
            origin: Some(Origin::Light(light)),
        }
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// The slot this task was dispatched from, [`TaskId::INVALID`] for light
    /// tasks.
    pub fn id(&self) -> TaskId {
        match &self.origin {
            Some(Origin::Managed { id, .. }) => *id,
            _ => TaskId::INVALID,
        }
    }

    /// [`TaskType::Cpu`] or [`TaskType::Gpu`].
    pub fn task_type(&self) -> TaskType {
        self.kind
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    /// Runs the body without profiling.
    pub fn run(&self) {
        self.task.run();
    }

    /// Runs the body inside a `task` tracing span and records its timing for
    /// [`Diagnostics`](crate::Diagnostics).
    pub fn run_profiled(&self) {
        #[cfg(feature = "profile")]
        {
            let span = tracing::trace_span!("task", name = self.task.name());
            let _enter = span.enter();

            let start = Instant::now();
            self.task.run();
            self.record(start);
        }

        #[cfg(not(feature = "profile"))]
        self.task.run();
    }

    #[cfg(feature = "profile")]
    fn record(&self, start: Instant) {
        if let Some(Origin::Managed { slot, .. }) = &self.origin {
            *slot.execution.lock() = Some(TaskExecution {
                start,
                duration: start.elapsed(),
            });
        }
    }

    /// GPU stream the dispatcher picked for this task, `0` until set.
    pub fn stream_index(&self) -> u32 {
        match &self.origin {
            Some(Origin::Managed { slot, .. }) => slot.stream_index(),
            _ => 0,
        }
    }

    pub fn set_stream_index(&self, index: u32) {
        if let Some(Origin::Managed { slot, .. }) = &self.origin {
            slot.set_stream_index(index);
        }
    }

    /// Whether the GPU dispatcher must synchronise before launching this task.
    pub fn requires_pre_sync(&self) -> bool {
        match &self.origin {
            Some(Origin::Managed { slot, .. }) => slot.pre_sync(),
            _ => false,
        }
    }

    pub fn set_pre_sync(&self, value: bool) {
        if let Some(Origin::Managed { slot, .. }) = &self.origin {
            slot.set_pre_sync(value);
        }
    }

    /// Tells the scheduler this task is finished. The origin is detached
    /// before the scheduler is called back, so the completion callback may
    /// resubmit the same task object.
    pub fn release(mut self) {
        if let Some(origin) = self.origin.take() {
            origin.complete();
        }
    }
}

impl Drop for ReadyTask {
    fn drop(&mut self) {
        let Some(origin) = self.origin.take() else {
            return;
        };

        match &origin {
            Origin::Managed { shared, .. } => report!(
                shared.errors,
                ErrorCode::InternalError,
                "task '{}' was dropped by its dispatcher without being released",
                self.task.name()
            ),
            Origin::Light(_) => tracing::error!(
                task = self.task.name(),
                "light task was dropped by its dispatcher without being released"
            ),
        }

        origin.complete();
    }
}

impl Debug for ReadyTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyTask")
            .field("name", &self.task.name())
            .field("id", &self.id())
            .field("kind", &self.kind)
            .finish()
    }
}
