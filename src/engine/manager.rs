use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::dispatch::{CpuDispatcher, GpuDispatcher};
use crate::engine::registry::Registry;
use crate::engine::{
    DependencyGraph, Diagnostics, NotificationInterface, ReadyTask, Task, TaskId, TaskType,
};
use crate::error::{ErrorCallback, ErrorCode, TracingErrorCallback, report};

/// State shared between the manager handle and every [`ReadyTask`] in flight.
pub(crate) struct Shared {
    registry: RwLock<Registry>,
    cpu: RwLock<Option<Arc<dyn CpuDispatcher>>>,
    gpu: RwLock<Option<Arc<dyn GpuDispatcher>>>,
    notify: RwLock<Option<Arc<dyn NotificationInterface>>>,
    pub(crate) errors: Arc<dyn ErrorCallback>,
    /// Slots of the current frame that have not completed yet.
    pending: AtomicUsize,
    started: AtomicBool,
    frame_done: AtomicBool,
}

/// Owns the task graph of one frame at a time and drives it to completion.
///
/// All methods take `&self` and may be called from any thread, including from
/// inside a task body, a dispatcher, or
/// [`NotificationInterface::simulation_complete`].
pub struct TaskManager {
    shared: Arc<Shared>,
}

/// Creates a manager with the given dispatchers and the default error sink.
pub fn create_task_manager(
    cpu: Option<Arc<dyn CpuDispatcher>>,
    gpu: Option<Arc<dyn GpuDispatcher>>,
) -> TaskManager {
    TaskManager::new(cpu, gpu)
}

impl TaskManager {
    pub fn new(cpu: Option<Arc<dyn CpuDispatcher>>, gpu: Option<Arc<dyn GpuDispatcher>>) -> Self {
        let mut builder = Self::builder();
        builder.cpu = cpu;
        builder.gpu = gpu;
        builder.build()
    }

    pub fn builder() -> TaskManagerBuilder {
        TaskManagerBuilder::default()
    }

    pub fn set_cpu_dispatcher(&self, cpu: Option<Arc<dyn CpuDispatcher>>) {
        // Dropped after the lock: a pool waits for its workers, which may
        // call back into the manager.
        let previous = std::mem::replace(&mut *self.shared.cpu.write(), cpu);
        drop(previous);
    }

    pub fn set_gpu_dispatcher(&self, gpu: Option<Arc<dyn GpuDispatcher>>) {
        let previous = std::mem::replace(&mut *self.shared.gpu.write(), gpu);
        drop(previous);
    }

    pub fn set_notification(&self, notify: Option<Arc<dyn NotificationInterface>>) {
        let previous = std::mem::replace(&mut *self.shared.notify.write(), notify);
        drop(previous);
    }

    pub fn cpu_dispatcher(&self) -> Option<Arc<dyn CpuDispatcher>> {
        self.shared.cpu.read().clone()
    }

    pub fn gpu_dispatcher(&self) -> Option<Arc<dyn GpuDispatcher>> {
        self.shared.gpu.read().clone()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Opens a new frame. Every [`TaskId`] issued so far becomes stale.
    ///
    /// Calling this before [`start_simulation`](Self::start_simulation)
    /// discards the frame that was being wired.
    pub fn reset_dependencies(&self) {
        let mut registry = self.shared.registry.write();

        let pending = self.shared.pending.load(Ordering::Acquire);
        if self.shared.started.load(Ordering::Acquire) && pending > 0 {
            report!(
                self.shared.errors,
                ErrorCode::InvalidOperation,
                "dependencies reset while {pending} task(s) of the running frame are outstanding"
            );
        }

        registry.reset();
        self.shared.pending.store(0, Ordering::Release);
        self.shared.started.store(false, Ordering::Release);
        self.shared.frame_done.store(false, Ordering::Release);
    }

    /// Registers `task` under `name`, binding it to the placeholder reserved
    /// by [`get_named_task`](Self::get_named_task) if there is one.
    pub fn submit_named_task(&self, task: Arc<dyn Task>, name: &str, kind: TaskType) -> TaskId {
        self.shared.submit(task, Some(name), kind)
    }

    pub fn submit_unnamed_task(&self, task: Arc<dyn Task>, kind: TaskType) -> TaskId {
        self.shared.submit(task, None, kind)
    }

    /// Id of the task called `name`, reserving a placeholder if nothing was
    /// submitted under that name yet. A placeholder that never gets a body
    /// resolves without running once its references are gone.
    pub fn get_named_task(&self, name: &str) -> TaskId {
        {
            let registry = self.shared.registry.read();
            if let Some(&index) = registry.names.get(name) {
                return registry.id(index);
            }
        }

        let mut registry = self.shared.registry.write();
        if let Some(&index) = registry.names.get(name) {
            return registry.id(index);
        }

        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let index = registry.push(Some(name.into()), None, TaskType::NotPresent);
        registry.id(index)
    }

    /// `task` must complete before `successor` can start.
    pub fn finish_before(&self, task: TaskId, successor: TaskId) {
        self.shared.add_edge(task, successor);
    }

    /// `task` can't start before `predecessor` has completed.
    pub fn start_after(&self, task: TaskId, predecessor: TaskId) {
        self.shared.add_edge(predecessor, task);
    }

    /// Holds `id` back until a matching [`remove_reference`](Self::remove_reference).
    pub fn add_reference(&self, id: TaskId) {
        self.shared.add_reference(id);
    }

    /// Drops a reference, dispatching the task if it was the last one.
    pub fn remove_reference(&self, id: TaskId) {
        self.shared.remove_reference(id);
    }

    /// Outstanding references of `id`, `None` for a stale id.
    pub fn get_reference(&self, id: TaskId) -> Option<u32> {
        let registry = self.shared.registry.read();
        registry
            .index(id)
            .map(|index| registry.rows[index].slot.references())
    }

    /// Type of the slot, `None` for a stale id.
    pub fn task_type(&self, id: TaskId) -> Option<TaskType> {
        let registry = self.shared.registry.read();
        registry.index(id).map(|index| registry.rows[index].slot.kind())
    }

    /// The task bound to `id`, unless it already completed or the id is stale.
    pub fn task_from_id(&self, id: TaskId) -> Option<Arc<dyn Task>> {
        let registry = self.shared.registry.read();
        let row = &registry.rows[registry.index(id)?];
        if row.slot.is_released() {
            return None;
        }
        row.task.clone()
    }

    /// Starts the frame: every slot whose only reference is the initial one
    /// is dispatched. Returns without waiting for any task.
    pub fn start_simulation(&self) {
        if let Some(gpu) = self.gpu_dispatcher() {
            gpu.start_simulation();
        }

        if self.shared.started.swap(true, Ordering::AcqRel) {
            report!(
                self.shared.errors,
                ErrorCode::InvalidOperation,
                "start_simulation called twice in one frame"
            );
            return;
        }

        let mut ready = Vec::new();
        let fire = {
            let mut registry = self.shared.registry.write();

            if cfg!(debug_assertions)
                && let Err(id) = DependencyGraph::capture(&registry).topological_order()
            {
                let index = registry.index(id).unwrap_or_default();
                report!(
                    self.shared.errors,
                    ErrorCode::InvalidOperation,
                    "task '{}' is part of a dependency cycle, the frame can't complete",
                    registry.label(index)
                );
            }

            let mut resolved = Vec::new();
            for index in 0..registry.rows.len() {
                if registry.rows[index].initial_released {
                    continue;
                }
                registry.rows[index].initial_released = true;
                self.shared.release_initial(&registry, index, &mut ready, &mut resolved);
            }

            tracing::debug!(
                tasks = registry.rows.len(),
                ready = ready.len(),
                "starting frame"
            );

            let finished = self.shared.cascade(&registry, resolved, &mut ready);
            self.shared.retire(finished)
                || (finished == 0 && self.shared.pending.load(Ordering::Acquire) == 0)
        };

        self.shared.dispatch(ready);
        if fire {
            self.shared.frame_complete();
        }
    }

    pub fn stop_simulation(&self) {
        if let Some(gpu) = self.gpu_dispatcher() {
            gpu.stop_simulation();
        }
    }

    /// Timings recorded by the tasks of the current frame so far.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::capture(&self.shared.registry.read())
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        DependencyGraph::capture(&self.shared.registry.read())
    }

    /// Tears the manager down, telling the notification interface.
    pub fn release(self) {}
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        let notify = self.shared.notify.write().take();
        if let Some(notify) = notify {
            notify.release();
        }
    }
}

impl Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.shared.registry.read();
        f.debug_struct("TaskManager")
            .field("frame", &registry.frame)
            .field("tasks", &registry.rows.len())
            .field("pending", &self.shared.pending.load(Ordering::Relaxed))
            .field("started", &self.shared.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl Shared {
    pub(crate) fn add_reference(&self, id: TaskId) {
        let registry = self.registry.read();
        let Some(index) = registry.index(id) else {
            report!(
                self.errors,
                ErrorCode::InvalidParameter,
                "add_reference on stale task {id:?}"
            );
            return;
        };

        let slot = &registry.rows[index].slot;
        if slot.kind() == TaskType::Completed {
            report!(
                self.errors,
                ErrorCode::InvalidOperation,
                "add_reference on task '{}' after it was dispatched",
                registry.label(index)
            );
            return;
        }

        slot.add_reference();
    }

    pub(crate) fn remove_reference(self: &Arc<Self>, id: TaskId) {
        let mut ready = Vec::new();
        let fire = {
            let registry = self.registry.read();
            let Some(index) = registry.index(id) else {
                report!(
                    self.errors,
                    ErrorCode::InvalidParameter,
                    "remove_reference on stale task {id:?}"
                );
                return;
            };

            // The initial reference belongs to start_simulation. The read
            // lock keeps `initial_released` stable while we decrement.
            let held = !registry.rows[index].initial_released;

            match registry.rows[index].slot.remove_reference_above(held as u32) {
                Some(0) => {
                    let mut resolved = Vec::new();
                    self.claim(&registry, index, &mut ready, &mut resolved);
                    let finished = self.cascade(&registry, resolved, &mut ready);
                    self.retire(finished)
                }
                Some(_) => false,
                None if held => {
                    report!(
                        self.errors,
                        ErrorCode::InvalidOperation,
                        "remove_reference on task '{}' without a matching add_reference, ignored",
                        registry.label(index)
                    );
                    debug_assert!(false, "unmatched remove_reference before the frame started");
                    false
                }
                None => {
                    report!(
                        self.errors,
                        ErrorCode::InvalidOperation,
                        "reference count of task '{}' dropped below zero",
                        registry.label(index)
                    );
                    debug_assert!(false, "reference count dropped below zero");
                    false
                }
            }
        };

        self.dispatch(ready);
        if fire {
            self.frame_complete();
        }
    }

    pub(crate) fn cpu_dispatcher(&self) -> Option<Arc<dyn CpuDispatcher>> {
        self.cpu.read().clone()
    }

    fn checked_kind(&self, task: &dyn Task, kind: TaskType) -> TaskType {
        match kind {
            TaskType::Completed => {
                report!(
                    self.errors,
                    ErrorCode::InvalidParameter,
                    "task '{}' submitted as completed, treating it as not present",
                    task.name()
                );
                TaskType::NotPresent
            }
            TaskType::Gpu if self.gpu.read().is_none() => {
                report!(
                    self.errors,
                    ErrorCode::DebugWarning,
                    "GPU task '{}' submitted without a GPU dispatcher, it will not run",
                    task.name()
                );
                TaskType::NotPresent
            }
            kind => kind,
        }
    }

    fn submit(self: &Arc<Self>, task: Arc<dyn Task>, name: Option<&str>, kind: TaskType) -> TaskId {
        if let Some(name) = name
            && let Some(id) = self.bound_name(name)
        {
            report!(
                self.errors,
                ErrorCode::InvalidParameter,
                "a task named '{name}' was already submitted this frame"
            );
            return id;
        }

        // Outside the lock: the hook may call back into the manager.
        let kind = self.checked_kind(&*task, kind);
        task.submitted();

        let mut ready = Vec::new();
        let (id, fire) = {
            let mut registry = self.registry.write();

            let index = match name.and_then(|name| registry.names.get(name).copied()) {
                Some(index) => {
                    let label = registry.label(index);
                    let row = &mut registry.rows[index];

                    if row.task.is_some() {
                        report!(
                            self.errors,
                            ErrorCode::InvalidParameter,
                            "a task named '{label}' was already submitted this frame"
                        );
                        return registry.id(index);
                    }

                    if row.slot.kind() == TaskType::Completed {
                        report!(
                            self.errors,
                            ErrorCode::DebugWarning,
                            "task '{label}' was bound after its placeholder resolved, it will not run"
                        );
                    } else {
                        row.slot.set_kind(kind);
                    }

                    row.task = Some(task);
                    row.slot.set_stream_index(0);
                    row.slot.set_pre_sync(false);
                    index
                }
                None => {
                    self.pending.fetch_add(1, Ordering::AcqRel);
                    registry.push(name.map(Arc::from), Some(task), kind)
                }
            };

            let mut fire = false;
            if self.started.load(Ordering::Acquire) && !registry.rows[index].initial_released {
                registry.rows[index].initial_released = true;

                let mut resolved = Vec::new();
                self.release_initial(&registry, index, &mut ready, &mut resolved);
                let finished = self.cascade(&registry, resolved, &mut ready);
                fire = self.retire(finished);
            }

            (registry.id(index), fire)
        };

        self.dispatch(ready);
        if fire {
            self.frame_complete();
        }

        id
    }

    /// Id of the slot called `name` if a body is already bound to it.
    fn bound_name(&self, name: &str) -> Option<TaskId> {
        let registry = self.registry.read();
        let index = *registry.names.get(name)?;
        registry.rows[index].task.as_ref().map(|_| registry.id(index))
    }

    fn release_initial(
        self: &Arc<Self>,
        registry: &Registry,
        index: usize,
        ready: &mut Vec<ReadyTask>,
        resolved: &mut Vec<usize>,
    ) {
        match registry.rows[index].slot.remove_reference() {
            Some(0) => self.claim(registry, index, ready, resolved),
            Some(_) => {}
            None => report!(
                self.errors,
                ErrorCode::InvalidOperation,
                "task '{}' lost its initial reference before the frame started",
                registry.label(index)
            ),
        }
    }

    fn add_edge(&self, before: TaskId, after: TaskId) {
        let mut registry = self.registry.write();

        let (Some(source), Some(target)) = (registry.index(before), registry.index(after)) else {
            report!(
                self.errors,
                ErrorCode::InvalidParameter,
                "dependency between {before:?} and {after:?} names a stale task"
            );
            return;
        };

        if source == target {
            report!(
                self.errors,
                ErrorCode::InvalidParameter,
                "task '{}' can't depend on itself",
                registry.label(source)
            );
            return;
        }

        if registry.rows[target].slot.kind() == TaskType::Completed {
            report!(
                self.errors,
                ErrorCode::InvalidOperation,
                "task '{}' was already dispatched, dependency on '{}' ignored",
                registry.label(target),
                registry.label(source)
            );
            return;
        }

        if registry.rows[source].slot.is_released() {
            report!(
                self.errors,
                ErrorCode::InvalidOperation,
                "task '{}' already completed, dependency of '{}' ignored",
                registry.label(source),
                registry.label(target)
            );
            return;
        }

        registry.rows[target].slot.add_reference();
        registry.rows[source].dependents.push(target);
    }

    /// Hands a slot whose count reached zero to whoever handles it next.
    /// Runnable slots become ready tasks, the rest are queued for resolution.
    fn claim(
        self: &Arc<Self>,
        registry: &Registry,
        index: usize,
        ready: &mut Vec<ReadyTask>,
        resolved: &mut Vec<usize>,
    ) {
        let row = &registry.rows[index];

        match row.slot.claim() {
            kind @ (TaskType::Cpu | TaskType::Gpu) => match &row.task {
                Some(task) => ready.push(ReadyTask::managed(
                    task.clone(),
                    kind,
                    self.clone(),
                    registry.id(index),
                    row.slot.clone(),
                )),
                None => resolved.push(index),
            },
            TaskType::NotPresent => resolved.push(index),
            TaskType::Completed => report!(
                self.errors,
                ErrorCode::InternalError,
                "task '{}' dispatched twice",
                registry.label(index)
            ),
        }
    }

    /// Completes every slot in `done` and whatever it unblocks without
    /// running, returning how many slots completed.
    fn cascade(
        self: &Arc<Self>,
        registry: &Registry,
        mut done: Vec<usize>,
        ready: &mut Vec<ReadyTask>,
    ) -> usize {
        let mut finished = 0;

        while let Some(index) = done.pop() {
            let row = &registry.rows[index];
            let first = row.slot.mark_released();
            debug_assert!(first, "slot completed twice");
            finished += 1;

            for &dependent in &row.dependents {
                match registry.rows[dependent].slot.remove_reference() {
                    Some(0) => self.claim(registry, dependent, ready, &mut done),
                    Some(_) => {}
                    None => report!(
                        self.errors,
                        ErrorCode::InternalError,
                        "reference count of task '{}' dropped below zero",
                        registry.label(dependent)
                    ),
                }
            }
        }

        finished
    }

    /// Takes `count` completed slots off the outstanding counter. Returns
    /// whether that finished a started frame.
    fn retire(&self, count: usize) -> bool {
        if count == 0 {
            return false;
        }

        let previous = self.pending.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(previous >= count);
        previous == count && self.started.load(Ordering::Acquire)
    }

    fn frame_complete(&self) {
        if self.frame_done.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!("frame complete");

        let notify = self.notify.read().clone();
        if let Some(notify) = notify {
            notify.simulation_complete();
        }
    }

    fn dispatch(&self, ready: Vec<ReadyTask>) {
        if ready.is_empty() {
            return;
        }

        let (gpu_tasks, cpu_tasks): (Vec<_>, Vec<_>) = ready
            .into_iter()
            .partition(|task| task.task_type() == TaskType::Gpu);

        if !gpu_tasks.is_empty() {
            let gpu = self.gpu.read().clone();
            match gpu {
                Some(gpu) => {
                    gpu.start_group();
                    for task in gpu_tasks {
                        gpu.submit_task(task);
                    }
                    gpu.finish_group();
                }
                None => {
                    for task in gpu_tasks {
                        report!(
                            self.errors,
                            ErrorCode::InvalidOperation,
                            "GPU dispatcher removed before task '{}' was dispatched, releasing it without running",
                            task.name()
                        );
                        task.release();
                    }
                }
            }
        }

        if !cpu_tasks.is_empty() {
            let cpu = self.cpu.read().clone();
            match cpu {
                Some(cpu) => {
                    for task in cpu_tasks {
                        cpu.submit_task(task);
                    }
                }
                None => {
                    for task in cpu_tasks {
                        report!(
                            self.errors,
                            ErrorCode::InvalidOperation,
                            "no CPU dispatcher for task '{}', releasing it without running",
                            task.name()
                        );
                        task.release();
                    }
                }
            }
        }
    }

    /// Completion callback of a dispatched task.
    pub(crate) fn task_completed(self: &Arc<Self>, id: TaskId) {
        let mut ready = Vec::new();
        let fire = {
            let registry = self.registry.read();

            let Some(index) = registry.index(id) else {
                report!(
                    self.errors,
                    ErrorCode::InvalidOperation,
                    "task {id:?} completed after its frame was reset"
                );
                return;
            };

            if registry.rows[index].slot.is_released() {
                report!(
                    self.errors,
                    ErrorCode::InternalError,
                    "task '{}' released twice",
                    registry.label(index)
                );
                debug_assert!(false, "task released twice");
                return;
            }

            let finished = self.cascade(&registry, vec![index], &mut ready);
            self.retire(finished)
        };

        self.dispatch(ready);
        if fire {
            self.frame_complete();
        }
    }
}

/// Builder for [`TaskManager`].
#[derive(Default)]
pub struct TaskManagerBuilder {
    cpu: Option<Arc<dyn CpuDispatcher>>,
    gpu: Option<Arc<dyn GpuDispatcher>>,
    notify: Option<Arc<dyn NotificationInterface>>,
    errors: Option<Arc<dyn ErrorCallback>>,
}

impl TaskManagerBuilder {
    pub fn cpu_dispatcher(mut self, cpu: Arc<dyn CpuDispatcher>) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn gpu_dispatcher(mut self, gpu: Arc<dyn GpuDispatcher>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn notification(mut self, notify: Arc<dyn NotificationInterface>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Sink for scheduler diagnostics, [`TracingErrorCallback`] by default.
    pub fn error_callback(mut self, errors: Arc<dyn ErrorCallback>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn build(self) -> TaskManager {
        TaskManager {
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry::new()),
                cpu: RwLock::new(self.cpu),
                gpu: RwLock::new(self.gpu),
                notify: RwLock::new(self.notify),
                errors: self
                    .errors
                    .unwrap_or_else(|| Arc::new(TracingErrorCallback)),
                pending: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                frame_done: AtomicBool::new(false),
            }),
        }
    }
}
