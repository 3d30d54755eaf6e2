//! The frame task graph.
//!
//! A frame is a graph of [`Task`]s registered with a [`TaskManager`]. Edges
//! are never stored on the task objects themselves: every dependency is a
//! reference held on the dependent's slot, and a slot is handed to a
//! dispatcher the moment its reference count drops to zero.
//!
//! ## Frame lifecycle
//!
//! 1. [`TaskManager::reset_dependencies`] opens a new frame and invalidates
//!    every [`TaskId`] handed out before.
//! 2. Tasks are reserved ([`TaskManager::get_named_task`]), submitted
//!    ([`TaskManager::submit_named_task`], [`TaskManager::submit_unnamed_task`])
//!    and wired ([`TaskManager::finish_before`], [`TaskManager::start_after`]).
//! 3. [`TaskManager::start_simulation`] releases the initial reference of
//!    every slot; whatever reaches zero is dispatched.
//! 4. Dispatchers run each [`ReadyTask`] and release it, which unblocks its
//!    dependents. When nothing is outstanding the
//!    [`NotificationInterface`] is told the frame is complete.

mod diagnostics;
mod light;
mod manager;
mod registry;
mod task;

use std::fmt;

pub use crate::engine::diagnostics::{DependencyGraph, Diagnostics, GraphNode, TaskExecution};
pub use crate::engine::light::{Continuation, LightTask};
pub use crate::engine::manager::{TaskManager, TaskManagerBuilder, create_task_manager};
pub use crate::engine::task::{FnTask, ReadyTask, Task};

/// A per-frame handle to a task slot in a [`TaskManager`].
///
/// The handle carries the generation of the frame that issued it, so a handle
/// kept across [`TaskManager::reset_dependencies`] can never alias the slot
/// that reuses its index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// The reserved sentinel, never issued by a manager.
    pub const INVALID: TaskId = TaskId(0);

    pub(crate) fn new(frame: u32, index: usize) -> Self {
        debug_assert!(index < u32::MAX as usize);
        TaskId(((frame as u64) << 32) | (index as u64 + 1))
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// The raw opaque value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn frame(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn index(self) -> Option<usize> {
        match self.0 & 0xFFFF_FFFF {
            0 => None,
            n => Some(n as usize - 1),
        }
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(index) => write!(f, "TaskId({}:{})", self.frame(), index),
            None => write!(f, "TaskId(INVALID)"),
        }
    }
}

/// Where a slot is headed, or what happened to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskType {
    /// Run on the [`CpuDispatcher`](crate::CpuDispatcher).
    Cpu = 0,
    /// Run on the [`GpuDispatcher`](crate::GpuDispatcher).
    Gpu = 1,
    /// No runnable body: a reserved name nobody submitted, or a task whose
    /// dispatcher isn't registered. Resolving it only unblocks dependents.
    NotPresent = 2,
    /// The slot has been handed off or resolved for this frame.
    Completed = 3,
}

impl TaskType {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskType::Cpu,
            1 => TaskType::Gpu,
            2 => TaskType::NotPresent,
            _ => TaskType::Completed,
        }
    }
}

/// Receives frame-level events from a [`TaskManager`].
///
/// Both callbacks may run on any thread and no manager lock is held while they
/// run, so `simulation_complete` is free to reset the manager and submit the
/// next frame.
pub trait NotificationInterface: Send + Sync {
    /// Every task submitted in the current frame has been released.
    fn simulation_complete(&self);

    /// The manager is being torn down.
    fn release(&self) {}
}
