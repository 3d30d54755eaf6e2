#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
pub mod dispatch;
mod engine;
mod error;
#[cfg(feature = "logging")]
mod logging;
pub mod memory;

pub use crate::config::{Config, CpuConfig, HeapConfig, HeapTypeConfig};
pub use crate::dispatch::{
    CpuDispatcher, DefaultCpuDispatcher, GpuDispatcher, InlineDispatcher, RayonDispatcher,
};
pub use crate::engine::{
    Continuation, DependencyGraph, Diagnostics, FnTask, GraphNode, LightTask,
    NotificationInterface, ReadyTask, Task, TaskExecution, TaskId, TaskManager,
    TaskManagerBuilder, TaskType, create_task_manager,
};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::memory::{
    AllocId, AllocIdStats, BufferPtr, CudaMemoryManager, HeapMemoryManager, MemoryStats,
    MemoryType, PageAllocator, VirtualPageAllocator,
};
