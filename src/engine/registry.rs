use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::engine::{Task, TaskExecution, TaskId, TaskType};

/// Atomically-updated state of one slot. Shared with the [`ReadyTask`] that
/// is dispatched from it, so completion and profiling never need the table
/// lock.
///
/// [`ReadyTask`]: crate::ReadyTask
#[derive(Debug)]
pub(crate) struct Slot {
    ref_count: AtomicU32,
    kind: AtomicU8,
    released: AtomicBool,
    stream_index: AtomicU32,
    pre_sync: AtomicBool,
    pub(crate) execution: Mutex<Option<TaskExecution>>,
}

impl Slot {
    fn new(kind: TaskType) -> Self {
        Self {
            ref_count: AtomicU32::new(1),
            kind: AtomicU8::new(kind as u8),
            released: AtomicBool::new(false),
            stream_index: AtomicU32::new(0),
            pre_sync: AtomicBool::new(false),
            execution: Mutex::new(None),
        }
    }

    pub(crate) fn kind(&self) -> TaskType {
        TaskType::from_u8(self.kind.load(Ordering::Acquire))
    }

    pub(crate) fn set_kind(&self, kind: TaskType) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    /// Marks the slot as handed off, returning what it was before. Only the
    /// first caller ever sees something other than `Completed`.
    pub(crate) fn claim(&self) -> TaskType {
        TaskType::from_u8(self.kind.swap(TaskType::Completed as u8, Ordering::AcqRel))
    }

    pub(crate) fn references(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_reference(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference, returning the new count, or `None` if the count
    /// was already zero.
    pub(crate) fn remove_reference(&self) -> Option<u32> {
        self.remove_reference_above(0)
    }

    /// Drops one reference unless the count would fall below `floor`.
    pub(crate) fn remove_reference_above(&self, floor: u32) -> Option<u32> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > floor).then(|| count - 1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    /// Returns `true` the first time it is called.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn stream_index(&self) -> u32 {
        self.stream_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_stream_index(&self, index: u32) {
        self.stream_index.store(index, Ordering::Relaxed);
    }

    pub(crate) fn pre_sync(&self) -> bool {
        self.pre_sync.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pre_sync(&self, value: bool) {
        self.pre_sync.store(value, Ordering::Relaxed);
    }
}

/// Table-owned part of a slot, only touched under the table lock.
pub(crate) struct Row {
    pub(crate) slot: Arc<Slot>,
    pub(crate) name: Option<Arc<str>>,
    pub(crate) task: Option<Arc<dyn Task>>,
    /// Slots whose reference this slot drops when it completes.
    pub(crate) dependents: Vec<usize>,
    /// Whether the reference every slot is born with has been dropped.
    pub(crate) initial_released: bool,
}

/// The per-frame slot table and name map.
pub(crate) struct Registry {
    pub(crate) frame: u32,
    pub(crate) rows: Vec<Row>,
    pub(crate) names: HashMap<Arc<str>, usize>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            frame: 1,
            rows: Vec::new(),
            names: HashMap::new(),
        }
    }

    /// Drops every slot and moves on to the next generation of ids.
    pub(crate) fn reset(&mut self) {
        self.rows.clear();
        self.names.clear();
        self.frame = self.frame.wrapping_add(1);
    }

    pub(crate) fn id(&self, index: usize) -> TaskId {
        TaskId::new(self.frame, index)
    }

    /// Resolves an id issued during the current frame.
    pub(crate) fn index(&self, id: TaskId) -> Option<usize> {
        let index = id.index()?;
        (id.frame() == self.frame && index < self.rows.len()).then_some(index)
    }

    pub(crate) fn push(
        &mut self,
        name: Option<Arc<str>>,
        task: Option<Arc<dyn Task>>,
        kind: TaskType,
    ) -> usize {
        let index = self.rows.len();

        if let Some(name) = &name {
            self.names.insert(name.clone(), index);
        }

        self.rows.push(Row {
            slot: Arc::new(Slot::new(kind)),
            name,
            task,
            dependents: Vec::new(),
            initial_released: false,
        });

        index
    }

    pub(crate) fn label(&self, index: usize) -> String {
        let row = &self.rows[index];
        match (&row.name, &row.task) {
            (Some(name), _) => name.to_string(),
            (None, Some(task)) => task.name().to_string(),
            (None, None) => format!("#{index}"),
        }
    }
}
