use std::fmt;

use thiserror::Error;

use crate::memory::MemoryType;

/// Severity and category of a diagnostic sent to an [`ErrorCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DebugInfo,
    DebugWarning,
    /// A method was called with an argument it can't accept (stale id,
    /// duplicate name, ...). The call is ignored.
    InvalidParameter,
    /// A method was called at the wrong point of the frame lifecycle.
    InvalidOperation,
    OutOfMemory,
    /// The scheduler detected that its own bookkeeping is inconsistent,
    /// usually caused by a broken dispatcher.
    InternalError,
    Abort,
    PerfWarning,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::DebugInfo => "debug info",
            ErrorCode::DebugWarning => "debug warning",
            ErrorCode::InvalidParameter => "invalid parameter",
            ErrorCode::InvalidOperation => "invalid operation",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::InternalError => "internal error",
            ErrorCode::Abort => "abort",
            ErrorCode::PerfWarning => "performance warning",
        };

        f.write_str(name)
    }
}

/// Out-of-band diagnostic sink.
///
/// The scheduler never reports misuse through return values on its hot path.
/// Instead every contract violation and soft failure is sent here, tagged with
/// the source location that detected it. Implementations may be called from
/// any thread, concurrently, and sometimes while the manager's slot table is
/// locked, so they must not call back into the manager.
pub trait ErrorCallback: Send + Sync {
    fn report_error(&self, code: ErrorCode, message: &str, file: &str, line: u32);
}

/// Default sink, forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorCallback;

impl ErrorCallback for TracingErrorCallback {
    fn report_error(&self, code: ErrorCode, message: &str, file: &str, line: u32) {
        match code {
            ErrorCode::DebugInfo => {
                tracing::debug!(%code, file, line, "{message}")
            }
            ErrorCode::DebugWarning | ErrorCode::PerfWarning => {
                tracing::warn!(%code, file, line, "{message}")
            }
            _ => tracing::error!(%code, file, line, "{message}"),
        }
    }
}

/// Sends a formatted message to an [`ErrorCallback`], capturing the caller's
/// file and line.
macro_rules! report {
    ($sink:expr, $code:expr, $($arg:tt)+) => {
        $sink.report_error($code, &format!($($arg)+), file!(), line!())
    };
}

pub(crate) use report;

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("Requested a zero-sized {0} buffer")]
    ZeroSize(MemoryType),

    #[error("Out of {memory_type} memory: {requested} bytes requested, heap is {heap_size} of at most {limit} bytes")]
    OutOfMemory {
        memory_type: MemoryType,
        requested: u64,
        heap_size: u64,
        limit: u64,
    },

    #[error("Buffer {ptr:#x} was not allocated from the {memory_type} heap")]
    UnknownBuffer { memory_type: MemoryType, ptr: u64 },

    #[error("Resizing buffer {ptr:#x} to {size} bytes would move it (capacity {capacity} bytes)")]
    WouldMove { ptr: u64, size: u64, capacity: u64 },

    #[error("Page size {0} is not a non-zero power of two")]
    InvalidPageSize(u64),

    #[error("The {0} heap already owns pages, its page size can't change")]
    HeapInUse(MemoryType),

    #[error("Maximum size {requested} is below the current {memory_type} heap size {heap_size}")]
    MaxBelowHeap {
        memory_type: MemoryType,
        requested: u64,
        heap_size: u64,
    },
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("A thread pool needs at least one worker thread")]
    NoWorkers,

    #[error("Couldn't spawn worker thread.\n{0}")]
    Spawn(#[from] std::io::Error),

    #[error("Couldn't build rayon thread pool.\n{0}")]
    Rayon(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't parse configuration.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration for {0}: {1}")]
    Invalid(&'static str, String),
}
