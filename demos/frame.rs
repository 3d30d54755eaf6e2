//! Runs three frames of a small simulation graph on the default pool.
//!
//! ```text
//! RUST_LOG=frametask=trace cargo run --example frame -- [config.json]
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use frametask::{
    AllocId, Config, CudaMemoryManager, DefaultCpuDispatcher, FnTask, HeapMemoryManager,
    InlineDispatcher, MemoryType, NotificationInterface, TaskManager, TaskType,
};

struct FrameDone(Sender<()>);

impl NotificationInterface for FrameDone {
    fn simulation_complete(&self) {
        let _ = self.0.send(());
    }
}

fn spin(micros: u64) {
    std::thread::sleep(Duration::from_micros(micros));
}

fn main() -> anyhow::Result<()> {
    frametask::init_logging()?;

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let heap = Arc::new(HeapMemoryManager::new(&config.heap)?);
    let (tx, rx) = bounded(1);
    let tm = TaskManager::builder()
        .cpu_dispatcher(Arc::new(DefaultCpuDispatcher::from_config(&config.cpu)?))
        .gpu_dispatcher(Arc::new(InlineDispatcher))
        .notification(Arc::new(FrameDone(tx)))
        .build();

    let contacts = Arc::new(AtomicU64::new(0));

    for frame in 0..3 {
        tm.reset_dependencies();

        // Wired by name before anyone submits the solver.
        let solve = tm.get_named_task("solve");

        let broad = tm.submit_named_task(
            FnTask::shared("broad_phase", || spin(300)),
            "broad_phase",
            TaskType::Cpu,
        );

        let narrow = {
            let contacts = contacts.clone();
            tm.submit_named_task(
                FnTask::shared("narrow_phase", move || {
                    spin(500);
                    contacts.fetch_add(64, Ordering::Relaxed);
                }),
                "narrow_phase",
                TaskType::Cpu,
            )
        };

        let cloth = {
            let heap = heap.clone();
            tm.submit_unnamed_task(
                FnTask::shared("cloth", move || {
                    match heap.alloc(MemoryType::DeviceMemory, 64 << 10, AllocId::Cloth) {
                        Ok(buffer) => {
                            spin(200);
                            let _ = heap.free(MemoryType::DeviceMemory, buffer);
                        }
                        Err(err) => tracing::error!("cloth buffer: {err}"),
                    }
                }),
                TaskType::Gpu,
            )
        };

        tm.submit_named_task(FnTask::shared("solve", || spin(400)), "solve", TaskType::Cpu);
        let integrate =
            tm.submit_unnamed_task(FnTask::shared("integrate", || spin(100)), TaskType::Cpu);

        tm.finish_before(broad, narrow);
        tm.finish_before(broad, cloth);
        tm.start_after(solve, narrow);
        tm.start_after(solve, cloth);
        tm.finish_before(solve, integrate);

        tm.start_simulation();
        rx.recv_timeout(Duration::from_secs(5))?;
        tm.stop_simulation();

        let diagnostics = tm.diagnostics();
        tracing::info!(
            frame,
            busy = ?diagnostics.busy_time(),
            wall = ?diagnostics.wall_time(),
            "frame complete"
        );

        if frame == 2 {
            println!("{}", diagnostics.render_mermaid(&tm.dependency_graph()));
        }
    }

    let device = heap.stats(MemoryType::DeviceMemory);
    tracing::info!(
        contacts = contacts.load(Ordering::Relaxed),
        heap_size = device.heap_size,
        peak = device.max_allocated,
        "done"
    );

    Ok(())
}
