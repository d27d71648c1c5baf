use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Runs the processor's worker task.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> io::Result<()>;
}

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

/// Spawns each task on a fresh named thread.
#[derive(Debug, Default)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed) + 1;

        thread::Builder::new()
            .name(format!("reactor-io-worker-{}", id))
            .spawn(task)
            .map(|_| ())
    }
}
