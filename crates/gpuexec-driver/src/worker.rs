//! Dedicated thread for PTX module loading.
//!
//! The JIT can use a lot of stack, more than some caller threads have. Loads
//! are handed to one worker with a large stack; the caller blocks on a
//! one-shot reply channel. The worker is created on first use and lives for
//! the rest of the process.

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use gpuexec_core::{DriverError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

const WORKER_NAME: &str = "gpuexec-module-loader";
const WORKER_STACK_BYTES: usize = 8 * 1024 * 1024;

static WORKER: Mutex<Option<Sender<Job>>> = Mutex::new(None);

fn worker_sender() -> Result<Sender<Job>> {
    let mut slot = WORKER.lock();
    if let Some(sender) = slot.as_ref() {
        return Ok(sender.clone());
    }

    let (sender, receiver) = unbounded::<Job>();
    std::thread::Builder::new()
        .name(WORKER_NAME.to_string())
        .stack_size(WORKER_STACK_BYTES)
        .spawn(move || {
            debug!("module loader thread started");
            for job in receiver {
                job();
            }
        })
        .map_err(|e| {
            error!("failed to spawn module loader thread: {}", e);
            DriverError::Internal(format!("failed to spawn module loader thread: {}", e))
        })?;

    *slot = Some(sender.clone());
    Ok(sender)
}

/// Run `job` on the module loader thread and wait for its result.
pub(crate) fn run_blocking<T, F>(job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (reply_tx, reply_rx) = bounded::<Result<T>>(1);
    worker_sender()?
        .send(Box::new(move || {
            let _ = reply_tx.send(job());
        }))
        .map_err(|_| DriverError::Internal("module loader thread is gone".to_string()))?;

    reply_rx.recv().map_err(|_| {
        DriverError::Internal("module loader thread dropped the request".to_string())
    })?
}
