//! Background executor for eviction passes.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tapeio_common::Result;
use tracing::{debug, error};

pub type EvictionTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs eviction tasks off the caller's thread
pub trait EvictionExecutor: Send + Sync {
    /// Submit a task. Must not run it inline: the caller may hold locks the
    /// task needs.
    fn execute(&self, task: EvictionTask);
}

enum ExecutorCommand {
    Run(EvictionTask),
    Shutdown,
}

/// A single dedicated worker thread running tasks in submission order
pub struct ThreadExecutor {
    command_tx: Sender<ExecutorCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadExecutor {
    pub fn new(name: &str) -> Result<Self> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::worker_loop(&rx))?;
        Ok(Self {
            command_tx: tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn worker_loop(rx: &Receiver<ExecutorCommand>) {
        while let Ok(command) = rx.recv() {
            match command {
                ExecutorCommand::Run(task) => {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("Background task panicked");
                    }
                }
                ExecutorCommand::Shutdown => break,
            }
        }
        debug!("Executor thread stopped");
    }

    /// Stop after the tasks already submitted and wait for the thread
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.command_tx.send(ExecutorCommand::Shutdown);
        if handle.join().is_err() {
            error!("Executor thread panicked");
        }
    }
}

impl EvictionExecutor for ThreadExecutor {
    fn execute(&self, task: EvictionTask) {
        if self.command_tx.send(ExecutorCommand::Run(task)).is_err() {
            error!("Executor stopped, dropping background task");
        }
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
