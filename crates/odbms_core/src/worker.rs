//! Bounded background worker runtime.
//!
//! # Responsibility
//! - Run blocking driver calls off async tasks (`run_blocking`).
//! - Drive natively async drivers to completion for the blocking API
//!   (`block_on`) and schedule them for the async API (`spawn`).
//!
//! # Invariants
//! - At most one runtime is alive per worker; it is created lazily and
//!   recreated transparently after `shutdown`.
//! - `generation` increases every time a new runtime is built, so holders of
//!   runtime-bound resources can detect that they must reconnect.
//! - Dropping a worker never blocks, even inside an async context.

use crate::error::{DbmsError, DbmsResult};
use log::{debug, info};
use parking_lot::Mutex;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};

const WORKER_THREAD_NAME: &str = "odbms-worker";

struct WorkerState {
    runtime: Option<Runtime>,
    generation: u64,
}

/// Owner of the tokio runtime shared by every adapter of one `Dbms` handle.
pub struct Worker {
    threads: usize,
    state: Mutex<WorkerState>,
}

impl Worker {
    /// Creates a worker; the runtime itself starts on first use.
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            state: Mutex::new(WorkerState {
                runtime: None,
                generation: 0,
            }),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Returns a handle to the live runtime, building one if needed.
    pub fn handle(&self) -> DbmsResult<Handle> {
        self.handle_and_generation().map(|(handle, _)| handle)
    }

    /// Generation of the live runtime (building one if needed).
    pub fn generation(&self) -> DbmsResult<u64> {
        self.handle_and_generation()
            .map(|(_, generation)| generation)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().runtime.is_some()
    }

    /// Handle and generation read under one lock.
    pub(crate) fn handle_and_generation(&self) -> DbmsResult<(Handle, u64)> {
        let mut state = self.state.lock();
        if let Some(runtime) = state.runtime.as_ref() {
            return Ok((runtime.handle().clone(), state.generation));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(self.threads)
            .max_blocking_threads(self.threads)
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(|err| DbmsError::Worker(format!("failed to start runtime: {err}")))?;
        state.generation += 1;
        let handle = runtime.handle().clone();
        state.runtime = Some(runtime);
        info!(
            "event=worker_start module=worker status=ok threads={} generation={}",
            self.threads, state.generation
        );
        Ok((handle, state.generation))
    }

    /// Drives `future` to completion on the calling thread.
    ///
    /// Must not be called from inside an async task; use [`Worker::spawn`]
    /// there.
    pub fn block_on<F: Future>(&self, future: F) -> DbmsResult<F::Output> {
        let handle = self.handle()?;
        Ok(handle.block_on(future))
    }

    /// Runs a blocking closure on the bounded blocking pool.
    pub async fn run_blocking<F, T>(&self, job: F) -> DbmsResult<T>
    where
        F: FnOnce() -> DbmsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.handle()?;
        handle
            .spawn_blocking(job)
            .await
            .map_err(|err| DbmsError::Worker(err.to_string()))?
    }

    /// Schedules `future` on the runtime and awaits its output.
    pub async fn spawn<F, T>(&self, future: F) -> DbmsResult<T>
    where
        F: Future<Output = DbmsResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.handle()?;
        handle
            .spawn(future)
            .await
            .map_err(|err| DbmsError::Worker(err.to_string()))?
    }

    /// Stops the runtime without waiting for outstanding tasks.
    ///
    /// The next call that needs the runtime builds a fresh one.
    pub fn shutdown(&self) {
        let runtime = self.state.lock().runtime.take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            debug!("event=worker_stop module=worker status=ok");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(runtime) = self.state.get_mut().runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Worker")
            .field("threads", &self.threads)
            .field("running", &state.runtime.is_some())
            .field("generation", &state.generation)
            .finish()
    }
}
