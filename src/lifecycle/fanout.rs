//! Multi-process fan-out.
//!
//! # Responsibilities
//! - Resolve the requested worker count (0 = one per CPU core)
//! - Fork workers that inherit the already-bound listening sockets
//! - Supervise workers in the parent, re-forking ones that crash
//!
//! # Design Decisions
//! - Fork happens before any runtime or reactor task is running
//! - Workers share nothing but the inherited descriptors (and so the kernel
//!   listen queue); each continues with its own copy of the server

use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;

/// Default cap on child restarts before the parent gives up.
pub const DEFAULT_MAX_RESTARTS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),

    #[error("waiting for workers failed: {0}")]
    Wait(#[source] io::Error),

    #[error("too many worker restarts (limit {0}), giving up")]
    TooManyRestarts(usize),
}

/// Splits the process into workers.
pub trait ProcessFanout {
    /// Fork `count` workers.
    ///
    /// Returns in each worker with its task id (`0..count`). Implementations
    /// may keep the parent inside this call until every worker has exited.
    fn fork_processes(&mut self, count: NonZeroUsize) -> Result<usize, FanoutError>;
}

/// Number of CPU cores available to this process, at least 1.
pub fn cpu_count() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

/// `0` means one worker per core.
pub fn resolve_worker_count(requested: usize) -> NonZeroUsize {
    NonZeroUsize::new(requested).unwrap_or_else(cpu_count)
}

/// `fork(2)`-based fan-out.
///
/// The parent never returns on success: it waits for its children, re-forks
/// any that die from a signal or exit non-zero, and exits the process once
/// all of them have exited cleanly.
#[derive(Debug, Clone)]
pub struct ForkFanout {
    max_restarts: usize,
}

impl Default for ForkFanout {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }
}

enum Forked {
    Child(usize),
    Parent(libc::pid_t),
}

impl ForkFanout {
    pub fn new(max_restarts: usize) -> Self {
        Self { max_restarts }
    }

    fn spawn(task_id: usize) -> Result<Forked, FanoutError> {
        // SAFETY: called before any runtime or helper thread exists; the child
        // only continues single-threaded Rust code.
        match unsafe { libc::fork() } {
            -1 => Err(FanoutError::Fork(io::Error::last_os_error())),
            0 => Ok(Forked::Child(task_id)),
            pid => Ok(Forked::Parent(pid)),
        }
    }

    fn wait_any() -> Result<(libc::pid_t, libc::c_int), FanoutError> {
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: `status` is a valid out-pointer for the duration of the call.
            let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
            if pid >= 0 {
                return Ok((pid, status));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(FanoutError::Wait(err));
            }
        }
    }
}

impl ProcessFanout for ForkFanout {
    fn fork_processes(&mut self, count: NonZeroUsize) -> Result<usize, FanoutError> {
        tracing::info!(workers = count.get(), "Starting worker processes");

        let mut children: HashMap<libc::pid_t, usize> = HashMap::with_capacity(count.get());
        for task_id in 0..count.get() {
            match Self::spawn(task_id)? {
                Forked::Child(id) => return Ok(id),
                Forked::Parent(pid) => {
                    children.insert(pid, task_id);
                }
            }
        }

        let mut restarts = 0;
        while !children.is_empty() {
            let (pid, status) = Self::wait_any()?;
            let Some(task_id) = children.remove(&pid) else {
                continue;
            };

            if libc::WIFSIGNALED(status) {
                tracing::warn!(task_id, pid, signal = libc::WTERMSIG(status), "Worker killed by signal");
            } else if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) != 0 {
                tracing::warn!(task_id, pid, status = libc::WEXITSTATUS(status), "Worker exited with error");
            } else {
                tracing::info!(task_id, pid, "Worker exited normally");
                continue;
            }

            restarts += 1;
            if restarts > self.max_restarts {
                return Err(FanoutError::TooManyRestarts(self.max_restarts));
            }
            match Self::spawn(task_id)? {
                Forked::Child(id) => return Ok(id),
                Forked::Parent(new_pid) => {
                    children.insert(new_pid, task_id);
                }
            }
        }

        tracing::info!("All workers exited");
        std::process::exit(0);
    }
}
