//! # Background Work
//!
//! Cooperative cancellation and named worker threads for running a training
//! pass off the acquisition path.
//!
//! ```rust
//! use spikesort_core::rt::{spawn_worker, CancelToken, WorkerConfig};
//!
//! let cancel = CancelToken::new();
//! let observer = cancel.clone();
//! let handle = spawn_worker(&WorkerConfig::new("spikesort-demo"), move || observer.is_cancelled())
//!     .unwrap();
//! assert!(!handle.join().unwrap());
//! cancel.cancel();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Worker thread settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name
    pub name: String,
    /// Stack size in bytes (0 = platform default)
    pub stack_size: usize,
}

impl WorkerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stack_size: 0,
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("spikesort-worker")
    }
}

/// Spawn a named worker thread.
pub fn spawn_worker<F, T>(config: &WorkerConfig, f: F) -> std::io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let mut builder = thread::Builder::new().name(config.name.clone());
    if config.stack_size > 0 {
        builder = builder.stack_size(config.stack_size);
    }
    let handle = builder.spawn(f)?;
    tracing::debug!(thread = %config.name, "worker spawned");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
        a.cancel();
        assert!(a.is_cancelled());
    }

    #[test]
    fn test_worker_is_named() {
        let config = WorkerConfig::new("spikesort-test").stack_size(256 * 1024);
        let handle = spawn_worker(&config, || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("spikesort-test"));
    }
}
