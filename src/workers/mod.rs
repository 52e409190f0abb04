mod loop_closure;
mod map_manager;
mod optimizer;

pub use loop_closure::{spawn_loop_closure, LoopClosureShared, LoopPair};
pub use map_manager::spawn_map_manager;
pub use optimizer::{optimize_once, spawn_optimizer};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Handle on a cooperatively cancellable background thread. Workers check
/// their stop flag at every loop head and exit promptly on
/// [`Worker::request_stop`].
pub struct Worker {
    name: &'static str,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Starts a worker thread. The closure receives the stop flag and is
    /// expected to poll it.
    pub fn spawn<F>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_stop))
            .expect("failed to spawn worker thread");
        log::debug!("worker {name} started");
        Self {
            name,
            stop,
            handle: Some(handle),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Requests a stop and blocks until the thread exits.
    pub fn join(mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker {} panicked", self.name);
            } else {
                log::debug!("worker {} joined", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
