//! The asynchronous work queue: a single FIFO of request entries drained by
//! exactly one background worker thread.
//!
//! Shutdown is signalled by enqueueing a sentinel; the worker finishes the
//! entry it is on, drains up to the sentinel and exits, and is joined at
//! process exit.

use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::model::request::RequestEntry;

enum WorkItem {
    Run(Box<RequestEntry>),
    Shutdown,
}

/// Producer half of the queue, handed to the HTTP layer.
#[derive(Clone)]
pub struct WorkQueue {
    tx: Arc<Mutex<Sender<WorkItem>>>,
}

impl WorkQueue {
    /// Enqueue an entry for the worker. Returns false when the worker is
    /// gone.
    pub fn submit(&self, entry: RequestEntry) -> bool {
        self.tx.lock().send(WorkItem::Run(Box::new(entry))).is_ok()
    }

    fn push_shutdown(&self) {
        let _ = self.tx.lock().send(WorkItem::Shutdown);
    }
}

/// The queue used by request handlers, installed once at startup.
pub static WORK_QUEUE: OnceCell<WorkQueue> = OnceCell::new();

/// The background worker owning the consumer half of the queue.
pub struct WasmWorker {
    queue: WorkQueue,
    handle: Option<JoinHandle<()>>,
}

impl WasmWorker {
    /// Start the worker thread; `handler` executes one entry at a time.
    pub fn spawn<F>(mut handler: F) -> Self
    where
        F: FnMut(RequestEntry) + Send + 'static,
    {
        let (tx, rx) = channel();
        let handle = std::thread::Builder::new()
            .name("wasm-worker".to_string())
            .spawn(move || {
                while let Ok(item) = rx.recv() {
                    match item {
                        WorkItem::Run(entry) => handler(*entry),
                        WorkItem::Shutdown => break,
                    }
                }
                debug!("Wasm worker thread exiting");
            })
            .expect("Failed to spawn wasm worker thread");
        Self {
            queue: WorkQueue {
                tx: Arc::new(Mutex::new(tx)),
            },
            handle: Some(handle),
        }
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Signal shutdown and wait for the worker to drain up to the sentinel.
    pub fn shutdown(mut self) {
        self.queue.push_shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Wasm worker thread panicked before shutdown");
            }
        }
    }
}
