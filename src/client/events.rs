use crate::error::Error;
use derive_more::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Client-side upload lifecycle state.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    #[display("idle")]
    Idle,
    #[display("initializing")]
    Initializing,
    #[display("uploading")]
    Uploading,
    #[display("paused")]
    Paused,
    #[display("completing")]
    Completing,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("canceled")]
    Canceled,
}

/// Progress snapshot emitted after every chunk completion. Events arrive in
/// completion order, not index order.
#[derive(Debug, Clone, Copy)]
pub struct UploadProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub percentage: u8,
    /// Index of the chunk whose completion triggered this event.
    pub chunk_index: u32,
    pub chunks_completed: u32,
    pub total_chunks: u32,
}

/// Handle returned by subscription; identifies the handler for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// One event channel: handlers fire synchronously in registration order.
struct Channel<T> {
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Channel<T> {
    fn subscribe(&self, id: u64, handler: Handler<T>) -> SubscriptionId {
        self.lock().push((id, handler));
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id.0);
        handlers.len() != before
    }

    fn emit(&self, event: &T) {
        // Snapshot so a handler may (un)subscribe without deadlocking
        let handlers: Vec<Handler<T>> =
            self.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Handler<T>)>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Typed publish/subscribe surface with the three upload channels.
#[derive(Default)]
pub(crate) struct UploadEvents {
    next_id: AtomicU64,
    progress: Channel<UploadProgress>,
    status: Channel<UploadState>,
    error: Channel<Error>,
}

impl UploadEvents {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn on_progress<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&UploadProgress) + Send + Sync + 'static,
    {
        self.progress.subscribe(self.next_id(), Arc::new(handler))
    }

    pub fn on_status<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&UploadState) + Send + Sync + 'static,
    {
        self.status.subscribe(self.next_id(), Arc::new(handler))
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.error.subscribe(self.next_id(), Arc::new(handler))
    }

    pub fn off_progress(&self, id: SubscriptionId) -> bool {
        self.progress.unsubscribe(id)
    }

    pub fn off_status(&self, id: SubscriptionId) -> bool {
        self.status.unsubscribe(id)
    }

    pub fn off_error(&self, id: SubscriptionId) -> bool {
        self.error.unsubscribe(id)
    }

    pub fn emit_progress(&self, progress: &UploadProgress) {
        self.progress.emit(progress);
    }

    pub fn emit_status(&self, state: UploadState) {
        self.status.emit(&state);
    }

    pub fn emit_error(&self, error: &Error) {
        self.error.emit(error);
    }
}
