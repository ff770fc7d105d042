//! In-memory correlation store and task buffer.
//!
//! Ingestion writes both; the batch scheduler is the only reader. The store
//! keeps the full message until its result is assembled, the buffer carries
//! the lightweight task the processor works on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, warn};

use super::types::{ClassificationTask, IncomingMessage, MessageId};

// ── Correlation store ───────────────────────────────────────────────

/// Holds the original message keyed by id until its result resolves.
pub struct CorrelationStore {
    entries: RwLock<HashMap<MessageId, IncomingMessage>>,
}

impl CorrelationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Insert a message. A duplicate in-flight id replaces the older entry.
    pub async fn put(&self, message: IncomingMessage) {
        let id = message.id;
        let previous = self.entries.write().await.insert(id, message);
        if previous.is_some() {
            warn!(messageid = id, "Duplicate in-flight message id, replacing entry");
        }
    }

    /// Fetch and remove the entry for `id`.
    pub async fn take(&self, id: MessageId) -> Option<IncomingMessage> {
        self.entries.write().await.remove(&id)
    }

    pub async fn contains(&self, id: MessageId) -> bool {
        self.entries.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

// ── Task buffer ─────────────────────────────────────────────────────

/// Multi-producer, single-consumer FIFO of classification tasks.
///
/// Backed by an unbounded channel so producers never wait. The receiver
/// sits behind a mutex so concurrent drains cannot interleave.
pub struct TaskBuffer {
    tx: mpsc::UnboundedSender<ClassificationTask>,
    rx: Mutex<mpsc::UnboundedReceiver<ClassificationTask>>,
    queued: AtomicUsize,
}

impl TaskBuffer {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            queued: AtomicUsize::new(0),
        })
    }

    /// Enqueue a task without blocking.
    pub fn push(&self, task: ClassificationTask) {
        let id = task.id;
        // Counted before the send so a concurrent drain never underflows.
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(task).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            warn!(messageid = id, "Task buffer closed, dropping task");
        }
    }

    /// Remove and return everything currently queued, oldest first.
    pub async fn drain_all(&self) -> Vec<ClassificationTask> {
        let mut rx = self.rx.lock().await;
        let mut tasks = Vec::new();
        while let Ok(task) = rx.try_recv() {
            tasks.push(task);
        }
        self.queued.fetch_sub(tasks.len(), Ordering::AcqRel);
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Drained task buffer");
        }
        tasks
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
