//! Bounded in-memory queue between log producers and the sender loop

use crate::record::LogRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Largest record count a queue may be created with.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 24;

/// Create a queue holding at most `capacity` records and `byte_budget`
/// estimated bytes.
///
/// The producer half is cheap to clone and may be shared by any number of
/// threads. The consumer half is owned by exactly one sender loop.
pub fn record_queue(capacity: usize, byte_budget: usize) -> (RecordQueue, QueueConsumer) {
    let capacity = capacity.clamp(1, MAX_QUEUE_CAPACITY);
    let (tx, rx) = mpsc::channel(capacity);
    let bytes = Arc::new(AtomicUsize::new(0));

    (
        RecordQueue {
            tx,
            capacity,
            byte_budget: byte_budget.max(1),
            bytes: Arc::clone(&bytes),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        QueueConsumer {
            rx,
            capacity,
            bytes,
        },
    )
}

/// Producer half of the record queue.
#[derive(Debug, Clone)]
pub struct RecordQueue {
    tx: mpsc::Sender<LogRecord>,
    capacity: usize,
    byte_budget: usize,
    bytes: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
}

impl RecordQueue {
    /// Offer a record without blocking.
    ///
    /// Returns `false` when the queue is full (by count or by bytes) or
    /// already closed for draining. Rejections are counted, never raised.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        let size = record.estimated_size();
        let held = self.bytes.fetch_add(size, Ordering::AcqRel);

        if held.saturating_add(size) > self.byte_budget {
            self.bytes.fetch_sub(size, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.bytes.fetch_sub(size, Ordering::AcqRel);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Records rejected so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn byte_budget(&self) -> usize {
        self.byte_budget
    }

    /// Estimated bytes currently buffered.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    /// Current occupancy.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outcome of a bounded wait on the queue.
#[derive(Debug)]
pub enum Poll {
    Record(LogRecord),
    Empty,
    Closed,
}

/// Consumer half of the record queue.
#[derive(Debug)]
pub struct QueueConsumer {
    rx: mpsc::Receiver<LogRecord>,
    capacity: usize,
    bytes: Arc<AtomicUsize>,
}

impl QueueConsumer {
    /// Wait up to `timeout` for the next record.
    pub async fn poll(&mut self, timeout: Duration) -> Poll {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(record)) => {
                self.release(&record);
                Poll::Record(record)
            }
            Ok(None) => Poll::Closed,
            Err(_) => Poll::Empty,
        }
    }

    /// Refuse further enqueues. Records already buffered stay readable.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Remove every buffered record, in arrival order.
    pub fn drain_all(&mut self) -> Vec<LogRecord> {
        let mut records = Vec::with_capacity(self.len());
        while let Ok(record) = self.rx.try_recv() {
            self.release(&record);
            records.push(record);
        }

        debug!("Drained {} records from queue", records.len());
        records
    }

    fn release(&self, record: &LogRecord) {
        self.bytes.fetch_sub(record.estimated_size(), Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
