use crate::event::ClassifiedEvent;
use crossbeam_queue::ArrayQueue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Default capacity of the ingest → processor buffer.
pub const EVENT_QUEUE_CAPACITY: usize = 10_000;

/// Bounded FIFO between the watcher ingest path and the processing loop.
///
/// When full, the oldest queued event is evicted into a recovery buffer instead
/// of rejecting the new one. `recover_evicted_events` re-admits evicted events
/// once room frees up, so events are delayed and reordered but never dropped.
#[derive(Debug, Clone)]
pub struct EventQueue<T = ClassifiedEvent> {
    queue: Arc<ArrayQueue<T>>,
    evicted: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
    telemetry: Arc<QueueCounters>,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    evicted: AtomicU64,
    recovered: AtomicU64,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new(EVENT_QUEUE_CAPACITY)
    }
}

impl<T> EventQueue<T> {
    /// Creates a queue holding at most `capacity` events before evicting.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event queue capacity must be > 0");
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
            evicted: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            telemetry: Arc::new(QueueCounters::default()),
        }
    }

    /// Appends an event, evicting the oldest queued one when saturated.
    pub fn enqueue(&self, event: T) {
        self.telemetry.enqueued.fetch_add(1, Ordering::Relaxed);
        if let Some(oldest) = self.queue.force_push(event) {
            self.telemetry.evicted.fetch_add(1, Ordering::Relaxed);
            self.evicted_buffer().push_back(oldest);
        }
    }

    /// Removes up to `max_size` events in FIFO order. May return an empty batch.
    pub fn dequeue_batch(&self, max_size: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(max_size.min(self.queue.len()));
        while batch.len() < max_size {
            match self.queue.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    /// Moves evicted events back into the queue while it has free slots.
    ///
    /// Returns how many events were re-admitted.
    pub fn recover_evicted_events(&self) -> usize {
        let mut evicted = self.evicted_buffer();
        let mut recovered = 0usize;
        while let Some(event) = evicted.pop_front() {
            if let Err(event) = self.queue.push(event) {
                evicted.push_front(event);
                break;
            }
            recovered += 1;
        }
        self.telemetry
            .recovered
            .fetch_add(recovered as u64, Ordering::Relaxed);
        recovered
    }

    /// Number of events currently queued (excluding the recovery buffer).
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    /// Number of events waiting in the recovery buffer.
    pub fn evicted_len(&self) -> usize {
        self.evicted_buffer().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn telemetry(&self) -> QueueTelemetry {
        QueueTelemetry {
            depth: self.size(),
            capacity: self.capacity,
            evicted_pending: self.evicted_len(),
            enqueued_total: self.telemetry.enqueued.load(Ordering::Relaxed),
            evicted_total: self.telemetry.evicted.load(Ordering::Relaxed),
            recovered_total: self.telemetry.recovered.load(Ordering::Relaxed),
        }
    }

    fn evicted_buffer(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.evicted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Snapshot of queue depth and overflow counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueTelemetry {
    pub depth: usize,
    pub capacity: usize,
    pub evicted_pending: usize,
    pub enqueued_total: u64,
    pub evicted_total: u64,
    pub recovered_total: u64,
}

impl QueueTelemetry {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.depth as f64 / self.capacity as f64).clamp(0.0, 1.0)
    }

    pub fn render_metrics(&self) -> String {
        format!(
            "epu_ingest_queue_depth {}\nepu_ingest_queue_evicted_pending {}\nepu_ingest_queue_evicted_total {}\nepu_ingest_queue_recovered_total {}\nepu_ingest_queue_utilization {:.6}\n",
            self.depth,
            self.evicted_pending,
            self.evicted_total,
            self.recovered_total,
            self.utilization()
        )
    }
}
