use super::EngineShared;
use super::handle::DeferredState;
use crate::error::EngineError;
use crate::operation::BoxedOperation;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

pub(crate) struct QueuedOperation {
    pub(crate) op: BoxedOperation,
    pub(crate) handle: Arc<DeferredState>,
    pub(crate) enqueued_at: Instant,
}

struct QueueState {
    items: VecDeque<QueuedOperation>,
    closed: bool,
}

/// Bounded FIFO between submitting callers and the admitter thread.
pub(crate) struct AdmissionQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_full: Condvar,
}

impl AdmissionQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            not_full: Condvar::new(),
        }
    }

    /// Blocks while the queue is full.
    pub(crate) fn push(&self, item: QueuedOperation) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        while !state.closed && state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(EngineError::ShuttingDown);
        }
        state.items.push_back(item);
        Ok(())
    }

    pub(crate) fn try_push(&self, item: QueuedOperation) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::ShuttingDown);
        }
        if state.items.len() >= self.capacity {
            return Err(EngineError::QueueFull);
        }
        state.items.push_back(item);
        Ok(())
    }

    /// Pops the head and counts it into `active` under the queue lock, so an
    /// item is always visible either as queued or as active. Returns `None`
    /// while `active` is at `max_active`.
    pub(crate) fn pop_admitting(
        &self,
        active: &AtomicUsize,
        max_active: usize,
    ) -> Option<QueuedOperation> {
        let mut state = self.state.lock();
        if active.load(Ordering::Acquire) >= max_active {
            return None;
        }
        let item = state.items.pop_front()?;
        active.fetch_add(1, Ordering::AcqRel);
        self.not_full.notify_one();
        Some(item)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Rejects further pushes and wakes blocked submitters.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.not_full.notify_all();
    }

    pub(crate) fn drain(&self) -> Vec<QueuedOperation> {
        let drained: Vec<_> = self.state.lock().items.drain(..).collect();
        self.not_full.notify_all();
        drained
    }
}

/// Coalescing wake-up: any number of `notify` calls before a wait wake it once.
#[derive(Default)]
pub(crate) struct Signal {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub(crate) fn notify(&self) {
        *self.fired.lock() = true;
        self.cv.notify_all();
    }

    /// Returns `true` when woken by `notify` rather than the timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut fired = self.fired.lock();
        if !*fired {
            self.cv.wait_while_for(&mut fired, |fired| !*fired, timeout);
        }
        std::mem::replace(&mut *fired, false)
    }
}

/// Admitter thread body. Sleeps `admit_interval` between rounds while the
/// queue is below its high-water mark, only yields above it, and admits
/// while fewer than `max_active_roots` root operations are running.
pub(crate) fn run_admitter(shared: Arc<EngineShared>) {
    let high_water = shared.config.queue_high_water;
    let interval = shared.config.admit_interval;
    let max_active = shared.config.max_active_roots();
    debug!(high_water, max_active, "admitter started");
    while !shared.stopping.load(Ordering::Acquire) {
        if shared.queue.len() < high_water {
            shared.admit_signal.wait_timeout(interval);
        } else {
            std::thread::yield_now();
        }
        while let Some(item) = shared.queue.pop_admitting(&shared.active, max_active) {
            shared.admit(item);
        }
    }
    debug!("admitter stopped");
}

#[cfg(test)]
mod tests {
    use super::{AdmissionQueue, QueuedOperation, Signal};
    use crate::engine::handle::DeferredState;
    use crate::error::ErrorCode;
    use crate::identifier::identifier_set;
    use crate::operation::FnOperation;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn item(label: &str) -> QueuedOperation {
        QueuedOperation {
            op: Box::new(FnOperation::new(label, identifier_set(["q"]), |_, _, _| {
                Ok(())
            })),
            handle: DeferredState::new(),
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn full_queue_blocks_push_until_pop() {
        let queue = Arc::new(AdmissionQueue::new(2));
        queue.push(item("a")).expect("a");
        queue.push(item("b")).expect("b");
        assert_eq!(
            queue.try_push(item("c")).map_err(|e| e.code()),
            Err(ErrorCode::QueueFull)
        );

        let pushed = Arc::new(AtomicBool::new(false));
        let pusher = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            std::thread::spawn(move || {
                queue.push(item("c")).expect("c");
                pushed.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(!pushed.load(Ordering::SeqCst));
        let active = AtomicUsize::new(0);
        assert_eq!(
            queue.pop_admitting(&active, 1).map(|i| i.op.label().to_owned()),
            Some("a".into())
        );
        pusher.join().expect("join");
        assert!(pushed.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn popped_items_are_counted_active_before_the_lock_drops() {
        let queue = AdmissionQueue::new(4);
        let active = AtomicUsize::new(0);
        queue.push(item("a")).expect("a");
        queue.push(item("b")).expect("b");

        assert!(queue.pop_admitting(&active, 1).is_some());
        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert!(queue.pop_admitting(&active, 1).is_none());
        assert_eq!(queue.len(), 1);

        active.fetch_sub(1, Ordering::SeqCst);
        assert!(queue.pop_admitting(&active, 1).is_some());
        assert!(queue.is_empty());
        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert!(queue.pop_admitting(&active, 2).is_none());
        assert_eq!(active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_releases_blocked_submitters() {
        let queue = Arc::new(AdmissionQueue::new(1));
        queue.push(item("a")).expect("a");
        let pusher = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(item("b")).map_err(|e| e.code()))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(pusher.join().expect("join"), Err(ErrorCode::ShuttingDown));
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn signal_coalesces_notifications() {
        let signal = Signal::default();
        signal.notify();
        signal.notify();
        assert!(signal.wait_timeout(Duration::from_secs(1)));
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
    }
}
