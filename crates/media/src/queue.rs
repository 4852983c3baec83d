use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size-limited FIFO shared between one pipeline stage and the next.
///
/// A full queue refuses the push and hands the item back; the producing
/// worker sleeps and retries, which is the only backpressure mechanism in
/// the pipeline. The capacity is adjustable at runtime because the audio
/// stage re-derives its queue length from the measured mean frame
/// duration.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    max_len: AtomicUsize,
}

impl<T> BoundedQueue<T> {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            max_len: AtomicUsize::new(max_len.max(1)),
        }
    }

    /// Enqueues `item`, or returns it when the queue is at capacity.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut q = match self.inner.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        if q.len() >= self.max_len.load(Ordering::Relaxed) {
            return Err(item);
        }
        q.push_back(item);
        Ok(())
    }

    /// Enqueues past the cap. Only for flows that must not stall the
    /// producer, like audio packets while a video queue paces the demuxer.
    pub fn force_push(&self, item: T) {
        let mut q = match self.inner.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        q.push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        match self.inner.lock() {
            Ok(mut q) => q.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// Applies `f` to the head element without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        match self.inner.lock() {
            Ok(q) => q.front().map(f),
            Err(poisoned) => poisoned.into_inner().front().map(f),
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(q) => q.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_len.load(Ordering::Relaxed)
    }

    pub fn max_len(&self) -> usize {
        self.max_len.load(Ordering::Relaxed)
    }

    pub fn set_max_len(&self, max_len: usize) {
        self.max_len.store(max_len.max(1), Ordering::Relaxed);
    }

    /// Drops every queued element.
    pub fn flush(&self) {
        match self.inner.lock() {
            Ok(mut q) => q.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BoundedQueue;

    #[test]
    fn push_refused_at_capacity() {
        let q = BoundedQueue::new(2);
        assert!(q.try_push(1).is_ok());
        assert!(q.try_push(2).is_ok());
        assert_eq!(q.try_push(3), Err(3));
        assert!(q.is_full());
    }

    #[test]
    fn pop_preserves_fifo_order() {
        let q = BoundedQueue::new(4);
        for i in 0..4 {
            assert!(q.try_push(i).is_ok());
        }
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.peek_with(|v| *v), Some(2));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn flush_empties_queue() {
        let q = BoundedQueue::new(4);
        assert!(q.try_push(7).is_ok());
        q.flush();
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn raising_capacity_admits_more_items() {
        let q = BoundedQueue::new(1);
        assert!(q.try_push(1).is_ok());
        assert_eq!(q.try_push(2), Err(2));
        q.set_max_len(2);
        assert!(q.try_push(2).is_ok());
        assert_eq!(q.max_len(), 2);
    }
}
