//! Bounded single-producer single-consumer task ring
//!
//! Cursor-reservation discipline: the producer claims a slot and
//! publishes; the consumer claims a cursor with [`Consumer::poll`], moves
//! the task out with [`Consumer::take`], and releases the slot with
//! [`Consumer::done`] BEFORE executing the task, so the producer can
//! reuse the slot while the copy runs.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Shared<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: u64,
    /// next cursor the producer will publish
    head: AtomicU64,
    /// next cursor the consumer will release
    tail: AtomicU64,
}

unsafe impl<T: Send> Sync for Shared<T> {}
unsafe impl<T: Send> Send for Shared<T> {}

/// Bounded SPSC ring of tasks
pub struct TaskRing;

impl TaskRing {
    /// Create a ring of the given power-of-two capacity
    pub fn new<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..capacity).map(|_| UnsafeCell::new(None)).collect::<Vec<_>>();
        let shared = Arc::new(Shared {
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        });
        (Producer { shared: Arc::clone(&shared) }, Consumer { shared })
    }
}

/// Producing half; owned by exactly one thread
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Producer<T> {
    /// Publish a task. Returns the task back when the ring is full.
    pub fn publish(&mut self, task: T) -> Result<(), T> {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        if head - tail > self.shared.mask {
            return Err(task);
        }
        let slot = &self.shared.slots[(head & self.shared.mask) as usize];
        unsafe { *slot.get() = Some(task) };
        self.shared.head.store(head + 1, Ordering::Release);
        Ok(())
    }
}

/// Consuming half; owned by exactly one thread
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Consumer<T> {
    /// Claim the next cursor, if one is published
    pub fn poll(&mut self) -> Option<u64> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        if self.shared.head.load(Ordering::Acquire) > tail {
            Some(tail)
        } else {
            None
        }
    }

    /// Move the task out of the claimed slot
    pub fn take(&mut self, cursor: u64) -> T {
        debug_assert_eq!(cursor, self.shared.tail.load(Ordering::Relaxed));
        let slot = &self.shared.slots[(cursor & self.shared.mask) as usize];
        unsafe { (*slot.get()).take() }.expect("cursor not published")
    }

    /// Release the slot for producer reuse
    pub fn done(&mut self, cursor: u64) {
        debug_assert_eq!(cursor, self.shared.tail.load(Ordering::Relaxed));
        self.shared.tail.store(cursor + 1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_take_done() {
        let (mut tx, mut rx) = TaskRing::new::<u32>(4);
        assert!(rx.poll().is_none());

        tx.publish(10).unwrap();
        tx.publish(11).unwrap();

        let c = rx.poll().unwrap();
        assert_eq!(rx.take(c), 10);
        rx.done(c);
        let c = rx.poll().unwrap();
        assert_eq!(rx.take(c), 11);
        rx.done(c);
        assert!(rx.poll().is_none());
    }

    #[test]
    fn test_backpressure_until_done() {
        let (mut tx, mut rx) = TaskRing::new::<u32>(2);
        tx.publish(1).unwrap();
        tx.publish(2).unwrap();
        assert_eq!(tx.publish(3), Err(3));

        // releasing the slot before executing frees the producer
        let c = rx.poll().unwrap();
        let task = rx.take(c);
        rx.done(c);
        assert_eq!(task, 1);
        tx.publish(3).unwrap();
    }

    #[test]
    fn test_cross_thread_drain() {
        let (mut tx, mut rx) = TaskRing::new::<u64>(64);
        let consumer = std::thread::spawn(move || {
            let mut sum = 0u64;
            let mut seen = 0;
            while seen < 1000 {
                if let Some(c) = rx.poll() {
                    let v = rx.take(c);
                    rx.done(c);
                    sum += v;
                    seen += 1;
                } else {
                    std::thread::yield_now();
                }
            }
            sum
        });
        for i in 0..1000u64 {
            loop {
                match tx.publish(i) {
                    Ok(()) => break,
                    Err(_) => std::thread::yield_now(),
                }
            }
        }
        assert_eq!(consumer.join().unwrap(), 499_500);
    }
}
