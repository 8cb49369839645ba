//! Execution substrate - task ring and completion latch
//!
//! The merge engine consumes copy tasks from a bounded single-producer
//! single-consumer ring and reports partition completion through a
//! decrement-to-zero latch. Producers handle backpressure; the consumer
//! side never blocks on publication.

pub mod latch;
pub mod ring;

pub use latch::CountDownLatch;
pub use ring::{Consumer, Producer, TaskRing};
