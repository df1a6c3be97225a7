//! A lock-free, linearizable multi-producer multi-consumer FIFO queue.
//!
//! The queue is a singly linked list anchored by `head` and `tail`, where every
//! mutation is a compare-and-swap on a pointer-sized slot. Threads that find
//! the list half-updated help advance `tail` before retrying their own work.
//! Unlinked nodes are reclaimed through [`crossbeam_epoch`].
//!
//! ```
//! use casq::LockFreeQueue;
//!
//! let queue = LockFreeQueue::new();
//! queue.enqueue(1);
//! queue.enqueue(2);
//! assert_eq!(queue.peek(), Some(1));
//! assert_eq!(queue.dequeue(), Some(1));
//! assert_eq!(queue.dequeue(), Some(2));
//! assert_eq!(queue.dequeue(), None);
//! ```

#[cfg(not(target_has_atomic = "ptr"))]
compile_error!("casq requires compare-and-swap on pointer-sized values");

mod trace;

pub mod queue;
pub use queue::{IntoIter, LockFreeQueue};
