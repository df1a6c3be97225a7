use core::fmt;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::trace;

struct Node<T> {
    /// `None` only for the sentinel allocated by [`LockFreeQueue::new`].
    value: Option<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            value: None,
            next: Atomic::null(),
        }
    }

    fn new(value: T) -> Self {
        Self {
            value: Some(value),
            next: Atomic::null(),
        }
    }
}

/// An unbounded lock-free FIFO queue.
///
/// `head` always points at a sentinel whose value has already been consumed,
/// and the logical front of the queue is `head.next`. `tail` is reachable from
/// `head` and lags the last node by at most one link.
///
/// A node keeps its value until the node itself is reclaimed, so a thread that
/// read a node before it was unlinked may still look at the value. For that
/// reason [`dequeue`](Self::dequeue) and [`peek`](Self::peek) hand out clones.
pub struct LockFreeQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
}

impl<T> LockFreeQueue<T> {
    /// Creates an empty queue holding a single sentinel node.
    pub fn new() -> Self {
        // SAFETY: The queue is not shared yet.
        let sentinel = Owned::new(Node::sentinel()).into_shared(unsafe { epoch::unprotected() });
        trace::debug!("created queue");
        Self {
            head: Atomic::from(sentinel),
            tail: Atomic::from(sentinel),
        }
    }

    /// Appends `value` to the back of the queue.
    ///
    /// The operation is linearized at the CAS that links the new node.
    pub fn enqueue(&self, value: T) {
        let guard = &epoch::pin();
        let mut node = Owned::new(Node::new(value));

        let (tail, new) = loop {
            let tail = self.tail.load(Acquire, guard);
            // SAFETY: `tail` is never null and cannot be reclaimed while pinned.
            let t = unsafe { tail.deref() };
            let next = t.next.load(Acquire, guard);
            if tail != self.tail.load(Acquire, guard) {
                continue;
            }
            if !next.is_null() {
                self.help_tail(tail, next, guard);
                continue;
            }
            match t.next.compare_exchange(Shared::null(), node, AcqRel, Acquire, guard) {
                Ok(new) => break (tail, new),
                Err(e) => node = e.new,
            }
        };

        // Someone else may have already helped us.
        _ = self.tail.compare_exchange(tail, new, AcqRel, Acquire, guard);
    }

    /// Returns `true` if the queue holds no value at the moment of the call.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        self.front(guard).is_none()
    }

    /// Finds the logical first value, helping a lagging `tail` on the way.
    fn front<'g>(&self, guard: &'g Guard) -> Option<&'g T> {
        loop {
            let head = self.head.load(Acquire, guard);
            let tail = self.tail.load(Acquire, guard);
            // SAFETY: `head` is never null and cannot be reclaimed while pinned.
            let next = unsafe { head.deref() }.next.load(Acquire, guard);
            if head != self.head.load(Acquire, guard) {
                continue;
            }
            if head == tail {
                if next.is_null() {
                    return None;
                }
                self.help_tail(tail, next, guard);
                continue;
            }
            // SAFETY: `tail` is ahead of `head`, hence `next` is linked.
            return unsafe { next.deref() }.value.as_ref();
        }
    }

    fn help_tail<'g>(
        &self,
        tail: Shared<'g, Node<T>>,
        next: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) {
        if self
            .tail
            .compare_exchange(tail, next, AcqRel, Acquire, guard)
            .is_ok()
        {
            trace::trace!("helped a lagging tail forward");
        }
    }

    /// Detaches the first value without any synchronization.
    fn pop_exclusive(&mut self) -> Option<T> {
        // SAFETY: `&mut self` rules out concurrent access.
        unsafe {
            let guard = epoch::unprotected();
            let head = self.head.load(Relaxed, guard);
            let mut next = head.deref().next.load(Relaxed, guard);
            if next.is_null() {
                return None;
            }
            if self.tail.load(Relaxed, guard) == head {
                self.tail.store(next, Relaxed);
            }
            self.head.store(next, Relaxed);
            drop(head.into_owned());
            next.deref_mut().value.take()
        }
    }
}

impl<T: Clone> LockFreeQueue<T> {
    /// Removes the first value of the queue, or returns `None` if it is empty.
    ///
    /// The operation is linearized at the CAS that advances `head`.
    pub fn dequeue(&self) -> Option<T> {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Acquire, guard);
            let tail = self.tail.load(Acquire, guard);
            // SAFETY: `head` is never null and cannot be reclaimed while pinned.
            let next = unsafe { head.deref() }.next.load(Acquire, guard);
            if head != self.head.load(Acquire, guard) {
                continue;
            }
            if head == tail {
                if next.is_null() {
                    return None;
                }
                self.help_tail(tail, next, guard);
                continue;
            }
            if self
                .head
                .compare_exchange(head, next, AcqRel, Acquire, guard)
                .is_ok()
            {
                // SAFETY: `next` is the new sentinel, it outlives our pin.
                let value = unsafe { next.deref() }.value.clone();
                debug_assert!(value.is_some(), "sentinel linked behind head");
                // SAFETY: The old sentinel is unreachable from `head` now, and
                // only the winner of the CAS above retires it.
                unsafe { guard.defer_destroy(head) };
                return value;
            }
        }
    }

    /// Returns a copy of the first value without removing it.
    pub fn peek(&self) -> Option<T> {
        let guard = &epoch::pin();
        self.front(guard).cloned()
    }
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("LockFreeQueue { .. }")
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent access, and every node still
        // reachable from `head` is owned by the queue alone.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head.load(Relaxed, guard);
            while !node.is_null() {
                let next = node.deref().next.load(Relaxed, guard);
                drop(node.into_owned());
                node = next;
            }
        }
    }
}

impl<T> Extend<T> for LockFreeQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.enqueue(value);
        }
    }
}

impl<T> FromIterator<T> for LockFreeQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut queue = Self::new();
        queue.extend(iter);
        queue
    }
}

/// An owning iterator draining a [`LockFreeQueue`] from front to back.
pub struct IntoIter<T>(LockFreeQueue<T>);

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.0.pop_exclusive()
    }
}

impl<T> IntoIterator for LockFreeQueue<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter(self)
    }
}

impl<T> fmt::Debug for IntoIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("IntoIter { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn sequential_order() {
        let q = LockFreeQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn empty_queue() {
        let q = LockFreeQueue::<String>::new();
        assert!(q.is_empty());
        assert_eq!(q.peek(), None);
        assert_eq!(q.dequeue(), None);

        q.enqueue("x".to_owned());
        assert!(!q.is_empty());
        assert_eq!(q.dequeue().as_deref(), Some("x"));
        assert!(q.is_empty());
        assert_eq!(q.peek(), None);
    }

    #[test]
    fn peek_is_stable() {
        let q = LockFreeQueue::new();
        q.enqueue('a');
        q.enqueue('b');
        for _ in 0..16 {
            assert_eq!(q.peek(), Some('a'));
        }
        assert_eq!(q.dequeue(), Some('a'));
        assert_eq!(q.peek(), Some('b'));
        assert_eq!(q.peek(), Some('b'));
    }

    #[test]
    fn matches_vecdeque() {
        let q = LockFreeQueue::new();
        let mut model = VecDeque::new();
        for _ in 0..2000 {
            match fastrand::u8(0..3) {
                0 | 1 => {
                    let v = fastrand::u32(..);
                    q.enqueue(v);
                    model.push_back(v);
                },
                _ => assert_eq!(q.dequeue(), model.pop_front()),
            }
            assert_eq!(q.peek(), model.front().copied());
            assert_eq!(q.is_empty(), model.is_empty());
        }
    }

    #[test]
    fn drop_pending_values() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropCounter(#[allow(dead_code)] u32);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::Relaxed);
            }
        }

        let q = LockFreeQueue::new();
        for i in 0..37 {
            q.enqueue(DropCounter(i));
        }
        drop(q);
        assert_eq!(DROP_COUNT.load(Ordering::Relaxed), 37);
    }

    #[test]
    fn into_iter_drains_in_order() {
        let input = std::iter::repeat_with(fastrand::alphabetic)
            .take(30)
            .collect::<Vec<_>>();

        let q = input.iter().copied().collect::<LockFreeQueue<_>>();
        assert_eq!(q.dequeue(), input.first().copied());
        let rest = q.into_iter().collect::<Vec<_>>();
        assert_eq!(rest, input[1..]);
    }

    #[test]
    fn into_iter_then_drop() {
        // Values are moved out, so no `Clone` is needed here.
        struct Token(usize);

        let q = (0..8).map(Token).collect::<LockFreeQueue<_>>();
        let mut it = q.into_iter();
        assert_eq!(it.next().map(|t| t.0), Some(0));
        assert_eq!(it.next().map(|t| t.0), Some(1));
        drop(it);
    }

    #[test]
    fn concurrent_no_loss_no_dup() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 5000;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let q = LockFreeQueue::new();
        let taken = AtomicUsize::new(0);
        let mut out = std::thread::scope(|cx| {
            for p in 0..PRODUCERS {
                let q = &q;
                cx.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.enqueue(p * PER_PRODUCER + i);
                    }
                });
            }
            let consumers = (0..CONSUMERS)
                .map(|_| {
                    cx.spawn(|| {
                        let mut r = vec![];
                        while taken.load(Ordering::Acquire) < TOTAL {
                            if let Some(v) = q.dequeue() {
                                r.push(v);
                                taken.fetch_add(1, Ordering::AcqRel);
                            } else {
                                std::thread::yield_now();
                            }
                        }
                        r
                    })
                })
                .collect::<Vec<_>>();
            consumers
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        out.sort_unstable();
        assert_eq!(out, (0..TOTAL).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn per_producer_fifo() {
        const PRODUCERS: usize = 3;
        const PER_PRODUCER: usize = 4000;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let q = LockFreeQueue::new();
        let taken = AtomicUsize::new(0);
        std::thread::scope(|cx| {
            for p in 0..PRODUCERS {
                let q = &q;
                cx.spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        q.enqueue((p, seq));
                        if fastrand::u8(..) == 0 {
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..2 {
                cx.spawn(|| {
                    let mut last = [None::<usize>; PRODUCERS];
                    while taken.load(Ordering::Acquire) < TOTAL {
                        let Some((p, seq)) = q.dequeue() else {
                            std::thread::yield_now();
                            continue;
                        };
                        taken.fetch_add(1, Ordering::AcqRel);
                        if let Some(prev) = last[p] {
                            assert!(prev < seq, "producer {p}: {seq} after {prev}");
                        }
                        last[p] = Some(seq);
                    }
                });
            }
        });
    }

    #[test]
    fn peek_never_goes_backwards() {
        const COUNT: u64 = 20_000;

        let q = LockFreeQueue::new();
        let finished = AtomicBool::new(false);
        std::thread::scope(|cx| {
            cx.spawn(|| {
                for i in 0..COUNT {
                    q.enqueue(i);
                }
            });
            cx.spawn(|| {
                let mut n = 0;
                while n < COUNT {
                    if q.dequeue().is_some() {
                        n += 1;
                    }
                }
                finished.store(true, Ordering::Release);
            });
            cx.spawn(|| {
                let mut last = None;
                while !finished.load(Ordering::Acquire) {
                    let Some(v) = q.peek() else {
                        continue;
                    };
                    if let Some(prev) = last {
                        assert!(prev <= v, "peeked {v} after {prev}");
                    }
                    last = Some(v);
                }
            });
        });
        assert_eq!(q.peek(), None);
    }
}
