//! A queue with wait-free enqueue and blocking, single-consumer
//! dequeue.
//!
//! The queue is a singly-linked list whose `tail` is not a node pointer
//! but a pointer to the *slot* awaiting the next enqueue (the `next`
//! field of the last node). An enqueue is two steps: atomically swing
//! `tail` to the new node's own `next` slot, then store the node into
//! the slot that was swung away from. Any number of producers can race
//! through the exchange without waiting on each other; a consumer that
//! observes the window between the two steps simply waits for the
//! second store.
//!
//! A permanently allocated dummy node keeps the list non-empty so the
//! lockless enqueue never has to special-case an empty queue; the
//! consumer re-enqueues the dummy whenever it surfaces.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_utils::Backoff;
use portable_atomic::{AtomicPtr, Ordering};

/// Spins granted to a mid-flight enqueuer before the consumer starts
/// sleeping between polls.
const ADAPT_ATTEMPTS: usize = 10;

/// Sleep between polls once spinning is exhausted.
const LINK_WAIT: Duration = Duration::from_millis(10);

struct Node<T> {
	next: AtomicPtr<Node<T>>,
	/// `None` only for the dummy node.
	value: Option<T>,
}

/// Multi-producer, single-consumer queue: enqueue is wait-free, dequeue
/// blocks only on an enqueue caught between its two steps.
///
/// Concurrent dequeuers are excluded from each other by an internal
/// mutex; they do not affect the wait-freedom of producers.
///
/// # Example
///
/// ```rust
/// use quiesce::WfQueue;
///
/// let queue = WfQueue::new();
/// queue.enqueue(1);
/// queue.enqueue(2);
///
/// assert_eq!(queue.dequeue_blocking(), Some(1));
/// assert_eq!(queue.dequeue_blocking(), Some(2));
/// assert_eq!(queue.dequeue_blocking(), None);
/// ```
pub struct WfQueue<T: Send> {
	/// Consumer-owned; read and written only under `lock`.
	head: UnsafeCell<*mut Node<T>>,
	/// Address of the `next` slot the coming enqueue will fill.
	tail: AtomicPtr<AtomicPtr<Node<T>>>,
	dummy: NonNull<Node<T>>,
	lock: Mutex<()>,
}

unsafe impl<T: Send> Send for WfQueue<T> {}
unsafe impl<T: Send> Sync for WfQueue<T> {}

impl<T: Send> WfQueue<T> {
	/// Create an empty queue.
	#[must_use]
	pub fn new() -> Self {
		let dummy = Box::into_raw(Box::new(Node {
			next: AtomicPtr::new(ptr::null_mut()),
			value: None,
		}));

		Self {
			head: UnsafeCell::new(dummy),
			tail: AtomicPtr::new(
				unsafe { ptr::addr_of!((*dummy).next) }.cast_mut(),
			),
			dummy: unsafe { NonNull::new_unchecked(dummy) },
			lock: Mutex::new(()),
		}
	}

	/// Append `value`. Wait-free: a bounded number of own-thread steps
	/// regardless of what producers or the consumer are doing.
	pub fn enqueue(&self, value: T) {
		let node = Box::into_raw(Box::new(Node {
			next: AtomicPtr::new(ptr::null_mut()),
			value: Some(value),
		}));
		unsafe { self.enqueue_node(node) };
	}

	/// Link an initialized node (`next` already null) into the list.
	unsafe fn enqueue_node(&self, node: *mut Node<T>) {
		let slot = unsafe { ptr::addr_of!((*node).next) }.cast_mut();

		// The exchange's full barrier orders the node's initialization
		// before its publication below.
		let prev = self.tail.swap(slot, Ordering::SeqCst);

		// Until this store lands, a dequeuer sees the swung tail with a
		// null `*prev` and knows to wait.
		unsafe { (*prev).store(node, Ordering::Release) };
	}

	/// Remove the oldest value.
	///
	/// Returns `None` only if the queue was observably empty on entry,
	/// never spuriously. If the head node is still being linked by its
	/// producer, waits adaptively (a few spins, then 10 ms sleeps) for
	/// the link to complete.
	pub fn dequeue_blocking(&self) -> Option<T> {
		let _consumer = self.lock.lock().unwrap();
		let node = self.dequeue_node()?;
		let mut node = unsafe { Box::from_raw(node) };
		node.value.take()
	}

	/// Pop the head node, cycling the dummy back in if it surfaces.
	/// Caller holds `lock`.
	fn dequeue_node(&self) -> Option<*mut Node<T>> {
		loop {
			let head = unsafe { *self.head.get() };
			if head == self.dummy.as_ptr()
				&& self.tail.load(Ordering::Acquire) == self.dummy_slot()
			{
				return None;
			}

			// Non-empty, so either `head.next` is set or some producer
			// is between its exchange and its store.
			let backoff = Backoff::new();
			let mut attempts = 0;
			let next = loop {
				let next = unsafe { (*head).next.load(Ordering::Acquire) };
				if !next.is_null() {
					break next;
				}
				attempts += 1;
				if attempts >= ADAPT_ATTEMPTS {
					thread::sleep(LINK_WAIT);
					attempts = 0;
				} else {
					backoff.spin();
				}
			};

			unsafe { *self.head.get() = next };

			if head == self.dummy.as_ptr() {
				unsafe {
					(*head).next.store(ptr::null_mut(), Ordering::Relaxed);
					self.enqueue_node(head);
				}
				continue;
			}

			return Some(head);
		}
	}

	fn dummy_slot(&self) -> *mut AtomicPtr<Node<T>> {
		unsafe { ptr::addr_of!((*self.dummy.as_ptr()).next) }.cast_mut()
	}
}

impl<T: Send> Default for WfQueue<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Send> Drop for WfQueue<T> {
	fn drop(&mut self) {
		// Exclusive access: every node, dummy included, is reachable
		// from head exactly once.
		let mut cur = *self.head.get_mut();
		while !cur.is_null() {
			let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
			drop(unsafe { Box::from_raw(cur) });
			cur = next;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use core::sync::atomic::AtomicUsize;
	use std::collections::HashMap;
	use std::sync::Arc;
	use std::thread::scope;

	#[test]
	fn empty_queue_returns_none() {
		let queue = WfQueue::<u32>::new();
		assert_eq!(queue.dequeue_blocking(), None);
		assert_eq!(queue.dequeue_blocking(), None);
	}

	#[test]
	fn enqueue_after_empty_is_dequeued() {
		let queue = WfQueue::new();
		assert_eq!(queue.dequeue_blocking(), None);

		queue.enqueue(42);
		assert_eq!(queue.dequeue_blocking(), Some(42));
		assert_eq!(queue.dequeue_blocking(), None);
	}

	#[test]
	fn dummy_cycles_through_empty_transitions() {
		let queue = WfQueue::new();

		for round in 0..5 {
			queue.enqueue(round);
			assert_eq!(queue.dequeue_blocking(), Some(round));
			assert_eq!(queue.dequeue_blocking(), None);
		}
	}

	#[test]
	fn single_producer_is_fifo() {
		let queue = WfQueue::new();

		for i in 0..100 {
			queue.enqueue(i);
		}
		for i in 0..100 {
			assert_eq!(queue.dequeue_blocking(), Some(i));
		}
		assert_eq!(queue.dequeue_blocking(), None);
	}

	#[test]
	fn mpsc_loses_nothing_and_keeps_producer_order() {
		const PRODUCERS: usize = 4;
		const PER_PRODUCER: usize = 250;

		let queue = WfQueue::new();

		scope(|s| {
			for id in 0..PRODUCERS {
				let queue = &queue;
				s.spawn(move || {
					for seq in 0..PER_PRODUCER {
						queue.enqueue((id, seq));
					}
				});
			}

			s.spawn(|| {
				let mut last_seq: HashMap<usize, usize> = HashMap::new();
				let mut received = 0;

				while received < PRODUCERS * PER_PRODUCER {
					let Some((id, seq)) = queue.dequeue_blocking() else {
						std::thread::yield_now();
						continue;
					};
					received += 1;

					// Within one producer, sequence numbers must come
					// out in enqueue order.
					match last_seq.insert(id, seq) {
						None => assert_eq!(seq, 0),
						Some(prev) => assert_eq!(seq, prev + 1),
					}
				}

				for id in 0..PRODUCERS {
					assert_eq!(last_seq[&id], PER_PRODUCER - 1);
				}
				assert_eq!(queue.dequeue_blocking(), None);
			});
		});
	}

	#[test]
	fn drop_frees_undelivered_values() {
		struct DropCounter(Arc<AtomicUsize>);

		impl Drop for DropCounter {
			fn drop(&mut self) {
				self.0.fetch_add(1, Ordering::Relaxed);
			}
		}

		let drops = Arc::new(AtomicUsize::new(0));
		let queue = WfQueue::new();

		for _ in 0..10 {
			queue.enqueue(DropCounter(Arc::clone(&drops)));
		}
		drop(queue.dequeue_blocking());
		assert_eq!(drops.load(Ordering::Relaxed), 1);

		drop(queue);
		assert_eq!(drops.load(Ordering::Relaxed), 10);
	}
}
