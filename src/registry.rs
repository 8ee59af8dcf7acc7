//! Bookkeeping of registered reader threads.
//!
//! Every registered reader owns a heap-allocated [`ReaderState`] whose
//! address stays valid for the whole registered lifetime. The thread
//! reaches its own state through a thread-local handle; writers reach all
//! of them through the process-wide [`Registry`], a flat vector guarded by
//! the global mutex. The same mutex excludes concurrent writers from each
//! other, so holding it across a whole grace period gives the writer a
//! consistent snapshot of the reader population.

use core::cell::Cell;
use core::ptr::{self, NonNull};

use std::sync::{Mutex, MutexGuard};

use crossbeam_utils::CachePadded;
use portable_atomic::{AtomicBool, AtomicUsize};

/// Capacity reserved by the first registration. Growth doubles from here
/// and the vector is never shrunk; stale capacity is reused by later
/// registrations.
const INIT_READERS: usize = 4;

/// Per-thread reader state, heap-allocated at registration.
///
/// `nesting` is the whole read-side protocol: zero means the thread is
/// outside any critical section, the low bits count nesting depth and the
/// phase bit holds the grace-period parity snapshot taken at outermost
/// entry.
pub(crate) struct ReaderState {
	pub(crate) nesting: CachePadded<AtomicUsize>,
	/// Set by a writer to request a fence, cleared by this thread's
	/// signal handler once the fence has executed.
	#[cfg_attr(not(feature = "signal"), allow(dead_code))]
	pub(crate) need_fence: AtomicBool,
	#[cfg(feature = "signal")]
	pub(crate) tid: libc::pthread_t,
}

impl ReaderState {
	fn new() -> Self {
		Self {
			nesting: CachePadded::new(AtomicUsize::new(0)),
			need_fence: AtomicBool::new(false),
			#[cfg(feature = "signal")]
			tid: unsafe { libc::pthread_self() },
		}
	}
}

thread_local! {
	/// Handle to this thread's [`ReaderState`]. Null while unregistered.
	static READER_STATE: Cell<*const ReaderState> = const { Cell::new(ptr::null()) };
}

/// This thread's state block, or null if the thread is not registered.
///
/// Also reached from the signal handler, so it must stay callable while
/// the thread's locals are being torn down.
#[inline]
pub(crate) fn current() -> *const ReaderState {
	READER_STATE.try_with(Cell::get).unwrap_or(ptr::null())
}

/// Allocate a state block for the calling thread and point the
/// thread-local handle at it. Must only be called while unregistered.
pub(crate) fn install_current() -> NonNull<ReaderState> {
	let state = NonNull::from(Box::leak(Box::new(ReaderState::new())));
	READER_STATE.with(|cell| cell.set(state.as_ptr()));
	state
}

/// Clear the thread-local handle and free the state block. Must only be
/// called after the block has been removed from the registry.
pub(crate) unsafe fn retire_current(state: *const ReaderState) {
	READER_STATE.with(|cell| cell.set(ptr::null()));
	drop(unsafe { Box::from_raw(state.cast_mut()) });
}

/// Registry slot. Holds a borrowed pointer into the owning thread's state
/// block; the owning thread only frees that block after removing the slot
/// under the global mutex.
pub(crate) struct ReaderEntry(NonNull<ReaderState>);

// The entries are only ever dereferenced while the registry mutex is
// held, which is what keeps the pointed-to blocks alive.
unsafe impl Send for ReaderEntry {}

impl ReaderEntry {
	#[inline]
	pub(crate) fn state(&self) -> &ReaderState {
		unsafe { self.0.as_ref() }
	}
}

/// The process-wide table of registered readers.
pub(crate) struct Registry {
	entries: Vec<ReaderEntry>,
}

impl Registry {
	const fn new() -> Self {
		Self { entries: Vec::new() }
	}

	pub(crate) fn add(&mut self, state: NonNull<ReaderState>) {
		if self.entries.capacity() == 0 {
			self.entries.reserve(INIT_READERS);
		}
		self.entries.push(ReaderEntry(state));
	}

	/// Remove the entry for `state`, order-independently (swap with the
	/// last slot). The thread forgot to register if it is missing.
	pub(crate) fn remove(&mut self, state: *const ReaderState) {
		match self.entries.iter().position(|e| e.0.as_ptr().cast_const() == state) {
			Some(at) => {
				self.entries.swap_remove(at);
			},
			None => panic_not_registered(),
		}
	}

	#[cfg_attr(not(feature = "signal"), allow(dead_code))]
	pub(crate) fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub(crate) fn iter(&self) -> impl Iterator<Item = &ReaderEntry> {
		self.entries.iter()
	}
}

static READERS: Mutex<Registry> = Mutex::new(Registry::new());

/// Acquire the global mutex.
///
/// A poisoned mutex means a writer panicked in the middle of a grace
/// period; no recovery is possible from that.
#[cfg(not(feature = "signal"))]
pub(crate) fn lock() -> MutexGuard<'static, Registry> {
	READERS.lock().expect("grace-period mutex poisoned")
}

/// Acquire the global mutex.
///
/// In signal mode the current lock holder may be a writer waiting for
/// *this* thread to acknowledge a fence request, so blocking outright can
/// deadlock on kernels that lose or delay signals. Spin on `try_lock`
/// instead, servicing any pending fence request between attempts.
#[cfg(feature = "signal")]
pub(crate) fn lock() -> MutexGuard<'static, Registry> {
	use std::sync::TryLockError;
	use std::time::Duration;

	const LOCK_RETRY: Duration = Duration::from_millis(10);

	loop {
		match READERS.try_lock() {
			Ok(guard) => return guard,
			Err(TryLockError::WouldBlock) => {
				service_pending_fence();
				std::thread::sleep(LOCK_RETRY);
			},
			Err(TryLockError::Poisoned(_)) => {
				panic!("grace-period mutex poisoned")
			},
		}
	}
}

crate::cfg::cfg_signal! {
	/// Execute a fence on behalf of a writer that asked for one, exactly
	/// as the signal handler would.
	pub(crate) fn service_pending_fence() {
		use portable_atomic::Ordering;

		use crate::barrier::full_fence;

		let state = current();
		if state.is_null() {
			return;
		}
		let state = unsafe { &*state };
		if state.need_fence.load(Ordering::SeqCst) {
			full_fence();
			state.need_fence.store(false, Ordering::SeqCst);
			full_fence();
		}
	}
}

#[cold]
#[inline(never)]
fn panic_not_registered() -> ! {
	panic!("thread is not registered as an rcu reader")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dangling() -> NonNull<ReaderState> {
		NonNull::dangling()
	}

	#[test]
	fn add_then_remove() {
		let mut registry = Registry::new();
		let a = dangling();
		registry.add(a);
		assert!(!registry.is_empty());
		registry.remove(a.as_ptr());
		assert!(registry.is_empty());
	}

	#[test]
	fn remove_swaps_with_last() {
		// Three distinct (never dereferenced) addresses.
		let blocks: Vec<Box<u8>> = (0..3).map(|_| Box::new(0)).collect();
		let ptrs: Vec<NonNull<ReaderState>> = blocks
			.iter()
			.map(|b| NonNull::from(&**b).cast::<ReaderState>())
			.collect();

		let mut registry = Registry::new();
		for &p in &ptrs {
			registry.add(p);
		}

		registry.remove(ptrs[0].as_ptr());
		let left: Vec<*const ReaderState> =
			registry.iter().map(|e| e.0.as_ptr().cast_const()).collect();
		assert_eq!(left, vec![
			ptrs[2].as_ptr().cast_const(),
			ptrs[1].as_ptr().cast_const()
		]);
	}

	#[test]
	fn capacity_doubles_past_initial() {
		let blocks: Vec<Box<u8>> = (0..5).map(|_| Box::new(0)).collect();
		let mut registry = Registry::new();
		for b in &blocks {
			registry.add(NonNull::from(&**b).cast::<ReaderState>());
		}
		assert_eq!(registry.iter().count(), 5);
		assert!(registry.entries.capacity() >= 2 * INIT_READERS);
	}

	#[test]
	#[should_panic(expected = "not registered")]
	fn remove_of_unknown_thread_panics() {
		let mut registry = Registry::new();
		registry.remove(dangling().as_ptr());
	}
}
