//! The grace-period state machine and the reader fast path.
//!
//! The global [`GP_CTR`] word carries two things at once: a *phase bit*
//! ([`GP_PHASE`]) flipped by writers, and a non-zero *nesting unit*
//! ([`GP_COUNT`]) in the low bits. Because the counter is never zero, an
//! outermost `read_lock` can make the reader visible *and* snapshot the
//! current phase with one plain store of the loaded counter. A writer
//! then proves every pre-existing reader has left by flipping the phase
//! twice, each time draining the readers whose snapshot still shows the
//! old phase. One flip is not enough: a reader entering between the flip
//! and the end of the drain could still be holding data unlinked before
//! the flip.

use core::marker::PhantomData;

use std::thread;
use std::time::Duration;

use crossbeam_utils::Backoff;
use log::{debug, trace};
use portable_atomic::{AtomicUsize, Ordering};

use crate::barrier::{full_fence, reader_fence};
use crate::registry::{self, ReaderState, Registry};

/// Nesting unit of a reader's `nesting` word. [`GP_CTR`] always carries
/// one of these so that copying it yields a non-zero nesting.
pub(crate) const GP_COUNT: usize = 1;

/// The phase (parity) bit of [`GP_CTR`], in the middle of the word so
/// nesting depth can never carry into it.
pub(crate) const GP_PHASE: usize = 1 << (usize::BITS / 2);

/// Mask selecting the nesting depth of a reader's `nesting` word.
pub(crate) const NEST_MASK: usize = GP_PHASE - 1;

/// Iterations of the drain loop after which a non-responsive reader gets
/// a fence forced onto it (signal mode).
#[cfg(feature = "signal")]
const KICK_READER_LOOPS: u32 = 10_000;

/// Sleep between drain-loop polls once spinning stops paying off.
const GP_POLL: Duration = Duration::from_millis(1);

/// Global grace-period counter. Written only by a writer holding the
/// global mutex; read by everybody.
static GP_CTR: AtomicUsize = AtomicUsize::new(GP_COUNT);

/// Register the current thread as an rcu reader.
///
/// Must precede any use of [`read_lock`] on this thread. Registration
/// while already registered is a contract violation and panics. Prefer
/// the RAII [`Reader`] token, which also unregisters on scope exit.
pub fn register_thread() {
	if !registry::current().is_null() {
		panic_already_registered();
	}

	#[cfg(feature = "signal")]
	crate::signal::install_handler();

	let state = registry::install_current();
	registry::lock().add(state);
	debug!("registered rcu reader thread");
}

/// Unregister the current thread.
///
/// The thread must be registered and outside any read-side critical
/// section; anything else is a contract violation and panics.
pub fn unregister_thread() {
	let state = registry::current();
	if state.is_null() {
		panic_unregistered();
	}
	if unsafe { &*state }.nesting.load(Ordering::Relaxed) & NEST_MASK != 0 {
		panic_unregister_in_critical_section();
	}

	registry::lock().remove(state);
	// No writer can hold a reference past this point: grace periods keep
	// the mutex for their whole duration.
	unsafe { registry::retire_current(state) };
	debug!("unregistered rcu reader thread");
}

/// Enter a read-side critical section.
///
/// Wait-free and signal-safe; never blocks, never fails. Sections nest
/// to arbitrary depth short of the counter width. The outermost entry
/// snapshots the current grace-period phase; nested entries only bump
/// the depth. The calling thread must be registered.
#[inline]
pub fn read_lock() {
	let state = current_reader();
	let nesting = state.nesting.load(Ordering::Relaxed);
	if nesting & NEST_MASK == 0 {
		// One store publishes both "inside a section" and the phase
		// snapshot, since the counter always carries GP_COUNT.
		state.nesting.store(GP_CTR.load(Ordering::Acquire), Ordering::Relaxed);
	} else {
		state.nesting.store(nesting + GP_COUNT, Ordering::Relaxed);
	}
	reader_fence();
}

/// Leave a read-side critical section.
///
/// Wait-free and signal-safe. Calling it with no matching [`read_lock`]
/// is a contract violation and panics.
#[inline]
pub fn read_unlock() {
	let state = current_reader();
	let nesting = state.nesting.load(Ordering::Relaxed);
	if nesting & NEST_MASK == 0 {
		panic_unmatched_unlock();
	}
	reader_fence();
	state.nesting.store(nesting - GP_COUNT, Ordering::Relaxed);
}

/// Wait until every read-side critical section that was live on entry
/// has been left at least once.
///
/// On return, no reader can still observe values unlinked before the
/// call. Writers are serialized against each other and against
/// registration. Blocks for as long as the slowest pre-existing reader
/// stays in its section; calling it from inside a read-side critical
/// section on the same thread therefore deadlocks.
///
/// # Example
///
/// ```rust
/// quiesce::synchronize_rcu();
/// ```
pub fn synchronize_rcu() {
	let readers = registry::lock();
	trace!("grace period: begin");

	// Order prior publication stores before the phase change becomes
	// observable to any reader.
	force_fence_all(&readers);

	flip_phase();
	full_fence();
	wait_for_quiescent(&readers);

	full_fence();

	flip_phase();
	full_fence();
	wait_for_quiescent(&readers);

	// Keep any speculative reader access from leaking past the
	// grace-period boundary into reclamation.
	force_fence_all(&readers);
	trace!("grace period: end");
}

/// Flip the phase bit. Caller holds the global mutex.
fn flip_phase() {
	let ctr = GP_CTR.load(Ordering::Relaxed);
	GP_CTR.store(ctr ^ GP_PHASE, Ordering::Release);
}

/// Whether `state` is inside a critical section entered under the
/// previous phase. Readers of the current phase are not waited for.
fn in_old_phase(state: &ReaderState) -> bool {
	let nesting = state.nesting.load(Ordering::Acquire);
	nesting & NEST_MASK != 0
		&& (nesting ^ GP_CTR.load(Ordering::Relaxed)) & GP_PHASE != 0
}

/// Drain every registered reader still in the previous phase. Caller
/// holds the global mutex.
fn wait_for_quiescent(readers: &Registry) {
	for entry in readers.iter() {
		let state = entry.state();
		let backoff = Backoff::new();

		#[cfg(feature = "signal")]
		let mut wait_loops: u32 = 0;

		while in_old_phase(state) {
			#[cfg(feature = "signal")]
			{
				wait_loops += 1;
				if wait_loops == KICK_READER_LOOPS {
					// The reader may simply not have committed its
					// nesting update to memory yet. Force it to.
					crate::signal::force_fence_single(state);
					wait_loops = 0;
					continue;
				}
			}

			if backoff.is_completed() {
				thread::sleep(GP_POLL);
			} else {
				backoff.spin();
			}
		}
	}
}

/// Make the reader-side compiler barriers count as real fences on every
/// registered reader. Caller holds the global mutex.
#[cfg(not(feature = "signal"))]
fn force_fence_all(_readers: &Registry) {
	// Readers fence on every lock/unlock in this mode; a local full
	// fence completes the pairing.
	full_fence();
}

#[cfg(feature = "signal")]
use crate::signal::force_fence_all;

#[inline]
fn current_reader() -> &'static ReaderState {
	let state = registry::current();
	if state.is_null() {
		panic_unregistered();
	}
	unsafe { &*state }
}

/// Registration token for a reader thread.
///
/// Created with [`Reader::register`], which registers the calling
/// thread; dropping it unregisters. The token is tied to its thread and
/// is neither [`Send`] nor [`Sync`].
///
/// # Example
///
/// ```rust
/// use quiesce::Reader;
///
/// let reader = Reader::register();
///
/// let outer = reader.lock();
/// let inner = reader.lock();
/// drop(inner);
/// drop(outer);
/// ```
pub struct Reader {
	_not_send: PhantomData<*mut ()>,
}

impl Reader {
	/// Register the current thread. See [`register_thread`] for the
	/// contract.
	#[must_use]
	pub fn register() -> Self {
		register_thread();
		Self { _not_send: PhantomData }
	}

	/// Enter a read-side critical section, leaving it when the returned
	/// guard drops. Guards nest.
	#[must_use]
	pub fn lock(&self) -> ReadGuard<'_> {
		read_lock();
		ReadGuard { _reader: PhantomData, _not_send: PhantomData }
	}
}

impl Drop for Reader {
	fn drop(&mut self) {
		unregister_thread();
	}
}

/// An active read-side critical section.
///
/// While a guard is live, values observed through
/// [`RcuCell::dereference`](crate::RcuCell::dereference) stay valid; any
/// borrow obtained from it cannot outlive the guard.
pub struct ReadGuard<'r> {
	_reader: PhantomData<&'r Reader>,
	_not_send: PhantomData<*mut ()>,
}

impl Drop for ReadGuard<'_> {
	fn drop(&mut self) {
		read_unlock();
	}
}

#[cold]
#[inline(never)]
fn panic_unregistered() -> ! {
	panic!("current thread is not registered as an rcu reader")
}

#[cold]
#[inline(never)]
fn panic_already_registered() -> ! {
	panic!("thread is already registered as an rcu reader")
}

#[cold]
#[inline(never)]
fn panic_unmatched_unlock() -> ! {
	panic!("read_unlock without a matching read_lock")
}

#[cold]
#[inline(never)]
fn panic_unregister_in_critical_section() -> ! {
	panic!("cannot unregister inside a read-side critical section")
}

#[cfg(test)]
pub(crate) fn read_depth() -> usize {
	let state = registry::current();
	assert!(!state.is_null(), "depth probe on unregistered thread");
	unsafe { &*state }.nesting.load(Ordering::Relaxed) & NEST_MASK
}

#[cfg(test)]
mod tests {
	use super::*;

	use core::sync::atomic::AtomicBool;
	use std::panic::{catch_unwind, AssertUnwindSafe};
	use std::sync::Barrier;
	use std::thread::{scope, sleep};

	const SETTLE: Duration = Duration::from_millis(100);

	#[test]
	fn nesting_restores_depth() {
		let reader = Reader::register();

		for n in 1usize..=5 {
			let guards: Vec<ReadGuard<'_>> =
				(0..n).map(|_| reader.lock()).collect();
			assert_eq!(read_depth(), n);
			drop(guards);
			assert_eq!(read_depth(), 0);
		}
	}

	#[test]
	fn synchronize_without_readers_returns() {
		synchronize_rcu();
	}

	#[test]
	fn synchronize_waits_for_outer_unlock() {
		let entered = Barrier::new(2);
		let outer_released = AtomicBool::new(false);

		scope(|s| {
			s.spawn(|| {
				let reader = Reader::register();
				let outer = reader.lock();
				let inner = reader.lock();
				assert_eq!(read_depth(), 2);

				entered.wait();
				sleep(SETTLE);

				drop(inner);
				assert_eq!(read_depth(), 1);
				sleep(SETTLE);

				outer_released.store(true, Ordering::Release);
				drop(outer);
			});

			entered.wait();
			synchronize_rcu();
			assert!(outer_released.load(Ordering::Acquire));
		});
	}

	#[test]
	fn grace_period_spans_both_phases() {
		// Both readers must be registered before the writer takes the
		// global mutex, or their registration would queue behind the
		// whole grace period.
		let ready = Barrier::new(3);
		let r2_in = AtomicBool::new(false);
		let r2_release = AtomicBool::new(false);
		let r2_out = AtomicBool::new(false);
		let writer_done = AtomicBool::new(false);

		let phase0 = GP_CTR.load(Ordering::Acquire) & GP_PHASE;

		scope(|s| {
			// R1 enters before the grace period begins.
			s.spawn(|| {
				let reader = Reader::register();
				let guard = reader.lock();
				ready.wait();

				// Hold until R2 has entered under the flipped phase,
				// so the window between the two flips stays open.
				while !r2_in.load(Ordering::Acquire) {
					std::hint::spin_loop();
				}
				drop(guard);
			});

			// R2 enters only after the writer's first flip.
			s.spawn(|| {
				let reader = Reader::register();
				ready.wait();
				while GP_CTR.load(Ordering::Acquire) & GP_PHASE == phase0 {
					std::hint::spin_loop();
				}
				let guard = reader.lock();
				r2_in.store(true, Ordering::Release);

				while !r2_release.load(Ordering::Acquire) {
					std::hint::spin_loop();
				}
				r2_out.store(true, Ordering::Release);
				drop(guard);
			});

			ready.wait();
			s.spawn(|| {
				synchronize_rcu();
				writer_done.store(true, Ordering::Release);
			});

			// R1 left, R2 still in: the writer must be parked in its
			// second drain, not finished.
			while !r2_in.load(Ordering::Acquire) {
				std::hint::spin_loop();
			}
			sleep(SETTLE);
			assert!(!writer_done.load(Ordering::Acquire));

			r2_release.store(true, Ordering::Release);
		});

		assert!(writer_done.load(Ordering::Acquire));
		assert!(r2_out.load(Ordering::Acquire));
	}

	#[test]
	fn drains_more_readers_than_initial_capacity() {
		const READERS: usize = 5;

		let entered = Barrier::new(READERS + 1);
		let done = AtomicUsize::new(0);

		scope(|s| {
			for _ in 0..READERS {
				s.spawn(|| {
					let reader = Reader::register();
					let guard = reader.lock();
					entered.wait();
					sleep(SETTLE);
					done.fetch_add(1, Ordering::Release);
					drop(guard);
				});
			}

			entered.wait();
			synchronize_rcu();
			assert_eq!(done.load(Ordering::Acquire), READERS);
		});
	}

	#[test]
	fn churning_readers_do_not_stall_writers() {
		let stop = AtomicBool::new(false);

		scope(|s| {
			for _ in 0..2 {
				s.spawn(|| {
					let reader = Reader::register();
					while !stop.load(Ordering::Acquire) {
						let guard = reader.lock();
						std::hint::spin_loop();
						drop(guard);
					}
				});
			}

			for _ in 0..50 {
				synchronize_rcu();
			}
			stop.store(true, Ordering::Release);
		});
	}

	#[test]
	fn contract_violations_panic() {
		// All on one unregistered thread, cleaned up as we go so the
		// shared registry stays consistent for the other tests.
		let err = catch_unwind(read_lock).unwrap_err();
		let msg = err.downcast_ref::<&str>().unwrap();
		assert!(msg.contains("not registered"));

		register_thread();

		let err = catch_unwind(register_thread).unwrap_err();
		let msg = err.downcast_ref::<&str>().unwrap();
		assert!(msg.contains("already registered"));

		let err = catch_unwind(read_unlock).unwrap_err();
		let msg = err.downcast_ref::<&str>().unwrap();
		assert!(msg.contains("without a matching"));

		read_lock();
		let err =
			catch_unwind(AssertUnwindSafe(unregister_thread)).unwrap_err();
		let msg = err.downcast_ref::<&str>().unwrap();
		assert!(msg.contains("critical section"));
		read_unlock();

		unregister_thread();

		let err =
			catch_unwind(AssertUnwindSafe(unregister_thread)).unwrap_err();
		let msg = err.downcast_ref::<&str>().unwrap();
		assert!(msg.contains("not registered"));
	}
}
