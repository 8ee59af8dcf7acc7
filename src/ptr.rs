//! Publication of pointer-reachable values and their deferred
//! reclamation.
//!
//! An [`RcuCell`] is the writer's side of the bargain: a single atomic
//! pointer slot whose current value readers may borrow for the duration
//! of a read-side critical section. Replacing the value never touches
//! the readers; instead the *previous* value comes back as an
//! [`Unlinked`] handle that refuses to give up ownership until a grace
//! period has passed.

use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use portable_atomic::{AtomicPtr, Ordering};

use crate::barrier::write_fence;
use crate::rcu::{synchronize_rcu, ReadGuard};

/// An atomic pointer slot protected by grace periods.
///
/// Readers borrow the current value through [`dereference`] while inside
/// a read-side critical section. Writers install new values with
/// [`assign`], [`replace`] or [`publish`]; the slot may also be empty.
///
/// # Example
///
/// ```rust
/// use quiesce::{RcuCell, Reader};
///
/// let cell = RcuCell::new(Box::new(1u32));
/// let reader = Reader::register();
///
/// {
/// 	let guard = reader.lock();
/// 	assert_eq!(cell.dereference(&guard), Some(&1));
/// }
///
/// let old = cell.publish(Some(Box::new(2u32)));
/// assert_eq!(old.as_deref(), Some(&1));
/// ```
///
/// [`dereference`]: Self::dereference
/// [`assign`]: Self::assign
/// [`replace`]: Self::replace
/// [`publish`]: Self::publish
pub struct RcuCell<T: Send + Sync> {
	ptr: AtomicPtr<T>,
	_owns: PhantomData<Box<T>>,
}

impl<T: Send + Sync> RcuCell<T> {
	/// Create a slot holding `value`.
	pub fn new(value: Box<T>) -> Self {
		Self {
			ptr: AtomicPtr::new(Box::into_raw(value)),
			_owns: PhantomData,
		}
	}

	/// Create an empty slot.
	pub const fn empty() -> Self {
		Self { ptr: AtomicPtr::new(ptr::null_mut()), _owns: PhantomData }
	}

	/// Borrow the current value for the duration of the critical
	/// section witnessed by `guard`.
	///
	/// The borrow cannot outlive the guard, which is what makes it safe
	/// against concurrent [`publish`] calls: reclamation of the value
	/// waits for the guard to drop.
	///
	/// [`publish`]: Self::publish
	#[inline]
	pub fn dereference<'g>(
		&'g self,
		_guard: &'g ReadGuard<'_>,
	) -> Option<&'g T> {
		let ptr = self.ptr.load(Ordering::Acquire);
		if ptr.is_null() {
			None
		} else {
			Some(unsafe { &*ptr })
		}
	}

	/// The current value of the slot as a raw pointer, acquire-loaded.
	///
	/// For callers composing their own structures out of slots. The
	/// pointer may only be dereferenced inside a read-side critical
	/// section, or by the thread that can prove no writer is replacing
	/// the value.
	#[inline]
	pub fn load_ptr(&self) -> *mut T {
		self.ptr.load(Ordering::Acquire)
	}

	/// Publish `value`, making it and every store program-ordered
	/// before this call visible to any reader that observes the new
	/// pointer.
	///
	/// Meant for slots with no current value: a value already present
	/// is leaked, not reclaimed. Use [`replace`] or [`publish`] when
	/// the slot may be occupied.
	///
	/// [`replace`]: Self::replace
	/// [`publish`]: Self::publish
	pub fn assign(&self, value: Box<T>) {
		write_fence();
		self.ptr.store(Box::into_raw(value), Ordering::Release);
	}

	/// Atomically exchange the slot's value for `value` (or empty the
	/// slot), returning the previous value as an [`Unlinked`]
	/// reclamation handle.
	///
	/// The exchange is a full fence. Readers that already hold the old
	/// value keep reading it; the handle's owner decides when to wait
	/// them out.
	pub fn replace(&self, value: Option<Box<T>>) -> Option<Unlinked<T>> {
		let new = value.map_or(ptr::null_mut(), Box::into_raw);
		let old = self.ptr.swap(new, Ordering::SeqCst);
		NonNull::new(old).map(|ptr| Unlinked { ptr })
	}

	/// [`replace`], then wait one grace period.
	///
	/// The returned value is fully owned again: every reader that could
	/// have observed it has left its critical section. Blocks like
	/// [`synchronize_rcu`] and must not be called from inside a
	/// read-side critical section.
	///
	/// [`replace`]: Self::replace
	pub fn publish(&self, value: Option<Box<T>>) -> Option<Box<T>> {
		let old = self.replace(value);
		synchronize_rcu();
		old.map(|unlinked| unsafe { unlinked.take_unchecked() })
	}
}

impl<T: Send + Sync> Drop for RcuCell<T> {
	fn drop(&mut self) {
		let ptr = *self.ptr.get_mut();
		if !ptr.is_null() {
			drop(unsafe { Box::from_raw(ptr) });
		}
	}
}

/// A value unlinked from an [`RcuCell`] but possibly still observed by
/// readers that entered their critical section before the unlink.
///
/// Ownership is regained by waiting out those readers: [`take`] does so
/// and returns the value, and dropping the handle waits and frees in
/// place. Both block like [`synchronize_rcu`] and must not run inside a
/// read-side critical section.
///
/// [`take`]: Self::take
pub struct Unlinked<T: Send> {
	ptr: NonNull<T>,
}

// The handle is sole owner once the grace period has elapsed; sending it
// to another thread just moves who waits.
unsafe impl<T: Send> Send for Unlinked<T> {}

impl<T: Send> Unlinked<T> {
	/// Wait one grace period, then return the value.
	pub fn take(self) -> Box<T> {
		synchronize_rcu();
		unsafe { self.take_unchecked() }
	}

	/// Return the value without waiting.
	///
	/// # Safety
	///
	/// A grace period must have elapsed since the value was unlinked,
	/// by any means (for example a [`synchronize_rcu`] the caller
	/// already performed for a batch of unlinked values).
	pub unsafe fn take_unchecked(self) -> Box<T> {
		let ptr = self.ptr;
		mem::forget(self);
		unsafe { Box::from_raw(ptr.as_ptr()) }
	}
}

impl<T: Send> Drop for Unlinked<T> {
	fn drop(&mut self) {
		synchronize_rcu();
		drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
	}
}
