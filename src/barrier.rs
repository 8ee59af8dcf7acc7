//! The memory-ordering vocabulary of the crate.
//!
//! Everything here compiles down to at most one hardware fence. The only
//! interesting member is [`reader_fence`]: it is the barrier placed inside
//! `read_lock`/`read_unlock`, and it is the thing the `signal` feature
//! removes from the reader fast path. With `signal` enabled it degrades to
//! a compiler barrier and the writer re-creates the ordering by
//! interrupting every reader (see the `signal` module).

use core::sync::atomic::{fence, Ordering};

/// Full hardware memory fence.
#[inline]
pub(crate) fn full_fence() {
	fence(Ordering::SeqCst);
}

/// Store-store fence, ordering prior stores before a subsequent
/// publication store.
#[inline]
pub(crate) fn write_fence() {
	fence(Ordering::Release);
}

crate::cfg::cfg_signal! {
	/// Compiler-only reordering barrier. No instruction is emitted.
	#[inline]
	pub(crate) fn compiler_barrier() {
		core::sync::atomic::compiler_fence(Ordering::SeqCst);
	}

	/// Fence that also commits the store to a cache-incoherent target's
	/// memory before an interrupt is sent. Indistinguishable from
	/// [`full_fence`] on the architectures Rust targets, but called out at
	/// the two points of the coercion protocol where the distinction
	/// exists.
	#[inline]
	pub(crate) fn cache_fence() {
		fence(Ordering::SeqCst);
	}
}

/// The barrier inside `read_lock`/`read_unlock`.
#[cfg(not(feature = "signal"))]
#[inline]
pub(crate) fn reader_fence() {
	full_fence();
}

/// The barrier inside `read_lock`/`read_unlock`.
///
/// Promoted to a real fence by the writer-driven signal protocol.
#[cfg(feature = "signal")]
#[inline]
pub(crate) fn reader_fence() {
	compiler_barrier();
}
