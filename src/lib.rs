//! Userspace Read-Copy-Update: wait-free readers, grace-period deferred
//! reclamation. A better general explanation of RCU is available at the
//! [kernel docs](https://www.kernel.org/doc/html/latest/RCU/whatisRCU.html)
//! or even [Wikipedia](https://en.wikipedia.org/wiki/Read-copy-update).
//!
//! Readers here pay no lock, no compare-and-swap, not even a shared
//! counter increment: entering a read-side critical section is one load
//! and one store to the thread's own state block. The price is paid on
//! the write side. A writer replaces a pointer atomically, then waits
//! out a *grace period*: the interval after which every reader that
//! could have seen the old value has provably left its critical section
//! at least once. Only then is the old value destroyed. The wait is
//! driven by a global generation counter whose *phase bit* the writer
//! flips twice, draining after each flip the readers whose entry
//! snapshot still shows the previous phase.
//!
//! Reader threads must be [registered](Reader::register) before their
//! first critical section: registration gives the thread a state block
//! that writers poll while draining. Registration is the only moment a
//! reader ever takes a lock.
//!
//! By default every entry/exit of a critical section issues one full
//! memory fence so that writers can rely on plain polling. The `signal`
//! feature (unix only) removes even that: readers issue only a compiler
//! barrier, and a writer that needs the ordering interrupts every
//! registered reader with `SIGUSR1`, whose handler executes the fence on
//! the writer's behalf. Enable it when the read path is hot enough to
//! justify reserving a signal.
//!
//! Also included is [`WfQueue`], a wait-free multi-producer queue built
//! on the same publication discipline, usable as a reclamation conduit
//! between writers and a reclaiming thread.
//!
//! # Example
//!
//! ```rust
//! use std::thread;
//!
//! use quiesce::{RcuCell, Reader};
//!
//! #[derive(Debug, PartialEq, Eq)]
//! struct Config {
//! 	max_conns: u32,
//! }
//!
//! let config = RcuCell::new(Box::new(Config { max_conns: 16 }));
//!
//! thread::scope(|s| {
//! 	// Readers: traverse the current config with zero-cost entry.
//! 	for _ in 0..2 {
//! 		s.spawn(|| {
//! 			let reader = Reader::register();
//! 			for _ in 0..1000 {
//! 				let guard = reader.lock();
//! 				let config = config.dereference(&guard).unwrap();
//! 				assert!(config.max_conns >= 16);
//! 			}
//! 		});
//! 	}
//!
//! 	// Writer: publish a replacement, reclaiming the old config only
//! 	// after every reader that could hold it has moved on.
//! 	s.spawn(|| {
//! 		let old = config.publish(Some(Box::new(Config { max_conns: 64 })));
//! 		assert_eq!(old, Some(Box::new(Config { max_conns: 16 })));
//! 	});
//! });
//! ```
#![deny(missing_docs)]
#![warn(
	clippy::all,
	clippy::correctness,
	clippy::cargo,
	clippy::pedantic,
	clippy::perf,
	clippy::style
)]
#![allow(clippy::missing_panics_doc, clippy::module_name_repetitions)]

mod cfg;

mod barrier;
mod ptr;
mod rcu;
mod registry;
mod wfqueue;

cfg::cfg_signal! {
	mod signal;
}

#[doc(inline)]
pub use self::ptr::{RcuCell, Unlinked};

#[doc(inline)]
pub use self::rcu::{
	read_lock, read_unlock, register_thread, synchronize_rcu,
	unregister_thread, ReadGuard, Reader,
};

#[doc(inline)]
pub use self::wfqueue::WfQueue;
