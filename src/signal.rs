//! Writer-driven fence coercion over POSIX signals.
//!
//! In signal mode the reader fast path contains no hardware fence, only a
//! compiler barrier. Whenever a writer needs the ordering that fence
//! would have provided, it borrows one from every reader: it raises the
//! reader's `need_fence` flag and interrupts the reader with
//! [`RCU_SIGNAL`]. The installed handler executes a full fence, clears
//! the flag between two fences, and returns. The writer keeps re-sending
//! until every flag clears, which tolerates kernels that lose or delay
//! signals.
//!
//! The signal is reserved for this crate's exclusive use while the
//! `signal` feature is enabled. The handler is async-signal-safe: it
//! touches nothing but fences and one flag in the interrupted thread's
//! own state block.

use core::ffi::c_void;
use core::mem;
use core::ptr;

use std::sync::Once;
use std::thread;
use std::time::Duration;

use portable_atomic::Ordering;

use crate::barrier::{cache_fence, full_fence};
use crate::registry::{self, ReaderState, Registry};

/// The signal borrowed for fence coercion.
pub(crate) const RCU_SIGNAL: libc::c_int = libc::SIGUSR1;

/// Re-send and sleep interval while waiting for a reader's handler to
/// acknowledge.
const ACK_POLL: Duration = Duration::from_millis(1);

static INSTALL: Once = Once::new();

/// Install the fence handler, once per process. Called from
/// registration, so the handler exists before any thread can be
/// signalled.
pub(crate) fn install_handler() {
    INSTALL.call_once(|| unsafe {
        let mut act: libc::sigaction = mem::zeroed();
        act.sa_sigaction = fence_handler
            as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)
            as usize;
        act.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut act.sa_mask);

        if libc::sigaction(RCU_SIGNAL, &act, ptr::null_mut()) != 0 {
            panic_sigaction();
        }
    });
}

/// Executing a fence is this handler's entire job: it promotes the
/// compiler barriers around the interrupted thread's `read_lock` /
/// `read_unlock` into real memory barriers, punctually.
extern "C" fn fence_handler(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut c_void,
) {
    full_fence();
    let state = registry::current();
    if !state.is_null() {
        unsafe { &*state }.need_fence.store(false, Ordering::SeqCst);
    }
    full_fence();
}

/// Borrow a fence from every registered reader. Caller holds the global
/// mutex (the registry is iterated twice).
pub(crate) fn force_fence_all(readers: &Registry) {
    if readers.is_empty() {
        return;
    }

    for entry in readers.iter() {
        let state = entry.state();
        state.need_fence.store(true, Ordering::SeqCst);
        // Commit the flag before the interrupt lands, even on targets
        // where delivery does not flush the cache.
        cache_fence();
        kill(state);
    }

    // Signals are normally delivered promptly and the resend below never
    // runs. Kernels have been observed to lose them; resending until the
    // handler acknowledges tolerates that.
    for entry in readers.iter() {
        let state = entry.state();
        while state.need_fence.load(Ordering::SeqCst) {
            kill(state);
            thread::sleep(ACK_POLL);
        }
    }

    full_fence();
}

/// Borrow a fence from a single laggard reader. Caller holds the global
/// mutex, same as [`force_fence_all`], even though only one reader is
/// targeted.
pub(crate) fn force_fence_single(state: &ReaderState) {
    state.need_fence.store(true, Ordering::SeqCst);
    cache_fence();
    kill(state);
    full_fence();

    while state.need_fence.load(Ordering::SeqCst) {
        thread::sleep(ACK_POLL);
    }
    full_fence();
}

fn kill(state: &ReaderState) {
    // ESRCH here means the reader exited without unregistering, which is
    // already undefined; nothing useful to do with the error.
    let _ = unsafe { libc::pthread_kill(state.tid, RCU_SIGNAL) };
}

#[cold]
#[inline(never)]
fn panic_sigaction() -> ! {
    panic!("failed to install the rcu fence signal handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    use portable_atomic::AtomicBool;
    use std::sync::Barrier;
    use std::thread::scope;

    use crate::{synchronize_rcu, Reader};

    // The coercion path is otherwise exercised by every grace-period
    // test when the crate is built with `--features signal`.

    #[test]
    fn handler_acknowledges_fence_requests() {
        let entered = Barrier::new(2);
        let stop = AtomicBool::new(false);

        scope(|s| {
            s.spawn(|| {
                let reader = Reader::register();
                entered.wait();
                while !stop.load(Ordering::Acquire) {
                    let guard = reader.lock();
                    std::hint::spin_loop();
                    drop(guard);
                }
            });

            entered.wait();
            // Each grace period raises and drains `need_fence` on the
            // reader at least twice.
            for _ in 0..10 {
                synchronize_rcu();
            }
            stop.store(true, Ordering::Release);
        });
    }
}
