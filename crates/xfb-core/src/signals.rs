//! Graceful shutdown for `ppoll`-driven loops.
//!
//! SIGHUP, SIGINT and SIGTERM are blocked for the whole process and only
//! unblocked atomically inside `ppoll`, through the mask returned by
//! [`ShutdownSignals::install`]. A request that is being handled therefore
//! always completes before the loop notices the termination flag.
//!
//! SIGPIPE stays blocked: a write to a vanished peer returns `EPIPE` instead.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

const TERMINATING: [Signal; 3] = [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM];

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signo: i32) {
    TERMINATE.store(true, Ordering::Release);
}

/// Installed shutdown handlers.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownSignals {
    poll_mask: SigSet,
}

impl ShutdownSignals {
    /// Blocks the shutdown signals and SIGPIPE in the calling thread and
    /// installs the handler. Call from `main` before spawning threads, so they
    /// inherit the mask.
    pub fn install() -> nix::Result<Self> {
        let mut mask = SigSet::empty();
        for sig in TERMINATING {
            mask.add(sig);
        }
        mask.add(Signal::SIGPIPE);
        let mut poll_mask = mask.thread_swap_mask(SigmaskHow::SIG_BLOCK)?;
        for sig in TERMINATING {
            poll_mask.remove(sig);
        }
        // The previous mask may not have blocked SIGPIPE.
        poll_mask.add(Signal::SIGPIPE);

        let action = SigAction::new(
            SigHandler::Handler(on_terminate),
            SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        for sig in TERMINATING {
            // SAFETY: on_terminate only stores to an atomic, which is
            // async-signal-safe, and no other handler is expected for these.
            unsafe { signal::sigaction(sig, &action)? };
        }
        Ok(Self { poll_mask })
    }

    /// The mask to pass to `ppoll`: the shutdown signals are deliverable,
    /// SIGPIPE is not.
    pub fn poll_mask(&self) -> SigSet {
        self.poll_mask
    }

    /// Flag set once a shutdown signal was delivered.
    pub fn flag(&self) -> &'static AtomicBool {
        &TERMINATE
    }
}
