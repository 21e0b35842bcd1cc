//! Relays SIGCHLD, SIGINT and SIGTSTP into the job table.
//!
//! Handlers only read and write the table's atomic fields and send signals.
//! Anything compound (resetting slots, printing) happens on the control
//! thread, inside a [`SignalMask`] section.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use libc::c_int;
use nix::sys::signal::{
    kill, sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{Result, ShellError};
use crate::job::{JobState, JobTable, Termination};

/// Signals that are relayed to jobs. These are blocked whenever the control
/// thread mutates the job table.
pub const RELAYED: [Signal; 3] = [Signal::SIGCHLD, Signal::SIGINT, Signal::SIGTSTP];

static TABLE: AtomicPtr<JobTable> = AtomicPtr::new(ptr::null_mut());

fn table() -> Option<&'static JobTable> {
    // SAFETY: only ever set from a &'static JobTable in install()
    unsafe { TABLE.load(Ordering::SeqCst).as_ref() }
}

/// Points the handlers at `table` and installs them.
pub fn install(table: &'static JobTable) -> Result<()> {
    TABLE.store(table as *const JobTable as *mut JobTable, Ordering::SeqCst);

    let handlers: [(Signal, extern "C" fn(c_int)); 3] = [
        (Signal::SIGCHLD, on_child_state_change),
        (Signal::SIGINT, on_interrupt),
        (Signal::SIGTSTP, on_terminal_stop),
    ];
    for (signal, handler) in handlers {
        // each handler runs with the other relayed signals held off
        let action = SigAction::new(
            SigHandler::Handler(handler),
            SaFlags::SA_RESTART,
            relayed_set(),
        );
        // SAFETY: the handlers are async-signal-safe, see below
        unsafe { sigaction(signal, &action) }.map_err(ShellError::SignalHandler)?;
    }
    tracing::debug!(capacity = table.capacity(), "signal relay installed");
    Ok(())
}

/// Puts the relayed signals back to their default disposition. Called in a
/// forked child before it unblocks them.
///
/// SIGPIPE is included: the Rust runtime ignores it, and an ignored
/// disposition would survive exec.
pub fn restore_defaults() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in RELAYED.into_iter().chain([Signal::SIGPIPE]) {
        // SAFETY: SIG_DFL is always a valid disposition
        let _ = unsafe { sigaction(signal, &action) };
    }
}

fn relayed_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in RELAYED {
        set.add(signal);
    }
    set
}

/// Blocks the relayed signals for as long as it is alive.
///
/// This is the hand-off point between the handlers and the control thread:
/// while a `SignalMask` is held no handler runs, and [`suspend`](Self::suspend)
/// is the only place where pending ones are let through.
pub struct SignalMask {
    previous: SigSet,
}

impl SignalMask {
    pub fn block() -> Result<Self> {
        let mut previous = SigSet::empty();
        sigprocmask(
            SigmaskHow::SIG_BLOCK,
            Some(&relayed_set()),
            Some(&mut previous),
        )
        .map_err(ShellError::SignalMask)?;
        Ok(SignalMask { previous })
    }

    /// Sleeps until a signal handler has run, with the relayed signals
    /// unblocked only for the duration of the sleep.
    pub fn suspend(&self) {
        let mut during = self.previous;
        for signal in RELAYED {
            during.remove(signal);
        }
        // SAFETY: `during` is a fully initialised sigset_t.
        // sigsuspend always returns -1/EINTR once a handler ran.
        unsafe {
            libc::sigsuspend(during.as_ref());
        }
    }

    /// Reinstates the mask that was in effect before [`block`](Self::block).
    /// Used by a forked child, which never runs this guard's destructor.
    pub fn restore(&self) {
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        self.restore();
    }
}

extern "C" fn on_child_state_change(_: c_int) {
    let _errno = SavedErrno::save();
    if let Some(table) = table() {
        drain_child_state_changes(table);
    }
}

extern "C" fn on_interrupt(_: c_int) {
    let _errno = SavedErrno::save();
    let Some(table) = table() else { return };
    if let Some(pid) = table.find_foreground().and_then(|slot| table.pid(slot)) {
        let _ = kill(pid, Signal::SIGINT);
    }
}

extern "C" fn on_terminal_stop(_: c_int) {
    let _errno = SavedErrno::save();
    let Some(table) = table() else { return };
    let Some(slot) = table.find_foreground() else {
        return;
    };
    if let Some(pid) = table.pid(slot) {
        table.set_state(slot, JobState::Stopped);
        let _ = kill(pid, Signal::SIGTSTP);
    }
}

/// Collects every pending child state change without blocking.
///
/// Exited and killed children are reaped and flagged, never reset here; the
/// slot is reclaimed later by the control thread.
pub fn drain_child_state_changes(table: &JobTable) {
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    loop {
        match waitpid(Pid::from_raw(-1), Some(flags)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                if let Some(slot) = table.find_by_pid(pid) {
                    table.mark_terminated(slot, Termination::Exited(code));
                }
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                if let Some(slot) = table.find_by_pid(pid) {
                    table.mark_terminated(slot, Termination::Signaled(signal));
                }
            }
            Ok(WaitStatus::Stopped(pid, _)) => {
                if let Some(slot) = table.find_by_pid(pid) {
                    table.set_state(slot, JobState::Stopped);
                }
            }
            Ok(WaitStatus::Continued(pid)) => {
                if let Some(slot) = table.find_by_pid(pid) {
                    table.transition(slot, JobState::Stopped, JobState::Background);
                }
            }
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

/// Keeps a handler from clobbering the errno of the code it interrupted.
struct SavedErrno(c_int);

impl SavedErrno {
    fn save() -> Self {
        // SAFETY: errno_location() points at this thread's errno
        SavedErrno(unsafe { *errno_location() })
    }
}

impl Drop for SavedErrno {
    fn drop(&mut self) {
        // SAFETY: as above
        unsafe { *errno_location() = self.0 }
    }
}

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}
