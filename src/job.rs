//! The job table.
//!
//! A fixed number of slots, allocated once at startup. Every field that the
//! signal handlers in [`crate::signals`] read or write is an atomic, so a
//! handler may interrupt the control thread anywhere without tearing a slot.
//! The command text is only ever touched by the control thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Mutex;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::{Result, ShellError};

/// Maximum number of bytes of command text kept per job.
pub const COMMAND_MAX: usize = 80;

/// Index of a slot in the job table.
///
/// Users see it 1-based, as `%1`, `%2`, ...
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub(crate) fn new(index: usize) -> Self {
        SlotId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }

    /// The 1-based id shown to users.
    pub fn job_id(self) -> usize {
        self.0 + 1
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.job_id())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Empty = 0,
    Foreground = 1,
    Background = 2,
    Stopped = 3,
}

impl JobState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => JobState::Foreground,
            2 => JobState::Background,
            3 => JobState::Stopped,
            _ => JobState::Empty,
        }
    }

    /// Status word printed by `jobs`.
    pub fn label(self) -> &'static str {
        match self {
            JobState::Foreground | JobState::Background => "Running",
            JobState::Stopped => "Stopped",
            JobState::Empty => "Unknown",
        }
    }

    pub fn is_live(self) -> bool {
        self != JobState::Empty
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobState::Empty => "not in use",
            JobState::Foreground => "running in the foreground",
            JobState::Background => "running in the background",
            JobState::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// How a reaped job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(Signal),
}

impl Termination {
    // Exit codes are 0..=255, so negative values are free to carry signals.
    fn encode(self) -> i32 {
        match self {
            Termination::Exited(code) => code & 0xff,
            Termination::Signaled(signal) => -(signal as i32),
        }
    }

    fn decode(raw: i32) -> Self {
        if raw >= 0 {
            Termination::Exited(raw)
        } else {
            Signal::try_from(-raw)
                .map(Termination::Signaled)
                .unwrap_or(Termination::Exited(raw))
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(0) => f.write_str("Done"),
            Termination::Exited(code) => write!(f, "Exit {}", code),
            Termination::Signaled(signal) => write!(f, "Terminated by {}", signal),
        }
    }
}

/// Command text stored inline so a slot never allocates.
#[derive(Clone, Copy)]
pub struct CommandText {
    buf: [u8; COMMAND_MAX],
    len: usize,
}

impl CommandText {
    const EMPTY: CommandText = CommandText {
        buf: [0; COMMAND_MAX],
        len: 0,
    };

    fn set(&mut self, text: &str) {
        let mut end = text.len().min(COMMAND_MAX);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        self.buf[..end].copy_from_slice(&text.as_bytes()[..end]);
        self.len = end;
    }

    pub fn as_str(&self) -> &str {
        // set() only ever cuts on a char boundary
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl fmt::Debug for CommandText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for CommandText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time copy of one slot.
#[derive(Clone, Copy, Debug)]
pub struct JobSlot {
    pub slot: SlotId,
    pub pid: Option<Pid>,
    pub state: JobState,
    pub pending_termination: bool,
    pub command: CommandText,
}

struct Slot {
    // 0 while the slot is empty
    pid: AtomicI32,
    state: AtomicU8,
    // Set by the SIGCHLD handler once the process is reaped. Only the
    // control thread clears it, in reset().
    pending_termination: AtomicBool,
    termination: AtomicI32,
    command: Mutex<CommandText>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            pid: AtomicI32::new(0),
            state: AtomicU8::new(JobState::Empty as u8),
            pending_termination: AtomicBool::new(false),
            termination: AtomicI32::new(0),
            command: Mutex::new(CommandText::EMPTY),
        }
    }

    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn command(&self) -> CommandText {
        match self.command.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_command(&self, text: &str) {
        let mut guard = match self.command.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.set(text);
    }
}

/// Fixed-capacity job table.
///
/// Methods marked signal-safe touch atomics only and may be called from a
/// signal handler. The rest lock the command text and belong to the control
/// thread.
pub struct JobTable {
    slots: Box<[Slot]>,
}

impl JobTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::new()).collect();
        JobTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn entry(&self, slot: SlotId) -> &Slot {
        &self.slots[slot.0]
    }

    /// Maps a 1-based job id back to its slot, if it is in range.
    pub fn slot_for_job_id(&self, job_id: usize) -> Option<SlotId> {
        (1..=self.capacity())
            .contains(&job_id)
            .then(|| SlotId(job_id - 1))
    }

    pub fn lowest_free(&self) -> Result<SlotId> {
        self.slots
            .iter()
            .position(|s| s.state() == JobState::Empty)
            .map(SlotId)
            .ok_or(ShellError::TableFull {
                capacity: self.capacity(),
            })
    }

    /// Picks the lowest empty slot and records the command text in it.
    ///
    /// The slot stays `Empty` until [`assign`](Self::assign) publishes a pid.
    pub fn allocate(&self, command: &str) -> Result<SlotId> {
        let slot = self.lowest_free()?;
        self.entry(slot).set_command(command);
        Ok(slot)
    }

    /// Publishes the pid of a freshly forked process. The pid is stored
    /// before the state, so anyone who sees a live state also sees the pid.
    pub fn assign(&self, slot: SlotId, pid: Pid, state: JobState) {
        let entry = self.entry(slot);
        entry.pending_termination.store(false, Ordering::SeqCst);
        entry.termination.store(0, Ordering::SeqCst);
        entry.pid.store(pid.as_raw(), Ordering::SeqCst);
        entry.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn get(&self, slot: SlotId) -> JobSlot {
        let entry = self.entry(slot);
        JobSlot {
            slot,
            pid: self.pid(slot),
            state: entry.state(),
            pending_termination: entry.pending_termination.load(Ordering::SeqCst),
            command: entry.command(),
        }
    }

    /// Signal-safe.
    pub fn state(&self, slot: SlotId) -> JobState {
        self.entry(slot).state()
    }

    /// Signal-safe.
    pub fn pid(&self, slot: SlotId) -> Option<Pid> {
        match self.entry(slot).pid.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    /// Signal-safe. Ignored for empty slots.
    pub fn set_state(&self, slot: SlotId, state: JobState) {
        let entry = self.entry(slot);
        if entry.state().is_live() && state.is_live() {
            entry.state.store(state as u8, Ordering::SeqCst);
        }
    }

    /// Signal-safe. Moves `slot` to `to` only if it is currently in `from`.
    pub fn transition(&self, slot: SlotId, from: JobState, to: JobState) -> bool {
        self.entry(slot)
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Signal-safe. Records that the process of `slot` has been reaped.
    pub fn mark_terminated(&self, slot: SlotId, termination: Termination) {
        let entry = self.entry(slot);
        entry
            .termination
            .store(termination.encode(), Ordering::SeqCst);
        entry.pending_termination.store(true, Ordering::SeqCst);
    }

    /// Signal-safe. `Some` once the process of `slot` has been reaped.
    pub fn termination(&self, slot: SlotId) -> Option<Termination> {
        let entry = self.entry(slot);
        entry
            .pending_termination
            .load(Ordering::SeqCst)
            .then(|| Termination::decode(entry.termination.load(Ordering::SeqCst)))
    }

    /// Returns `slot` to `Empty`. Refused while its process may still be
    /// alive.
    pub fn reset(&self, slot: SlotId) -> Result<Termination> {
        let termination = self
            .termination(slot)
            .ok_or(ShellError::StillRunning(slot))?;
        let entry = self.entry(slot);
        entry.state.store(JobState::Empty as u8, Ordering::SeqCst);
        entry.pid.store(0, Ordering::SeqCst);
        entry.termination.store(0, Ordering::SeqCst);
        entry.pending_termination.store(false, Ordering::SeqCst);
        entry.set_command("");
        Ok(termination)
    }

    /// Signal-safe. Finds the live, not yet reaped slot running `pid`.
    pub fn find_by_pid(&self, pid: Pid) -> Option<SlotId> {
        if pid.as_raw() <= 0 {
            return None;
        }
        self.slots
            .iter()
            .position(|s| {
                s.state().is_live()
                    && !s.pending_termination.load(Ordering::SeqCst)
                    && s.pid.load(Ordering::SeqCst) == pid.as_raw()
            })
            .map(SlotId)
    }

    /// Signal-safe.
    pub fn find_foreground(&self) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.state() == JobState::Foreground)
            .map(SlotId)
    }

    /// Live slots in slot order.
    pub fn live(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state().is_live())
            .map(|(i, _)| SlotId(i))
    }

    /// Live slots whose process has been reaped but not yet reset.
    pub fn reaped(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.live()
            .filter(move |&slot| self.termination(slot).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn allocate_picks_lowest_free_slot() {
        let table = JobTable::new(3);
        let a = table.allocate("sleep 1").unwrap();
        table.assign(a, pid(100), JobState::Background);
        let b = table.allocate("sleep 2").unwrap();
        table.assign(b, pid(101), JobState::Background);
        assert_eq!((a.index(), b.index()), (0, 1));

        table.mark_terminated(a, Termination::Exited(0));
        table.reset(a).unwrap();
        assert_eq!(table.allocate("sleep 3").unwrap().index(), 0);
    }

    #[test]
    fn allocate_fails_when_full() {
        let table = JobTable::new(2);
        for raw in [10, 11] {
            let slot = table.allocate("x").unwrap();
            table.assign(slot, pid(raw), JobState::Background);
        }
        assert!(matches!(
            table.allocate("x"),
            Err(ShellError::TableFull { capacity: 2 })
        ));
    }

    #[test]
    fn allocated_slot_stays_empty_until_assigned() {
        let table = JobTable::new(2);
        let slot = table.allocate("ls").unwrap();
        assert_eq!(table.state(slot), JobState::Empty);
        assert_eq!(table.pid(slot), None);
        assert_eq!(table.lowest_free().unwrap(), slot);
    }

    #[test]
    fn reset_refused_until_reaped() {
        let table = JobTable::new(1);
        let slot = table.allocate("sleep 100").unwrap();
        table.assign(slot, pid(42), JobState::Stopped);

        assert!(matches!(table.reset(slot), Err(ShellError::StillRunning(_))));
        assert_eq!(table.state(slot), JobState::Stopped);

        table.mark_terminated(slot, Termination::Signaled(Signal::SIGKILL));
        assert_eq!(
            table.reset(slot).unwrap(),
            Termination::Signaled(Signal::SIGKILL)
        );
        let view = table.get(slot);
        assert_eq!(view.state, JobState::Empty);
        assert_eq!(view.pid, None);
        assert!(!view.pending_termination);
        assert_eq!(view.command.as_str(), "");
    }

    #[test]
    fn find_by_pid_skips_reaped_and_empty_slots() {
        let table = JobTable::new(3);
        let a = table.allocate("a").unwrap();
        table.assign(a, pid(7), JobState::Background);
        let b = table.allocate("b").unwrap();
        table.assign(b, pid(8), JobState::Stopped);

        assert_eq!(table.find_by_pid(pid(8)), Some(b));
        assert_eq!(table.find_by_pid(pid(9)), None);
        assert_eq!(table.find_by_pid(pid(0)), None);

        table.mark_terminated(a, Termination::Exited(0));
        assert_eq!(table.find_by_pid(pid(7)), None);
        assert_eq!(table.reaped().collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn find_foreground() {
        let table = JobTable::new(3);
        assert_eq!(table.find_foreground(), None);
        let a = table.allocate("a").unwrap();
        table.assign(a, pid(7), JobState::Background);
        let b = table.allocate("b").unwrap();
        table.assign(b, pid(8), JobState::Foreground);
        assert_eq!(table.find_foreground(), Some(b));

        table.set_state(b, JobState::Stopped);
        assert_eq!(table.find_foreground(), None);
    }

    #[test]
    fn set_state_never_revives_an_empty_slot() {
        let table = JobTable::new(1);
        let slot = SlotId::new(0);
        table.set_state(slot, JobState::Stopped);
        assert_eq!(table.state(slot), JobState::Empty);
    }

    #[test]
    fn transition_only_from_expected_state() {
        let table = JobTable::new(1);
        let slot = table.allocate("a").unwrap();
        table.assign(slot, pid(3), JobState::Foreground);
        assert!(!table.transition(slot, JobState::Stopped, JobState::Background));
        assert_eq!(table.state(slot), JobState::Foreground);
        table.set_state(slot, JobState::Stopped);
        assert!(table.transition(slot, JobState::Stopped, JobState::Background));
        assert_eq!(table.state(slot), JobState::Background);
    }

    #[test]
    fn job_ids_round_trip() {
        let table = JobTable::new(5);
        for index in 0..5 {
            let slot = SlotId::new(index);
            assert_eq!(table.slot_for_job_id(slot.job_id()), Some(slot));
        }
        assert_eq!(table.slot_for_job_id(0), None);
        assert_eq!(table.slot_for_job_id(6), None);
        assert_eq!(SlotId::new(2).to_string(), "%3");
    }

    #[test]
    fn command_text_is_truncated_on_char_boundary() {
        let table = JobTable::new(1);
        let long = "é".repeat(COMMAND_MAX);
        let slot = table.allocate(&long).unwrap();
        let text = table.get(slot).command;
        assert!(text.as_str().len() <= COMMAND_MAX);
        assert!(text.as_str().chars().all(|c| c == 'é'));
    }

    #[test]
    fn termination_display() {
        assert_eq!(Termination::Exited(0).to_string(), "Done");
        assert_eq!(Termination::Exited(127).to_string(), "Exit 127");
        assert_eq!(
            Termination::Signaled(Signal::SIGKILL).to_string(),
            "Terminated by SIGKILL"
        );
    }

    #[test]
    fn termination_survives_the_atomic_encoding() {
        let table = JobTable::new(1);
        let slot = table.allocate("a").unwrap();
        table.assign(slot, pid(5), JobState::Background);
        assert_eq!(table.termination(slot), None);
        table.mark_terminated(slot, Termination::Signaled(Signal::SIGINT));
        assert_eq!(
            table.termination(slot),
            Some(Termination::Signaled(Signal::SIGINT))
        );
    }
}
