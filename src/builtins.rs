use std::env;
use std::fmt;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::ShellConfig;
use crate::error::{Result, ShellError};
use crate::executor::Launcher;
use crate::job::{CommandText, JobSlot, JobState, JobTable, SlotId, Termination};
use crate::parser::{ExternalCommand, JobTarget};
use crate::signals::SignalMask;

fn expand_cd_arg(s: &str) -> PathBuf {
    let home = || env::var("HOME").unwrap_or_else(|_| "/".to_string());
    if s == "~" {
        return PathBuf::from(home());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        return PathBuf::from(home()).join(rest);
    }
    PathBuf::from(s)
}

/// One line of `jobs` output.
#[derive(Debug, Clone, Copy)]
pub struct JobRow {
    pub slot: SlotId,
    pub pid: Pid,
    pub state: JobState,
    pub command: CommandText,
}

impl fmt::Display for JobRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] ({}) {} {}",
            self.slot.job_id(),
            self.pid,
            self.state.label(),
            self.command
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Started,
    Stopped,
    Finished(Termination),
}

/// Something that happened to a job and may be worth telling the user.
#[derive(Debug, Clone, Copy)]
pub struct JobNotice {
    pub slot: SlotId,
    pub pid: Pid,
    pub command: CommandText,
    pub event: JobEvent,
}

impl JobNotice {
    /// `None` for a slot that never had a process.
    fn new(job: &JobSlot, event: JobEvent) -> Option<Self> {
        Some(JobNotice {
            slot: job.slot,
            pid: job.pid?,
            command: job.command,
            event,
        })
    }

    /// Whether a foreground job ending this way deserves a line. Normal
    /// exits and interrupts typed by the user do not.
    pub fn is_abnormal(&self) -> bool {
        match self.event {
            JobEvent::Started => false,
            JobEvent::Stopped => true,
            JobEvent::Finished(Termination::Signaled(signal)) => signal != Signal::SIGINT,
            JobEvent::Finished(Termination::Exited(_)) => false,
        }
    }
}

impl fmt::Display for JobNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.slot.job_id();
        match self.event {
            JobEvent::Started => write!(f, "[{}] {}", id, self.pid),
            JobEvent::Stopped => write!(f, "[{}] ({}) Stopped {}", id, self.pid, self.command),
            JobEvent::Finished(termination) => {
                write!(f, "[{}] ({}) {} {}", id, self.pid, termination, self.command)
            }
        }
    }
}

/// The job-control builtins and the foreground wait.
///
/// Every method that touches the table blocks the relayed signals first, so
/// it sees and leaves each slot in a consistent state.
pub struct JobController {
    table: &'static JobTable,
    launcher: Launcher,
    notices: Vec<JobNotice>,
}

impl JobController {
    pub fn new(table: &'static JobTable, config: &ShellConfig) -> Self {
        JobController {
            table,
            launcher: Launcher::new(table, config.search_path.clone()),
            notices: Vec::new(),
        }
    }

    pub fn table(&self) -> &'static JobTable {
        self.table
    }

    /// Notices gathered since the last call, oldest first.
    pub fn take_notices(&mut self) -> Vec<JobNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn list(&self) -> Result<Vec<JobRow>> {
        let _mask = SignalMask::block()?;
        let rows = self
            .table
            .live()
            .map(|slot| self.table.get(slot))
            .filter_map(|job| {
                Some(JobRow {
                    slot: job.slot,
                    pid: job.pid?,
                    state: job.state,
                    command: job.command,
                })
            })
            .collect();
        Ok(rows)
    }

    pub fn change_directory(&self, path: &str) -> Result<()> {
        let target = expand_cd_arg(path);
        env::set_current_dir(&target).map_err(|source| ShellError::ChangeDirectory {
            path: target,
            source,
        })
    }

    /// `%k` must name a live slot in range; a bare number must be the pid
    /// of a live job.
    pub fn resolve_target(&self, target: &JobTarget) -> Result<SlotId> {
        let slot = match *target {
            JobTarget::JobId(id) => self
                .table
                .slot_for_job_id(id)
                .filter(|&slot| self.table.state(slot).is_live()),
            JobTarget::Pid(pid) => self.table.find_by_pid(pid),
        };
        slot.ok_or_else(|| {
            ShellError::InvalidJob(match *target {
                JobTarget::JobId(id) => format!("%{}", id),
                JobTarget::Pid(pid) => pid.to_string(),
            })
        })
    }

    /// Reclaims every slot whose process has already been reaped and queues
    /// a notice for it.
    pub fn reap_finished(&mut self) -> Result<()> {
        let mask = SignalMask::block()?;
        self.collect_reaped(&mask);
        Ok(())
    }

    fn collect_reaped(&mut self, mask: &SignalMask) {
        let reaped: Vec<SlotId> = self.table.reaped().collect();
        for slot in reaped {
            self.collect_if_reaped(slot, mask);
        }
    }

    /// Frees `slot` if its process is already gone. A reaped pid may belong
    /// to someone else by now, so it must never be signalled.
    fn collect_if_reaped(&mut self, slot: SlotId, _mask: &SignalMask) -> bool {
        let job = self.table.get(slot);
        let Ok(termination) = self.table.reset(slot) else {
            return false;
        };
        tracing::debug!(slot = %slot, %termination, "job reaped");
        self.notices
            .extend(JobNotice::new(&job, JobEvent::Finished(termination)));
        true
    }

    fn notice(&self, job: &JobSlot, event: JobEvent) -> Result<JobNotice> {
        JobNotice::new(job, event)
            .ok_or_else(|| ShellError::InvalidJob(job.slot.to_string()))
    }

    /// Runs an external command. Background jobs return at once with a
    /// `Started` notice; foreground ones return once they finish or stop.
    pub fn launch(&mut self, command: &ExternalCommand) -> Result<JobNotice> {
        let mask = SignalMask::block()?;
        // finished jobs must give their slot back before we count free ones
        self.collect_reaped(&mask);
        let slot = self.launcher.spawn(command, &mask)?;
        if command.background {
            return self.notice(&self.table.get(slot), JobEvent::Started);
        }
        self.wait_foreground(slot, &mask)
    }

    /// Blocks until the foreground job in `slot` terminates or stops.
    ///
    /// A terminated job is reset before returning. The caller's `mask`
    /// keeps the handlers out except while suspended.
    pub fn wait_foreground(&self, slot: SlotId, mask: &SignalMask) -> Result<JobNotice> {
        loop {
            if self.table.termination(slot).is_some() {
                let job = self.table.get(slot);
                let termination = self.table.reset(slot)?;
                tracing::debug!(slot = %slot, %termination, "foreground job finished");
                return self.notice(&job, JobEvent::Finished(termination));
            }
            if self.table.state(slot) != JobState::Foreground {
                tracing::debug!(slot = %slot, "foreground job stopped");
                return self.notice(&self.table.get(slot), JobEvent::Stopped);
            }
            mask.suspend();
        }
    }

    pub fn bring_foreground(&mut self, target: &JobTarget) -> Result<JobNotice> {
        let mask = SignalMask::block()?;
        let slot = self.resolve_target(target)?;
        let state = self.table.state(slot);
        if !matches!(state, JobState::Background | JobState::Stopped) {
            return Err(ShellError::InvalidState { job: slot, state });
        }
        if self.table.termination(slot).is_some() {
            // exited while the user was typing; report it like any other end
            return self.wait_foreground(slot, &mask);
        }
        self.table.set_state(slot, JobState::Foreground);
        if let Err(err) = self.continue_job(slot) {
            self.table.set_state(slot, state);
            return Err(err);
        }
        self.wait_foreground(slot, &mask)
    }

    pub fn send_background(&mut self, target: &JobTarget) -> Result<SlotId> {
        let mask = SignalMask::block()?;
        let slot = self.resolve_target(target)?;
        let state = self.table.state(slot);
        if state != JobState::Stopped {
            return Err(ShellError::InvalidState { job: slot, state });
        }
        if self.collect_if_reaped(slot, &mask) {
            return Ok(slot);
        }
        self.table.set_state(slot, JobState::Background);
        if let Err(err) = self.continue_job(slot) {
            self.table.set_state(slot, state);
            return Err(err);
        }
        tracing::debug!(slot = %slot, "job continued in background");
        Ok(slot)
    }

    /// Kills the job and waits for it to be reaped, then frees its slot.
    /// SIGKILL also ends a stopped process, so the wait is short.
    pub fn terminate(&mut self, target: &JobTarget) -> Result<SlotId> {
        let mask = SignalMask::block()?;
        let slot = self.resolve_target(target)?;
        if self.collect_if_reaped(slot, &mask) {
            return Ok(slot);
        }
        let pid = self
            .table
            .pid(slot)
            .ok_or_else(|| ShellError::InvalidJob(slot.to_string()))?;
        send(pid, Signal::SIGKILL)?;
        while self.table.termination(slot).is_none() {
            mask.suspend();
        }
        self.table.reset(slot)?;
        tracing::debug!(slot = %slot, pid = %pid, "job killed");
        Ok(slot)
    }

    /// Interrupts every live job without waiting for any of them.
    pub fn quit(&mut self) {
        let _mask = SignalMask::block().ok();
        for slot in self.table.live() {
            if self.table.termination(slot).is_some() {
                continue;
            }
            let Some(pid) = self.table.pid(slot) else {
                continue;
            };
            if let Err(err) = send(pid, Signal::SIGINT) {
                tracing::warn!(slot = %slot, error = %err, "failed to interrupt job");
            }
            // a stopped process only acts on SIGINT once continued
            if self.table.state(slot) == JobState::Stopped {
                let _ = send(pid, Signal::SIGCONT);
            }
        }
    }

    fn continue_job(&self, slot: SlotId) -> Result<()> {
        match self.table.pid(slot) {
            Some(pid) => send(pid, Signal::SIGCONT),
            None => Err(ShellError::InvalidJob(slot.to_string())),
        }
    }
}

/// Sends `signal` to `pid`. A process that is already gone is not an error:
/// its reaping is reported through the table.
fn send(pid: Pid, signal: Signal) -> Result<()> {
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(ShellError::Signal {
            pid,
            signal,
            source,
        }),
    }
}
