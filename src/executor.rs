use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use libc::{
    c_int, close, dup2, open, O_APPEND, O_CREAT, O_RDONLY, O_TRUNC, O_WRONLY, STDIN_FILENO,
    STDOUT_FILENO,
};
use nix::errno::Errno;
use nix::unistd::{execv, fork, setpgid, ForkResult, Pid};

use crate::error::{report, Result, ShellError};
use crate::job::{JobState, JobTable, SlotId};
use crate::parser::{ExternalCommand, Redirect};
use crate::signals::{self, SignalMask};

/// Exit status of a child that could not run its program by either strategy.
pub const EXIT_NOT_FOUND: c_int = 127;

/// Exit status of a child that could not open a redirection target.
pub const EXIT_REDIRECT_FAILED: c_int = 1;

/// Everything the child needs, built before fork so that a bad argument is
/// reported by the shell rather than by a half-started job.
struct ChildPlan {
    argv: Vec<CString>,
    /// The literal path first, then one entry per search directory.
    candidates: Vec<CString>,
    redirects: Vec<PlannedRedirect>,
    not_found: Vec<u8>,
}

struct PlannedRedirect {
    path: CString,
    flags: c_int,
    target_fd: c_int,
    error: Vec<u8>,
}

const REDIRECT_FAILED: &[u8] = b"cannot redirect standard stream\n";

impl PlannedRedirect {
    /// Opens the target and moves it onto `target_fd`. On failure returns
    /// the message the child prints before exiting.
    fn apply(&self) -> std::result::Result<(), &[u8]> {
        // SAFETY: path is NUL-terminated; every fd is checked before use
        unsafe {
            let fd = open(self.path.as_ptr(), self.flags, 0o644 as libc::c_uint);
            if fd == -1 {
                return Err(&self.error);
            }
            if fd == self.target_fd {
                return Ok(());
            }
            let moved = dup2(fd, self.target_fd);
            close(fd);
            if moved == -1 {
                return Err(REDIRECT_FAILED);
            }
        }
        Ok(())
    }
}

fn cstring(s: impl Into<Vec<u8>>) -> Result<CString> {
    CString::new(s).map_err(|e| {
        ShellError::NulByte(String::from_utf8_lossy(&e.into_vec()).into_owned())
    })
}

impl ChildPlan {
    fn new(command: &ExternalCommand, search_path: &[PathBuf]) -> Result<Self> {
        let argv = command
            .argv
            .iter()
            .map(|arg| cstring(arg.as_str()))
            .collect::<Result<Vec<_>>>()?;
        let program = &command.argv[0];

        let mut candidates = vec![argv[0].clone()];
        // a program name with a slash is a path, never searched for
        if !program.contains('/') {
            for dir in search_path {
                candidates.push(cstring(dir.join(program).as_os_str().as_bytes())?);
            }
        }

        let redirects = command
            .redirects
            .iter()
            .map(|redirect| -> Result<PlannedRedirect> {
                let (path, flags, target_fd) = match redirect {
                    Redirect::Input(path) => (path, O_RDONLY, STDIN_FILENO),
                    Redirect::Truncate(path) => {
                        (path, O_WRONLY | O_CREAT | O_TRUNC, STDOUT_FILENO)
                    }
                    Redirect::Append(path) => {
                        (path, O_WRONLY | O_CREAT | O_APPEND, STDOUT_FILENO)
                    }
                };
                Ok(PlannedRedirect {
                    path: cstring(path.as_os_str().as_bytes())?,
                    flags,
                    target_fd,
                    error: format!("{}: cannot open file\n", path.display()).into_bytes(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ChildPlan {
            argv,
            candidates,
            redirects,
            not_found: format!("{}: command not found\n", program).into_bytes(),
        })
    }
}

/// Starts external commands as jobs.
pub struct Launcher {
    table: &'static JobTable,
    search_path: Vec<PathBuf>,
}

impl Launcher {
    pub fn new(table: &'static JobTable, search_path: Vec<PathBuf>) -> Self {
        Self { table, search_path }
    }

    /// Forks `command` into the lowest free slot.
    ///
    /// The caller must hold `mask` across this call and, for a foreground
    /// job, across the wait that follows, so the child cannot be reaped
    /// before its pid is in the table.
    pub fn spawn(&self, command: &ExternalCommand, mask: &SignalMask) -> Result<SlotId> {
        let plan = ChildPlan::new(command, &self.search_path)?;
        let slot = self.table.allocate(&command.text)?;
        let state = if command.background {
            JobState::Background
        } else {
            JobState::Foreground
        };

        // SAFETY: the shell is single-threaded, so the child cannot inherit a
        // lock held by another thread.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => run_child(&plan, mask),
            Ok(ForkResult::Parent { child }) => {
                self.table.assign(slot, child, state);
                // the job is already running, so a failure is reported only
                if let Err(err) = place_in_own_group(child) {
                    report(&err);
                }
                tracing::info!(
                    slot = %slot,
                    pid = %child,
                    background = command.background,
                    command = %command.text,
                    "job started"
                );
                Ok(slot)
            }
            Err(source) => Err(ShellError::Fork(source)),
        }
    }
}

/// Puts `child` in a process group of its own. The child does the same, and
/// whichever runs second fails harmlessly: EACCES once it has exec'd, ESRCH
/// once it is gone.
fn place_in_own_group(child: Pid) -> Result<()> {
    match setpgid(child, child) {
        Ok(()) | Err(Errno::EACCES) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(ShellError::ProcessGroup { pid: child, source }),
    }
}

fn run_child(plan: &ChildPlan, mask: &SignalMask) -> ! {
    // Own process group first, so terminal-generated signals only ever reach
    // the shell and are forwarded from there.
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    signals::restore_defaults();
    mask.restore();

    for redirect in &plan.redirects {
        if let Err(message) = redirect.apply() {
            write_stderr(message);
            // SAFETY: _exit never returns
            unsafe { libc::_exit(EXIT_REDIRECT_FAILED) }
        }
    }

    for path in &plan.candidates {
        let _ = execv(path, &plan.argv);
    }

    write_stderr(&plan.not_found);
    // SAFETY: _exit never returns and runs no atexit handlers of the parent
    unsafe { libc::_exit(EXIT_NOT_FOUND) }
}

fn write_stderr(message: &[u8]) {
    // SAFETY: message is a valid buffer of the given length
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> ExternalCommand {
        match crate::parser::parse(line, &Default::default()).unwrap() {
            crate::parser::Command::External(cmd) => cmd,
            other => panic!("not external: {:?}", other),
        }
    }

    #[test]
    fn literal_path_is_tried_before_search_path() {
        let search = vec![PathBuf::from("/usr/local/bin"), PathBuf::from("/bin")];
        let plan = ChildPlan::new(&command("ls -l"), &search).unwrap();
        let candidates: Vec<&str> = plan
            .candidates
            .iter()
            .map(|c| c.to_str().unwrap())
            .collect();
        assert_eq!(candidates, vec!["ls", "/usr/local/bin/ls", "/bin/ls"]);
        assert_eq!(plan.argv.len(), 2);
        assert_eq!(plan.not_found, b"ls: command not found\n");
    }

    #[test]
    fn program_with_slash_is_not_searched() {
        let plan = ChildPlan::new(&command("./run.sh"), &[PathBuf::from("/bin")]).unwrap();
        assert_eq!(plan.candidates.len(), 1);
        assert_eq!(plan.candidates[0].to_str().unwrap(), "./run.sh");
    }

    #[test]
    fn redirections_map_to_open_flags() {
        let plan = ChildPlan::new(&command("sort <in >>out"), &[]).unwrap();
        assert_eq!(plan.redirects.len(), 2);
        assert_eq!(plan.redirects[0].flags, O_RDONLY);
        assert_eq!(plan.redirects[0].target_fd, STDIN_FILENO);
        assert_eq!(plan.redirects[1].flags, O_WRONLY | O_CREAT | O_APPEND);
        assert_eq!(plan.redirects[1].target_fd, STDOUT_FILENO);
    }

    fn planned(path: &std::path::Path, flags: c_int, target_fd: c_int) -> PlannedRedirect {
        PlannedRedirect {
            path: cstring(path.as_os_str().as_bytes()).unwrap(),
            flags,
            target_fd,
            error: b"cannot open\n".to_vec(),
        }
    }

    #[test]
    fn redirect_moves_the_file_onto_the_target_fd() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        // a spare descriptor, so the test's own stdio is left alone
        let target_fd = 500;
        planned(&path, O_WRONLY | O_CREAT | O_TRUNC, target_fd)
            .apply()
            .unwrap();
        unsafe {
            assert_eq!(libc::write(target_fd, b"hi".as_ptr().cast(), 2), 2);
            close(target_fd);
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi");
    }

    #[test]
    fn redirect_reports_open_and_dup_failures() {
        let dir = tempfile::tempdir().unwrap();
        let missing = planned(&dir.path().join("missing"), O_RDONLY, 501);
        assert_eq!(missing.apply(), Err(&b"cannot open\n"[..]));

        let present = dir.path().join("in.txt");
        std::fs::write(&present, "x").unwrap();
        let bad_target = planned(&present, O_RDONLY, -1);
        assert_eq!(bad_target.apply(), Err(REDIRECT_FAILED));
    }

    #[test]
    fn process_group_errors_are_reported_except_for_the_known_races() {
        // far above pid_max: ESRCH, as for a child that already exited
        assert!(place_in_own_group(Pid::from_raw(0x3fff_ff00)).is_ok());
        assert!(matches!(
            place_in_own_group(Pid::from_raw(-5)),
            Err(ShellError::ProcessGroup { .. })
        ));
    }

    #[test]
    fn nul_bytes_are_rejected_before_fork() {
        let cmd = ExternalCommand {
            argv: vec!["echo".into(), "a\0b".into()],
            redirects: Vec::new(),
            background: false,
            text: "echo".into(),
        };
        assert!(matches!(
            ChildPlan::new(&cmd, &[]),
            Err(ShellError::NulByte(_))
        ));
    }
}
