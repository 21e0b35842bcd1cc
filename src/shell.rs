use std::io::{stdout, BufRead, ErrorKind, Write};

use crate::builtins::{JobController, JobEvent, JobNotice};
use crate::config::ShellConfig;
use crate::error::{report, Result, ShellError};
use crate::job::JobTable;
use crate::parser::{self, Command};
use crate::signals;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Shell {
    config: ShellConfig,
    controller: JobController,
}

impl Shell {
    /// Allocates the job table for the life of the process and installs the
    /// signal relay on it.
    pub fn new(config: ShellConfig) -> Result<Self> {
        let table: &'static JobTable = Box::leak(Box::new(JobTable::new(config.max_jobs)));
        signals::install(table)?;
        let controller = JobController::new(table, &config);
        Ok(Shell { config, controller })
    }

    /// Reads and runs lines until `quit` or end of input.
    pub fn run<R: BufRead>(&mut self, mut input: R) -> Result<()> {
        let mut line = String::new();
        loop {
            if let Err(err) = self.controller.reap_finished() {
                report(&err);
            }
            self.print_notices();
            self.prompt();

            line.clear();
            match input.read_line(&mut line) {
                Ok(0) => {
                    println!();
                    self.controller.quit();
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::InvalidData => {
                    report(&ShellError::Io(err));
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            match self.dispatch(line.trim_end_matches(['\n', '\r'])) {
                Ok(Flow::Quit) => return Ok(()),
                Ok(Flow::Continue) => {}
                Err(err) => report(&err),
            }
        }
    }

    pub fn dispatch(&mut self, line: &str) -> Result<Flow> {
        match parser::parse(line, &self.config)? {
            Command::Empty => {}
            Command::Jobs => {
                for row in self.controller.list()? {
                    println!("{}", row);
                }
            }
            Command::Quit => {
                self.controller.quit();
                return Ok(Flow::Quit);
            }
            Command::Cd(path) => self.controller.change_directory(&path)?,
            Command::Fg(target) => {
                let notice = self.controller.bring_foreground(&target)?;
                print_foreground(&notice);
            }
            Command::Bg(target) => {
                self.controller.send_background(&target)?;
            }
            Command::Kill(target) => {
                self.controller.terminate(&target)?;
            }
            Command::External(command) => {
                let notice = self.controller.launch(&command)?;
                match notice.event {
                    JobEvent::Started => println!("{}", notice),
                    _ => print_foreground(&notice),
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn print_notices(&mut self) {
        for notice in self.controller.take_notices() {
            println!("{}", notice);
        }
    }

    fn prompt(&self) {
        print!("{}", self.config.prompt);
        match stdout().flush() {
            Ok(res) => res,
            Err(err) => tracing::debug!(error = %err, "failed to flush prompt"),
        }
    }
}

fn print_foreground(notice: &JobNotice) {
    if notice.is_abnormal() {
        println!("{}", notice);
    }
}
