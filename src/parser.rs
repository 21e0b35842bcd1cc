use std::path::PathBuf;

use nix::unistd::Pid;

use crate::config::ShellConfig;
use crate::error::{Result, ShellError};

/// Marks a job id in `fg`, `bg` and `kill` arguments, as in `%1`.
pub const JOB_ID_MARKER: char = '%';

/// Where a job argument points: a 1-based job id or a raw pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTarget {
    JobId(usize),
    Pid(Pid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// `<file`
    Input(PathBuf),
    /// `>file`
    Truncate(PathBuf),
    /// `>>file`
    Append(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub argv: Vec<String>,
    pub redirects: Vec<Redirect>,
    pub background: bool,
    /// What the user typed, minus a trailing `&`. Shown by `jobs`.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Jobs,
    Quit,
    Cd(String),
    Fg(JobTarget),
    Bg(JobTarget),
    Kill(JobTarget),
    External(ExternalCommand),
}

/// Splits on whitespace, enforcing the configured line and token bounds.
pub fn tokenize<'a>(line: &'a str, config: &ShellConfig) -> Result<Vec<&'a str>> {
    if line.len() > config.max_line {
        return Err(ShellError::LineTooLong(config.max_line));
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.len() > config.max_args {
        return Err(ShellError::TooManyArgs(config.max_args));
    }
    Ok(words)
}

pub fn parse(line: &str, config: &ShellConfig) -> Result<Command> {
    let words = tokenize(line, config)?;
    let Some((&program, args)) = words.split_first() else {
        return Ok(Command::Empty);
    };

    let command = match (program, args) {
        ("jobs", []) => Command::Jobs,
        ("quit", []) => Command::Quit,
        ("cd", [path]) => Command::Cd(path.to_string()),
        ("fg", [target]) => Command::Fg(parse_target(target)?),
        ("bg", [target]) => Command::Bg(parse_target(target)?),
        ("kill", [target]) => Command::Kill(parse_target(target)?),
        ("jobs" | "quit" | "cd" | "fg" | "bg" | "kill", _) => {
            return Err(ShellError::InvalidCommand)
        }
        _ => Command::External(parse_external(&words)?),
    };
    Ok(command)
}

/// `%k` is a job id, anything else must be a positive pid.
pub fn parse_target(arg: &str) -> Result<JobTarget> {
    let invalid = || ShellError::InvalidJob(arg.to_string());
    match arg.strip_prefix(JOB_ID_MARKER) {
        Some(id) => id.parse::<usize>().map(JobTarget::JobId).map_err(|_| invalid()),
        None => match arg.parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(JobTarget::Pid(Pid::from_raw(pid))),
            _ => Err(invalid()),
        },
    }
}

fn parse_external(words: &[&str]) -> Result<ExternalCommand> {
    let (words, background) = match words.split_last() {
        Some((&"&", rest)) => (rest, true),
        _ => (words, false),
    };

    let mut argv = Vec::new();
    let mut redirects = Vec::new();
    let mut iter = words.iter();
    while let Some(&word) = iter.next() {
        let redirect = if let Some(rest) = word.strip_prefix(">>") {
            Redirect::Append(redirect_target(rest, &mut iter)?)
        } else if let Some(rest) = word.strip_prefix('>') {
            Redirect::Truncate(redirect_target(rest, &mut iter)?)
        } else if let Some(rest) = word.strip_prefix('<') {
            Redirect::Input(redirect_target(rest, &mut iter)?)
        } else {
            argv.push(word.to_string());
            continue;
        };
        redirects.push(redirect);
    }

    if argv.is_empty() {
        return Err(ShellError::InvalidCommand);
    }
    Ok(ExternalCommand {
        argv,
        redirects,
        background,
        text: words.join(" "),
    })
}

// `> file` as well as `>file`
fn redirect_target<'a>(attached: &'a str, rest: &mut std::slice::Iter<'_, &'a str>) -> Result<PathBuf> {
    let target = if attached.is_empty() {
        rest.next().copied().ok_or(ShellError::InvalidCommand)?
    } else {
        attached
    };
    Ok(PathBuf::from(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_default(line: &str) -> Result<Command> {
        parse(line, &ShellConfig::default())
    }

    fn external(line: &str) -> ExternalCommand {
        match parse_default(line).unwrap() {
            Command::External(cmd) => cmd,
            other => panic!("expected external command, got {:?}", other),
        }
    }

    #[test]
    fn blank_line_is_empty() {
        assert_eq!(parse_default("   \t ").unwrap(), Command::Empty);
    }

    #[test]
    fn builtins_with_exact_arity() {
        assert_eq!(parse_default("jobs").unwrap(), Command::Jobs);
        assert_eq!(parse_default("quit").unwrap(), Command::Quit);
        assert_eq!(
            parse_default("cd /tmp").unwrap(),
            Command::Cd("/tmp".to_string())
        );
        assert_eq!(
            parse_default("fg %2").unwrap(),
            Command::Fg(JobTarget::JobId(2))
        );
        assert_eq!(
            parse_default("bg 1234").unwrap(),
            Command::Bg(JobTarget::Pid(Pid::from_raw(1234)))
        );
        assert_eq!(
            parse_default("kill %1").unwrap(),
            Command::Kill(JobTarget::JobId(1))
        );
    }

    #[test]
    fn builtins_with_wrong_arity_are_invalid_commands() {
        for line in ["jobs -l", "quit now", "cd", "cd a b", "fg", "bg %1 %2", "kill"] {
            assert!(
                matches!(parse_default(line), Err(ShellError::InvalidCommand)),
                "{line}"
            );
        }
    }

    #[test]
    fn unparsable_targets_are_invalid_jobs() {
        for arg in ["%", "%x", "abc", "0", "-5", "%-1"] {
            assert!(
                matches!(parse_target(arg), Err(ShellError::InvalidJob(ref a)) if a == arg),
                "{arg}"
            );
        }
        assert_eq!(parse_target("%0").unwrap(), JobTarget::JobId(0));
    }

    #[test]
    fn trailing_ampersand_requests_background() {
        let cmd = external("sleep 100 &");
        assert!(cmd.background);
        assert_eq!(cmd.argv, vec!["sleep", "100"]);
        assert_eq!(cmd.text, "sleep 100");

        let cmd = external("echo a & b");
        assert!(!cmd.background);
        assert_eq!(cmd.argv, vec!["echo", "a", "&", "b"]);
    }

    #[test]
    fn lone_ampersand_is_invalid() {
        assert!(matches!(
            parse_default("&"),
            Err(ShellError::InvalidCommand)
        ));
    }

    #[test]
    fn redirections_are_stripped_from_argv() {
        let cmd = external("sort <in.txt -r >> out.txt");
        assert_eq!(cmd.argv, vec!["sort", "-r"]);
        assert_eq!(
            cmd.redirects,
            vec![
                Redirect::Input(PathBuf::from("in.txt")),
                Redirect::Append(PathBuf::from("out.txt")),
            ]
        );
        assert_eq!(cmd.text, "sort <in.txt -r >> out.txt");

        let cmd = external("ls > listing &");
        assert!(cmd.background);
        assert_eq!(cmd.argv, vec!["ls"]);
        assert_eq!(
            cmd.redirects,
            vec![Redirect::Truncate(PathBuf::from("listing"))]
        );
    }

    #[test]
    fn redirection_without_target_is_invalid() {
        assert!(matches!(
            parse_default("ls >"),
            Err(ShellError::InvalidCommand)
        ));
        assert!(matches!(
            parse_default(">out"),
            Err(ShellError::InvalidCommand)
        ));
    }

    #[test]
    fn bounds_are_enforced() {
        let config = ShellConfig {
            max_line: 10,
            max_args: 2,
            ..Default::default()
        };
        assert!(matches!(
            parse("echo 0123456789", &config),
            Err(ShellError::LineTooLong(10))
        ));
        assert!(matches!(
            parse("a b c", &config),
            Err(ShellError::TooManyArgs(2))
        ));
    }
}
