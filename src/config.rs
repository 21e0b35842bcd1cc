use std::env;
use std::path::PathBuf;

/// Directories searched when a program is not found by its literal path and
/// `PATH` is unset.
pub const FALLBACK_SEARCH_PATH: &str = "/bin:/usr/bin";

/// Upper bound accepted for `max_jobs`.
pub const MAX_JOBS_LIMIT: usize = 64;

#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Number of slots in the job table
    pub max_jobs: usize,
    /// Longest accepted command line, in bytes
    pub max_line: usize,
    /// Most tokens accepted on one command line
    pub max_args: usize,
    pub prompt: String,
    /// Directories tried, in order, after the literal program path fails
    pub search_path: Vec<PathBuf>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            max_jobs: 5,
            max_line: 80,
            max_args: 80,
            prompt: "prompt> ".to_string(),
            search_path: split_search_path(FALLBACK_SEARCH_PATH),
        }
    }
}

impl ShellConfig {
    /// Defaults, with the search path taken from `PATH`.
    pub fn from_env() -> Self {
        let search_path = env::var("PATH")
            .map(|path| split_search_path(&path))
            .unwrap_or_else(|_| split_search_path(FALLBACK_SEARCH_PATH));
        Self {
            search_path,
            ..Default::default()
        }
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.clamp(1, MAX_JOBS_LIMIT);
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

fn split_search_path(path: &str) -> Vec<PathBuf> {
    path.split(':')
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_config_default() {
        let cfg = ShellConfig::default();
        assert_eq!(cfg.max_jobs, 5);
        assert_eq!(cfg.max_line, 80);
        assert_eq!(cfg.max_args, 80);
        assert_eq!(cfg.prompt, "prompt> ");
        assert_eq!(
            cfg.search_path,
            vec![PathBuf::from("/bin"), PathBuf::from("/usr/bin")]
        );
    }

    #[test]
    fn max_jobs_is_clamped() {
        assert_eq!(ShellConfig::default().with_max_jobs(0).max_jobs, 1);
        assert_eq!(ShellConfig::default().with_max_jobs(3).max_jobs, 3);
        assert_eq!(
            ShellConfig::default().with_max_jobs(1000).max_jobs,
            MAX_JOBS_LIMIT
        );
    }

    #[test]
    fn empty_search_path_entries_are_dropped() {
        assert_eq!(
            split_search_path("/usr/local/bin::/bin:"),
            vec![PathBuf::from("/usr/local/bin"), PathBuf::from("/bin")]
        );
    }
}
