//! Process groups and rank resolution.
//!
//! A [`ProcessGroup`] is the ordered list of hosts taking part in a run. The position
//! of a host in that list is its rank, so the list is normally read from a host file
//! with one hostname per line:
//!
//! ```text
//! node-a      <- rank 0
//! node-b      <- rank 1
//! node-c      <- rank 2
//! ```
//!
//! A process finds its own rank by looking up its hostname in the group.
//!
//! # Example
//! ```rust
//! use rankwire::ProcessGroup;
//!
//! let group = ProcessGroup::parse("node-a\nnode-b\n".as_bytes()).unwrap();
//! assert_eq!(group.rank_of("node-b"), Some(1));
//! assert_eq!(group.rank_of("node-z"), None);
//! ```
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("failed to read host file '{path}': {source}")]
    HostFile { path: PathBuf, source: io::Error },
    #[error("failed to read hosts: {0}")]
    Io(#[from] io::Error),
    #[error("host list is empty")]
    Empty,
    #[error("line {line} of the host list is blank")]
    BlankLine { line: usize },
    #[error("host '{host}' is listed at both rank {first} and rank {second}")]
    Duplicate {
        host: String,
        first: usize,
        second: usize,
    },
}

/// Ordered set of hosts; a host's index is its rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    hosts: Vec<String>,
}

impl ProcessGroup {
    pub fn new(hosts: Vec<String>) -> Result<Self, GroupError> {
        if hosts.is_empty() {
            return Err(GroupError::Empty);
        }

        for (second, host) in hosts.iter().enumerate() {
            if let Some(first) = resolve_rank(&hosts[..second], host) {
                return Err(GroupError::Duplicate {
                    host: host.clone(),
                    first,
                    second,
                });
            }
        }

        Ok(Self { hosts })
    }

    /// Reads a newline delimited host list. Trailing blank lines are ignored; a
    /// blank line anywhere else is rejected since it would shift every later rank.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, GroupError> {
        let mut hosts = reader
            .lines()
            .map(|line| line.map(|l| l.trim().to_owned()))
            .collect::<Result<Vec<_>, _>>()?;

        while hosts.last().is_some_and(|h| h.is_empty()) {
            hosts.pop();
        }
        if let Some(line) = hosts.iter().position(|h| h.is_empty()) {
            return Err(GroupError::BlankLine { line: line + 1 });
        }

        Self::new(hosts)
    }

    pub fn from_hostfile<P: AsRef<Path>>(path: P) -> Result<Self, GroupError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| GroupError::HostFile {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(BufReader::new(file))
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn host(&self, rank: usize) -> Option<&str> {
        self.hosts.get(rank).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn rank_of(&self, hostname: &str) -> Option<usize> {
        resolve_rank(&self.hosts, hostname)
    }
}

/// Rank of `hostname` within `hosts`, or `None` when it is not a member.
pub fn resolve_rank<S: AsRef<str>>(hosts: &[S], hostname: &str) -> Option<usize> {
    hosts.iter().position(|h| h.as_ref() == hostname)
}

/// Hostname of this machine, if it is valid UTF-8.
pub fn local_hostname() -> Option<String> {
    gethostname::gethostname().into_string().ok()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempdir::TempDir;

    use super::*;

    fn group(hosts: &[&str]) -> Result<ProcessGroup, GroupError> {
        ProcessGroup::new(hosts.iter().map(|h| h.to_string()).collect())
    }

    #[test]
    fn resolve_rank_by_exact_match() {
        let hosts = ["a", "b", "c"];

        assert_eq!(resolve_rank(&hosts, "b"), Some(1));
        assert_eq!(resolve_rank(&hosts, "z"), None);
        assert_eq!(resolve_rank(&hosts, "B"), None);
    }

    #[test]
    fn group_lookups() {
        let group = group(&["h0", "h1"]).unwrap();

        assert_eq!(group.len(), 2);
        assert_eq!(group.host(1), Some("h1"));
        assert_eq!(group.host(2), None);
        assert_eq!(group.rank_of("h0"), Some(0));
    }

    #[test]
    fn rejects_duplicate_hosts() {
        let err = group(&["a", "b", "a"]).unwrap_err();

        assert!(matches!(
            err,
            GroupError::Duplicate { first: 0, second: 2, .. }
        ));
    }

    #[test]
    fn rejects_empty_group() {
        assert!(matches!(group(&[]), Err(GroupError::Empty)));
        assert!(matches!(
            ProcessGroup::parse("\n\n".as_bytes()),
            Err(GroupError::Empty)
        ));
    }

    #[test]
    fn parse_trims_and_drops_trailing_blanks() {
        let group = ProcessGroup::parse(" a \r\nb\n\n\n".as_bytes()).unwrap();

        assert_eq!(group.hosts(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn parse_rejects_inner_blank_line() {
        let err = ProcessGroup::parse("a\n\nb\n".as_bytes()).unwrap_err();

        assert!(matches!(err, GroupError::BlankLine { line: 2 }));
    }

    #[test]
    fn reads_hostfile() {
        let temp = TempDir::new("hostfile").unwrap();
        let path = temp.path().join("host_file");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "node-a\nnode-b\nnode-c").unwrap();

        let group = ProcessGroup::from_hostfile(&path).unwrap();

        assert_eq!(group.rank_of("node-c"), Some(2));
    }

    #[test]
    fn missing_hostfile_is_an_error() {
        let temp = TempDir::new("hostfile").unwrap();

        let err = ProcessGroup::from_hostfile(temp.path().join("missing")).unwrap_err();

        assert!(matches!(err, GroupError::HostFile { .. }));
    }

    #[test]
    fn local_hostname_is_available() {
        assert!(local_hostname().is_some_and(|h| !h.is_empty()));
    }
}
