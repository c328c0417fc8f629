//! Hosts file section management
//!
//! Catapult owns one named block of the system hosts file:
//!
//! ```text
//! # Start Section catapult
//! 127.244.12.7 web web.shop web.shop.svc.cluster.local
//! # End Section catapult
//! ```
//!
//! Everything outside the block is preserved. The block is rewritten as a
//! whole on every flush and disappears when there is nothing to map.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, Result};
use crate::net::Address;

/// Environment variable overriding the hosts file location
pub const HOSTS_FILE_ENV: &str = "CATAPULT_HOSTS_FILE";

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

/// In-memory address to hostnames map, written out on demand.
///
/// Only `flush` touches the filesystem.
pub trait HostsSectionManager: Send {
    /// Map `address` to `hosts`, replacing any previous mapping
    fn add(&mut self, address: Address, hosts: &[String]);
    fn remove(&mut self, address: Address);
    fn clear(&mut self);
    /// Rewrite the section in the backing file
    fn flush(&mut self) -> Result<()>;
}

/// Location of the system hosts file, honouring [`HOSTS_FILE_ENV`]
pub fn system_hosts_path() -> PathBuf {
    if let Some(path) = std::env::var_os(HOSTS_FILE_ENV) {
        return PathBuf::from(path);
    }
    platform_hosts_path()
}

#[cfg(windows)]
fn platform_hosts_path() -> PathBuf {
    let root = std::env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
    PathBuf::from(root)
        .join("System32")
        .join("drivers")
        .join("etc")
        .join("hosts")
}

#[cfg(not(windows))]
fn platform_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

pub fn begin_marker(name: &str) -> String {
    format!("# Start Section {}", name)
}

pub fn end_marker(name: &str) -> String {
    format!("# End Section {}", name)
}

/// A named section of a hosts file
#[derive(Debug, Clone)]
pub struct HostsSection {
    path: PathBuf,
    name: String,
    entries: BTreeMap<Address, BTreeSet<String>>,
}

impl HostsSection {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn entries(&self) -> &BTreeMap<Address, BTreeSet<String>> {
        &self.entries
    }

    fn file_error(&self, source: std::io::Error) -> Error {
        Error::HostsFile {
            path: self.path.clone(),
            source,
        }
    }

    fn rewrite(&mut self) -> std::io::Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let mut guard = lock_exclusive(file)?;
        let handle: &mut File = &mut guard;

        let mut content = String::new();
        handle.read_to_string(&mut content)?;

        let updated = render_section(&content, &self.name, &self.entries, LINE_ENDING);

        handle.seek(SeekFrom::Start(0))?;
        handle.set_len(0)?;
        handle.write_all(updated.as_bytes())?;
        handle.flush()
    }
}

impl HostsSectionManager for HostsSection {
    fn add(&mut self, address: Address, hosts: &[String]) {
        let hosts: BTreeSet<String> = hosts.iter().cloned().collect();
        if hosts.is_empty() {
            self.entries.remove(&address);
        } else {
            self.entries.insert(address, hosts);
        }
    }

    fn remove(&mut self, address: Address) {
        self.entries.remove(&address);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn flush(&mut self) -> Result<()> {
        self.rewrite().map_err(|e| self.file_error(e))?;
        debug!(
            path = %self.path.display(),
            section = %self.name,
            entries = self.entries.len(),
            "Flushed hosts section"
        );
        Ok(())
    }
}

#[cfg(unix)]
fn lock_exclusive(file: File) -> std::io::Result<nix::fcntl::Flock<File>> {
    nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
        .map_err(|(_, errno)| std::io::Error::from(errno))
}

// No advisory locking off unix
#[cfg(not(unix))]
fn lock_exclusive(file: File) -> std::io::Result<File> {
    Ok(file)
}

/// Replace the section `name` inside `existing` with `entries`.
///
/// The old block spans the first begin marker to the last end marker, or
/// to the end of the file when no end marker follows it. Stray markers of
/// this section are dropped.
/// Trailing blank lines are dropped and the result always ends with exactly
/// one line ending (unless it is empty).
pub fn render_section(
    existing: &str,
    name: &str,
    entries: &BTreeMap<Address, BTreeSet<String>>,
    line_ending: &str,
) -> String {
    let begin = begin_marker(name);
    let end = end_marker(name);

    let mut lines: Vec<&str> = existing.lines().collect();
    if let Some(start) = lines.iter().position(|l| l.trim() == begin) {
        match lines.iter().rposition(|l| l.trim() == end) {
            Some(stop) if stop > start => {
                lines.drain(start..=stop);
            }
            // unterminated block: a write cut short, everything after it is ours
            _ => lines.truncate(start),
        }
    }
    lines.retain(|l| l.trim() != begin && l.trim() != end);
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let mut out: Vec<String> = lines.into_iter().map(str::to_string).collect();
    if !entries.is_empty() {
        out.push(begin);
        for (address, hosts) in entries {
            let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();
            out.push(format!("{} {}", address, hosts.join(" ")));
        }
        out.push(end);
    }

    let mut text = out.join(line_ending);
    if !text.is_empty() {
        text.push_str(line_ending);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(items: &[(&str, &[&str])]) -> BTreeMap<Address, BTreeSet<String>> {
        items
            .iter()
            .map(|(ip, hosts)| {
                (
                    ip.parse().unwrap(),
                    hosts.iter().map(|h| h.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_appends_block_with_sorted_hosts() {
        let existing = "127.0.0.1 localhost\n";
        let out = render_section(
            existing,
            "catapult",
            &entries(&[("127.244.0.9", &["web.shop", "web"])]),
            "\n",
        );
        assert_eq!(
            out,
            "127.0.0.1 localhost\n# Start Section catapult\n127.244.0.9 web web.shop\n# End Section catapult\n"
        );
    }

    #[test]
    fn test_replaces_existing_block() {
        let existing = "127.0.0.1 localhost\n# Start Section catapult\n127.244.0.1 old\n# End Section catapult\n::1 localhost\n";
        let out = render_section(
            existing,
            "catapult",
            &entries(&[("127.244.0.2", &["new"])]),
            "\n",
        );
        assert_eq!(
            out,
            "127.0.0.1 localhost\n::1 localhost\n# Start Section catapult\n127.244.0.2 new\n# End Section catapult\n"
        );
    }

    #[test]
    fn test_empty_entries_remove_block() {
        let existing = "127.0.0.1 localhost\n\n# Start Section catapult\n127.244.0.1 old\n# End Section catapult\n\n";
        let out = render_section(existing, "catapult", &BTreeMap::new(), "\n");
        assert_eq!(out, "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_other_sections_are_untouched() {
        let existing = "# Start Section gateway\n127.244.0.7 gw\n# End Section gateway\n";
        let out = render_section(existing, "catapult", &BTreeMap::new(), "\n");
        assert_eq!(out, existing);
    }

    #[test]
    fn test_duplicate_blocks_collapse_to_one() {
        let existing = "# Start Section catapult\n127.244.0.1 a\n# End Section catapult\n# Start Section catapult\n127.244.0.2 b\n# End Section catapult\n";
        let out = render_section(
            existing,
            "catapult",
            &entries(&[("127.244.0.3", &["c"])]),
            "\n",
        );
        assert_eq!(out.matches("# Start Section catapult").count(), 1);
        assert_eq!(out.matches("# End Section catapult").count(), 1);
        assert!(!out.contains("127.244.0.1"));
        assert!(!out.contains("127.244.0.2"));
    }

    #[test]
    fn test_unterminated_block_is_dropped() {
        let existing = "127.0.0.1 localhost\n# Start Section catapult\n127.244.0.1 half\n";
        let out = render_section(
            existing,
            "catapult",
            &entries(&[("127.244.0.2", &["web"])]),
            "\n",
        );
        assert_eq!(
            out,
            "127.0.0.1 localhost\n# Start Section catapult\n127.244.0.2 web\n# End Section catapult\n"
        );
    }

    #[test]
    fn test_stray_end_marker_is_dropped() {
        let existing = "# End Section catapult\n127.0.0.1 localhost\n";
        let out = render_section(existing, "catapult", &BTreeMap::new(), "\n");
        assert_eq!(out, "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_crlf_line_endings() {
        let existing = "127.0.0.1 localhost\r\n";
        let out = render_section(
            existing,
            "catapult",
            &entries(&[("127.244.0.9", &["web"])]),
            "\r\n",
        );
        assert_eq!(
            out,
            "127.0.0.1 localhost\r\n# Start Section catapult\r\n127.244.0.9 web\r\n# End Section catapult\r\n"
        );
    }

    #[test]
    fn test_add_replaces_and_empty_add_removes() {
        let mut section = HostsSection::new("/nonexistent", "catapult");
        let address: Address = "127.244.0.1".parse().unwrap();
        section.add(address, &["a".to_string()]);
        section.add(address, &["b".to_string()]);
        assert_eq!(
            section.entries()[&address].iter().collect::<Vec<_>>(),
            vec!["b"]
        );
        section.add(address, &[]);
        assert!(section.entries().is_empty());
    }

    #[test]
    fn test_flush_missing_file_reports_path() {
        let mut section = HostsSection::new("/nonexistent/catapult/hosts", "catapult");
        let err = section.flush().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/catapult/hosts"));
    }
}
