use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Set of blocked host entries shared between the dispatcher and the
/// management console.
///
/// Matching is equals-or-suffix: an entry blocks the host itself and every
/// subdomain of it, so blocking `example.com` also blocks
/// `www.example.com` but not `notexample.com`. Entries are normalized to
/// ASCII lowercase; hostnames are case-insensitive.
#[derive(Default)]
pub struct Blocklist {
    hosts: RwLock<HashSet<String>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the blocklist from a text file, one host per line. Blank lines
    /// and `#` comments are skipped. Returns the number of new entries.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open blocklist file {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut added = 0;
        let mut hosts = self.hosts.write();
        for line in reader.lines() {
            let line = line?;
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            if hosts.insert(entry.to_ascii_lowercase()) {
                added += 1;
            }
        }
        drop(hosts);

        tracing::info!("loaded {} blocklist entries from {}", added, path.display());
        Ok(added)
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let host = host.to_ascii_lowercase();
        let hosts = self.hosts.read();
        hosts.iter().any(|entry| {
            host == *entry
                || (host.len() > entry.len()
                    && host.ends_with(entry.as_str())
                    && host.as_bytes()[host.len() - entry.len() - 1] == b'.')
        })
    }

    /// Returns false if the host was already blocked.
    pub fn add(&self, host: &str) -> bool {
        self.hosts.write().insert(host.trim().to_ascii_lowercase())
    }

    /// Returns false if the host was not blocked in the first place.
    pub fn remove(&self, host: &str) -> bool {
        self.hosts.write().remove(&host.trim().to_ascii_lowercase())
    }

    /// Sorted snapshot for listing.
    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<String> = self.hosts.read().iter().cloned().collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn matches_exact_host_and_subdomains() {
        let blocklist = Blocklist::new();
        assert!(blocklist.add("example.com"));

        assert!(blocklist.is_blocked("example.com"));
        assert!(blocklist.is_blocked("www.example.com"));
        assert!(blocklist.is_blocked("a.b.example.com"));

        assert!(!blocklist.is_blocked("example.org"));
        assert!(!blocklist.is_blocked("notexample.com"));
        assert!(!blocklist.is_blocked("example.com.evil.net"));
        assert!(!blocklist.is_blocked(""));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let blocklist = Blocklist::new();
        blocklist.add("Example.COM");

        assert!(blocklist.is_blocked("example.com"));
        assert!(blocklist.is_blocked("WWW.EXAMPLE.COM"));
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let blocklist = Blocklist::new();

        assert!(blocklist.add("example.com"));
        assert!(!blocklist.add("example.com"));
        assert_eq!(blocklist.len(), 1);

        assert!(blocklist.remove("example.com"));
        assert!(!blocklist.remove("example.com"));
        assert!(blocklist.is_empty());
        assert!(!blocklist.is_blocked("example.com"));
    }

    #[test]
    fn entries_are_sorted() {
        let blocklist = Blocklist::new();
        blocklist.add("zzz.net");
        blocklist.add("aaa.org");
        blocklist.add("mmm.com");

        assert_eq!(blocklist.entries(), vec!["aaa.org", "mmm.com", "zzz.net"]);
    }

    #[test]
    fn loads_entries_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# tracking hosts").unwrap();
        writeln!(file, "ads.example.com").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  tracker.net  ").unwrap();
        writeln!(file, "ads.example.com").unwrap();

        let blocklist = Blocklist::new();
        let added = blocklist.load(file.path()).unwrap();

        assert_eq!(added, 2);
        assert!(blocklist.is_blocked("ads.example.com"));
        assert!(blocklist.is_blocked("metrics.tracker.net"));
        assert!(!blocklist.is_blocked("example.com"));
    }

    #[test]
    fn load_fails_on_missing_file() {
        let blocklist = Blocklist::new();
        assert!(blocklist.load("/nonexistent/blocklist.txt").is_err());
    }
}
