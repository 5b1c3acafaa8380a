use std::fmt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Identity of one segment file: `<base>.<term>.<start>[.<prevTerm>]`.
/// The `prevTerm` suffix is only present when the owning term's predecessor
/// differs from the term itself, which is exactly the first segment of a
/// term defined over a term boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentName {
    pub term: u64,
    pub start: u64,
    pub prev_term: u64,
}

impl SegmentName {
    pub fn new(prev_term: u64, term: u64, start: u64) -> Self {
        Self {
            term,
            start,
            prev_term,
        }
    }

    pub fn file_path(&self, base: &Path) -> PathBuf {
        let mut name = base.as_os_str().to_os_string();
        name.push(format!(".{}", self));
        PathBuf::from(name)
    }

    /// Parses `<term>.<start>[.<prevTerm>]`, the part after the base name.
    pub fn parse(suffix: &str) -> Option<Self> {
        let mut parts = suffix.split('.');
        let term: u64 = parts.next()?.parse().ok()?;
        let start: u64 = parts.next()?.parse().ok()?;
        let prev_term = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => term,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            term,
            start,
            prev_term,
        })
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prev_term == self.term {
            write!(f, "{}.{}", self.term, self.start)
        } else {
            write!(f, "{}.{}.{}", self.term, self.start, self.prev_term)
        }
    }
}

/// Scans the directory of `base` for segment files belonging to it,
/// returned in no particular order.
pub fn scan_segments(base: &Path) -> crate::error::Result<Vec<(SegmentName, PathBuf, u64)>> {
    let dir = base.parent().unwrap_or_else(|| Path::new("."));
    let base_name = base
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(crate::error::Error::InvalidState("log base has no file name"))?;

    let mut found = Vec::new();
    for entry in WalkDir::new(dir).max_depth(1) {
        let entry = entry.map_err(|e| std::io::Error::from(e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(suffix) = name
            .strip_prefix(base_name)
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };
        if let Some(parsed) = SegmentName::parse(suffix) {
            let len = entry.metadata().map_err(|e| std::io::Error::from(e))?.len();
            found.push((parsed, entry.into_path(), len));
        }
    }

    Ok(found)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_round_trip() {
        let name = SegmentName::new(3, 3, 4096);
        assert_eq!(name.to_string(), "3.4096");
        assert_eq!(SegmentName::parse("3.4096"), Some(name));

        let boundary = SegmentName::new(2, 3, 4096);
        assert_eq!(boundary.to_string(), "3.4096.2");
        assert_eq!(SegmentName::parse("3.4096.2"), Some(boundary));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(SegmentName::parse("3"), None);
        assert_eq!(SegmentName::parse("3.x"), None);
        assert_eq!(SegmentName::parse("3.4.5.6"), None);
        assert_eq!(SegmentName::parse(""), None);
    }

    #[test]
    fn scan_finds_only_matching_base() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("log");
        std::fs::write(tmp.path().join("log.1.0"), b"ab").unwrap();
        std::fs::write(tmp.path().join("log.2.1024.1"), b"cd").unwrap();
        std::fs::write(tmp.path().join("other.1.0"), b"ef").unwrap();
        std::fs::write(tmp.path().join("log.notanumber.0"), b"gh").unwrap();

        let mut found = scan_segments(&base).unwrap();
        found.sort_by_key(|(n, _, _)| (n.term, n.start));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, SegmentName::new(1, 1, 0));
        assert_eq!(found[1].0, SegmentName::new(1, 2, 1024));
        assert_eq!(found[1].2, 2);
    }
}
