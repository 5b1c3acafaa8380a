use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use zerocopy::byteorder::little_endian::U64;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::io::FileIo;
use crate::name::{scan_segments, SegmentName};
use crate::segment::Segment;
use crate::term_log::{LogInfo, LogReader, LogWriter, SegmentSizing, TermLog, UNBOUNDED};

const META_MAGIC: u64 = 0x7265706c_6f674d44;

/// Durable-commit sidecar record, written in place at offset 0 of
/// `<base>.meta`. The checksum is a byte-xor fold of the preceding fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct MetaRecord {
    magic: U64,
    durable_term: U64,
    durable_position: U64,
    checksum: U64,
}

impl MetaRecord {
    fn new(term: u64, position: u64) -> Self {
        let mut rec = MetaRecord {
            magic: META_MAGIC.into(),
            durable_term: term.into(),
            durable_position: position.into(),
            checksum: 0.into(),
        };
        rec.checksum = rec.fold().into();
        rec
    }

    fn fold(&self) -> u64 {
        self.as_bytes()[..24]
            .iter()
            .map(|b| *b as u64)
            .reduce(|a, b| a.rotate_left(8) ^ b)
            .unwrap_or(0)
    }

    fn check(&self) -> bool {
        self.magic.get() == META_MAGIC && self.checksum.get() == self.fold()
    }
}

struct MetaFile {
    file: File,
}

impl MetaFile {
    fn open(base: &Path) -> Result<(MetaFile, Option<(u64, u64)>)> {
        let path = Self::path(base);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut rec = MetaRecord::new_zeroed();
        let recovered = match file.read_at(rec.as_bytes_mut(), 0) {
            Ok(n) if n == std::mem::size_of::<MetaRecord>() && rec.check() => {
                Some((rec.durable_term.get(), rec.durable_position.get()))
            }
            _ => None,
        };
        Ok((MetaFile { file }, recovered))
    }

    fn path(base: &Path) -> PathBuf {
        let mut name = base.as_os_str().to_os_string();
        name.push(".meta");
        PathBuf::from(name)
    }

    fn store(&self, term: u64, position: u64) -> Result<()> {
        let rec = MetaRecord::new(term, position);
        self.file.write_all_at(rec.as_bytes(), 0)?;
        self.file.sync_all()?;
        Ok(())
    }
}

struct Inner {
    terms: BTreeMap<u64, Arc<TermLog>>,
    closed: bool,
}

/// Multi-term wrapper over [`TermLog`]s. Resolves positions to terms,
/// defines and finishes terms, and owns the durable-commit metadata.
pub struct StateLog {
    base: PathBuf,
    min_segment_len: u64,
    max_segment_len: u64,
    inner: RwLock<Inner>,
    /// The highest term log, kept hot for `capture_highest` and the write
    /// path.
    current: ArcSwap<TermLog>,
    meta: Mutex<MetaFile>,
    durable: parking_lot::Mutex<(u64, u64)>,
}

impl StateLog {
    pub fn open(base: impl Into<PathBuf>) -> Result<StateLog> {
        Self::open_with_sizing(base, 1024 * 1024, 64 * 1024 * 1024)
    }

    pub fn open_with_sizing(
        base: impl Into<PathBuf>,
        min_segment_len: u64,
        max_segment_len: u64,
    ) -> Result<StateLog> {
        let base = base.into();
        if let Some(dir) = base.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let (meta, recovered_meta) = MetaFile::open(&base)?;

        // Group recovered segment files by term, then rebuild each term
        // log with contig derived from the tiled file lengths.
        let mut by_term: BTreeMap<u64, Vec<(SegmentName, u64)>> = BTreeMap::new();
        for (name, _path, len) in scan_segments(&base)? {
            by_term.entry(name.term).or_default().push((name, len));
        }

        let mut terms: BTreeMap<u64, Arc<TermLog>> = BTreeMap::new();
        for (term, mut segs) in by_term {
            segs.sort_by_key(|(name, _)| name.start);
            let (first, _) = segs[0];
            let start = first.start;
            let prev_term = first.prev_term;

            let mut segments = BTreeMap::new();
            let mut contig = start;
            let mut tiled = true;
            for (name, len) in &segs {
                let max_len = segment_len_for(min_segment_len, max_segment_len, segments.len());
                let seg = Arc::new(Segment::create(*name, &base, max_len.max(*len)));
                if tiled && name.start == contig {
                    contig += len;
                } else {
                    tiled = false;
                }
                segments.insert(name.start, seg);
            }

            let log = TermLog::with_segments(
                base.clone(),
                prev_term,
                term,
                start,
                SegmentSizing {
                    min_len: min_segment_len,
                    max_len: max_segment_len,
                },
                segments,
                contig,
            );
            terms.insert(start, log);
        }

        if terms.is_empty() {
            let log = TermLog::create(
                base.clone(),
                0,
                0,
                0,
                SegmentSizing {
                    min_len: min_segment_len,
                    max_len: max_segment_len,
                },
            );
            terms.insert(0, log);
        }

        // Every term but the highest ends where its successor starts.
        let starts: Vec<u64> = terms.keys().copied().collect();
        for pair in starts.windows(2) {
            let log = terms.get(&pair[0]).unwrap();
            log.finish(pair[1])?;
        }

        let current = terms.values().next_back().unwrap().clone();
        let log = StateLog {
            base,
            min_segment_len,
            max_segment_len,
            inner: RwLock::new(Inner {
                terms,
                closed: false,
            }),
            current: ArcSwap::new(current),
            meta: Mutex::new(meta),
            durable: parking_lot::Mutex::new((0, 0)),
        };

        if let Some((term, position)) = recovered_meta {
            *log.durable.lock() = (term, position);
            log.commit(position);
        }

        tracing::debug!(
            terms = log.inner.read().terms.len(),
            durable = log.durable.lock().1,
            "state log opened"
        );
        Ok(log)
    }

    fn sizing(&self) -> SegmentSizing {
        SegmentSizing {
            min_len: self.min_segment_len,
            max_len: self.max_segment_len,
        }
    }

    /// The term log covering `position`.
    pub fn term_at(&self, position: u64) -> Option<Arc<TermLog>> {
        let inner = self.inner.read();
        let (_, log) = inner.terms.range(..=position).next_back()?;
        log.covers(position).then(|| log.clone())
    }

    /// The term log whose term number is `term`.
    pub fn term_log(&self, term: u64) -> Option<Arc<TermLog>> {
        let inner = self.inner.read();
        inner
            .terms
            .values()
            .find(|log| log.term() == term)
            .cloned()
    }

    /// Defines a new term rooted at `position` whose predecessor must be
    /// `prev_term`. Returns `None` when the predecessor does not match or
    /// when committed data past `position` forbids the truncation.
    pub fn define_term(
        &self,
        prev_term: u64,
        term: u64,
        position: u64,
    ) -> Result<Option<Arc<TermLog>>> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(Error::Closed);
        }

        if let Some(existing) = inner.terms.values().find(|l| l.term() == term) {
            let matches = existing.start_position() == position
                && existing.prev_term() == prev_term;
            return Ok(matches.then(|| existing.clone()));
        }

        // The predecessor owns the byte just below `position`; a term
        // rooted at an existing term's start replaces that term entirely.
        let pred = inner
            .terms
            .range(..position)
            .next_back()
            .map(|(_, l)| l.clone());
        match &pred {
            Some(pred) => {
                if pred.term() != prev_term || term <= pred.term() {
                    tracing::debug!(
                        term,
                        position,
                        pred = pred.term(),
                        prev_term,
                        "term definition rejected"
                    );
                    return Ok(None);
                }
                let info = pred.info();
                if info.commit > position && info.commit > info.start {
                    return Ok(None);
                }
            }
            // Nothing below the root: a fresh log trusting the leader's
            // predecessor claim (a restored snapshot starts this way).
            None => {}
        }

        // Uncommitted later terms are casualties of the new definition;
        // committed data may never be truncated.
        let later: Vec<u64> = inner.terms.range(position..).map(|(s, _)| *s).collect();
        for start in &later {
            let log = &inner.terms[start];
            let info = log.info();
            if info.commit > info.start {
                return Ok(None);
            }
        }
        for start in later {
            let log = inner.terms.remove(&start).unwrap();
            log.finish(log.start_position())?;
            log.close(true);
            tracing::debug!(term = log.term(), "truncated uncommitted term");
        }
        if let Some(pred) = pred {
            pred.finish(position)?;
        }

        let log = TermLog::create(self.base.clone(), prev_term, term, position, self.sizing());
        inner.terms.insert(position, log.clone());
        self.current.store(inner.terms.values().next_back().unwrap().clone());
        tracing::debug!(prev_term, term, position, "term defined");
        Ok(Some(log))
    }

    /// Routes a writer to the term covering `position`, defining the term
    /// when `position` roots a new one. This is the follower's receive
    /// path: `prev_term` names the term of the byte just below
    /// `position`, so a mid-term chunk carries `prev_term == term` and a
    /// boundary chunk carries the predecessor term.
    pub fn open_writer(
        &self,
        prev_term: u64,
        term: u64,
        position: u64,
    ) -> Result<Option<LogWriter>> {
        if let Some(log) = self.term_log(term) {
            let info = log.info();
            let prev_ok = if position == info.start {
                prev_term == info.prev_term
            } else {
                prev_term == term
            };
            if !prev_ok || position < info.start || position > info.end {
                return Ok(None);
            }
            return Ok(Some(log.open_writer(position)?));
        }
        if prev_term == term {
            // mid-term chunk for a term this log has never seen: the
            // caller has to learn the term boundary first
            return Ok(None);
        }
        let Some(log) = self.define_term(prev_term, term, position)? else {
            return Ok(None);
        };
        Ok(Some(log.open_writer(position)?))
    }

    pub fn open_reader(&self, position: u64) -> Result<LogReader> {
        let log = self
            .term_at(position)
            .ok_or(Error::InvalidState("no term covers the read position"))?;
        Ok(log.open_reader(position))
    }

    /// `(term, highest, appliable)` of the highest term.
    pub fn capture_highest(&self) -> LogInfo {
        self.current.load().info()
    }

    /// Advances commit on every term the position reaches into.
    pub fn commit(&self, position: u64) {
        let inner = self.inner.read();
        for log in inner.terms.values() {
            if log.start_position() < position {
                log.commit(position);
            }
        }
    }

    /// Flushes all dirty segments of all terms.
    pub fn sync(&self) -> Result<()> {
        let logs: Vec<Arc<TermLog>> = self.inner.read().terms.values().cloned().collect();
        for log in logs {
            log.sync()?;
        }
        Ok(())
    }

    /// Fsync-equivalent commit: verifies `(prev_term, term)` and that
    /// `position` does not exceed the term's highest, then syncs and
    /// records durability. Returns `None` when the position is ahead of
    /// the local highest (the remote caller backs off).
    pub fn sync_commit(&self, prev_term: u64, term: u64, position: u64) -> Result<Option<u64>> {
        let Some(log) = self.term_log(term) else {
            return Ok(None);
        };
        if prev_term != term && log.prev_term() != prev_term {
            return Ok(None);
        }
        if position > log.info().highest {
            return Ok(None);
        }
        self.sync()?;
        self.commit_durable(position)?;
        Ok(Some(self.durable_position()))
    }

    /// Records a new durable commit position. Never advances onto a term
    /// that no longer exists, and never past the appliable position.
    pub fn commit_durable(&self, position: u64) -> Result<bool> {
        let Some(log) = self.term_at(position.saturating_sub(1)) else {
            return Ok(false);
        };
        let info = log.info();
        if position > info.appliable() {
            return Ok(false);
        }
        let mut durable = self.durable.lock();
        if position <= durable.1 {
            return Ok(false);
        }
        self.meta.lock().store(log.term(), position)?;
        *durable = (log.term(), position);
        tracing::trace!(position, term = log.term(), "durable commit advanced");
        Ok(true)
    }

    pub fn durable_position(&self) -> u64 {
        self.durable.lock().1
    }

    pub fn is_durable(&self, position: u64) -> bool {
        position <= self.durable_position()
    }

    pub fn is_readable(&self, position: u64) -> bool {
        match self.term_at(position) {
            Some(log) => position < log.info().appliable()
                || position < self.durable_position(),
            None => position < self.durable_position(),
        }
    }

    /// `(prev_term, term, start)` triples for terms overlapping
    /// `[from, to)`, lowest first. This backs `QUERY_TERMS`.
    pub fn term_ranges(&self, from: u64, to: u64) -> Vec<(u64, u64, u64)> {
        let inner = self.inner.read();
        inner
            .terms
            .values()
            .filter(|log| {
                let info = log.info();
                info.start < to && (info.end == UNBOUNDED || info.end > from)
            })
            .map(|log| (log.prev_term(), log.term(), log.start_position()))
            .collect()
    }

    /// Compacts every term up to `position`, dropping fully consumed
    /// terms (except the highest, which always survives).
    pub fn compact(&self, position: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let last_start = *inner.terms.keys().next_back().unwrap();
        let mut consumed = Vec::new();
        for (start, log) in inner.terms.iter() {
            if log.compact(position)? && *start != last_start {
                consumed.push(*start);
            }
        }
        for start in consumed {
            let log = inner.terms.remove(&start).unwrap();
            log.close(true);
            tracing::debug!(term = log.term(), "term fully compacted");
        }
        Ok(())
    }

    /// Missing byte ranges across every term, lowest first, for the
    /// missing-data tick. A freshly rooted term can leave holes in its
    /// predecessor, so all terms are inspected.
    pub fn missing_ranges(&self, max: usize) -> Vec<(u64, u64)> {
        let logs: Vec<Arc<TermLog>> = self.inner.read().terms.values().cloned().collect();
        let mut ranges = Vec::new();
        for log in logs {
            if ranges.len() >= max {
                break;
            }
            ranges.extend(log.missing_ranges(max - ranges.len()));
        }
        ranges
    }

    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        for log in inner.terms.values() {
            log.close(false);
        }
    }
}

fn segment_len_for(min_len: u64, max_len: u64, count: usize) -> u64 {
    let shift = (count as u32).min(min_len.leading_zeros());
    (min_len << shift).min(max_len)
}
