use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use priority_queue::PriorityQueue;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::name::SegmentName;
use crate::segment::Segment;

/// `end` of a term that has not been finished yet.
pub const UNBOUNDED: u64 = u64::MAX;

/// Outcome of [`TermLog::wait_for_commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitWait {
    /// The appliable commit reached the waited-for position; carries the
    /// appliable position observed at wake-up.
    Reached(u64),
    /// The term ended (or the log closed) below the waited-for position.
    TermEnded,
    TimedOut,
}

/// Snapshot of reader-visible progress, published through a watch channel
/// so waiters park without holding the log latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub appliable: u64,
    pub contig: u64,
    pub end: u64,
    pub closed: bool,
}

/// Point-in-time view of a term log's positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogInfo {
    pub prev_term: u64,
    pub term: u64,
    pub start: u64,
    pub commit: u64,
    pub highest: u64,
    pub contig: u64,
    pub end: u64,
}

impl LogInfo {
    pub fn appliable(&self) -> u64 {
        self.commit.min(self.highest)
    }
}

pub(crate) struct SegmentSizing {
    pub min_len: u64,
    pub max_len: u64,
}

impl SegmentSizing {
    fn len_for(&self, segment_count: usize) -> u64 {
        let shift = (segment_count as u32).min(self.min_len.leading_zeros());
        (self.min_len << shift).min(self.max_len)
    }
}

impl Default for SegmentSizing {
    fn default() -> Self {
        Self {
            min_len: 1024 * 1024,
            max_len: 64 * 1024 * 1024,
        }
    }
}

struct WriterShared {
    start: u64,
    position: AtomicU64,
    /// Highest hint observed by this writer, folded into the term highest
    /// when the writer joins the contiguous region.
    highest: AtomicU64,
}

/// Heap entry identity: one per open writer, compared by allocation.
#[derive(Clone)]
struct WriterRef(Arc<WriterShared>);

impl PartialEq for WriterRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for WriterRef {}

impl Hash for WriterRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

struct LogState {
    commit: u64,
    highest: u64,
    contig: u64,
    end: u64,
    finished: bool,
    closed: bool,
    segments: BTreeMap<u64, Arc<Segment>>,
    /// Writers rooted above `contig`, keyed min-first by their start.
    non_contig: PriorityQueue<WriterRef, Reverse<u64>>,
}

impl LogState {
    fn appliable(&self) -> u64 {
        self.commit.min(self.highest)
    }

    fn progress(&self) -> Progress {
        Progress {
            appliable: self.appliable(),
            contig: self.contig,
            end: if self.finished { self.end } else { UNBOUNDED },
            closed: self.closed,
        }
    }
}

/// Append log for a single term.
///
/// Tracks the classic triple: `contig` (everything below is written),
/// `highest` (everything below could be applied, respecting message
/// boundaries) and `commit` (cluster consensus). Readers may consume up to
/// `min(commit, highest)`.
pub struct TermLog {
    base: PathBuf,
    prev_term: u64,
    term: u64,
    start: u64,
    sizing: SegmentSizing,
    state: RwLock<LogState>,
    /// FIFO of dirty segments under its own latch so `sync` never starves
    /// concurrent writes.
    dirty: Mutex<VecDeque<Arc<Segment>>>,
    progress: watch::Sender<Progress>,
}

impl TermLog {
    pub(crate) fn create(
        base: PathBuf,
        prev_term: u64,
        term: u64,
        start: u64,
        sizing: SegmentSizing,
    ) -> Arc<TermLog> {
        Self::with_segments(base, prev_term, term, start, sizing, BTreeMap::new(), start)
    }

    /// Restores a term log from recovered segments. `contig` must already
    /// be derived from the tiled segment lengths.
    pub(crate) fn with_segments(
        base: PathBuf,
        prev_term: u64,
        term: u64,
        start: u64,
        sizing: SegmentSizing,
        segments: BTreeMap<u64, Arc<Segment>>,
        contig: u64,
    ) -> Arc<TermLog> {
        let state = LogState {
            commit: start,
            highest: contig,
            contig,
            end: UNBOUNDED,
            finished: false,
            closed: false,
            segments,
            non_contig: PriorityQueue::new(),
        };
        let (progress, _) = watch::channel(state.progress());
        Arc::new(TermLog {
            base,
            prev_term,
            term,
            start,
            sizing,
            state: RwLock::new(state),
            dirty: Mutex::new(VecDeque::new()),
            progress,
        })
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn prev_term(&self) -> u64 {
        self.prev_term
    }

    pub fn start_position(&self) -> u64 {
        self.start
    }

    pub fn info(&self) -> LogInfo {
        let st = self.state.read();
        LogInfo {
            prev_term: self.prev_term,
            term: self.term,
            start: self.start,
            commit: st.commit,
            highest: st.highest,
            contig: st.contig,
            end: st.end,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.read().finished
    }

    /// Exclusive end, `UNBOUNDED` until finished.
    pub fn end_position(&self) -> u64 {
        self.state.read().end
    }

    /// Whether `position` falls inside this term's range.
    pub fn covers(&self, position: u64) -> bool {
        let st = self.state.read();
        position >= self.start && position < st.end
    }

    /// Opens a writer rooted at `start`. A writer rooted above `contig`
    /// is queued in the non-contiguous heap until the region below it is
    /// filled in.
    pub fn open_writer(self: &Arc<Self>, start: u64) -> Result<LogWriter> {
        let mut st = self.state.write();
        if st.closed {
            return Err(Error::Closed);
        }
        if start < self.start || start > st.end {
            return Err(Error::InvalidState("writer start outside term range"));
        }
        let shared = Arc::new(WriterShared {
            start,
            position: AtomicU64::new(start),
            highest: AtomicU64::new(start),
        });
        if start > st.contig {
            st.non_contig
                .push(WriterRef(shared.clone()), Reverse(start));
        }
        Ok(LogWriter {
            log: self.clone(),
            shared,
        })
    }

    pub fn open_reader(self: &Arc<Self>, start: u64) -> LogReader {
        LogReader {
            progress: self.progress.subscribe(),
            log: self.clone(),
            position: start.max(self.start),
        }
    }

    /// Finds the segment covering `position`, allocating a new one when
    /// the position lies past every existing tile. Returns `None` once
    /// `position` is at or past the finished end.
    fn segment_for(&self, position: u64) -> Result<Option<Arc<Segment>>> {
        {
            let st = self.state.read();
            if position >= st.end {
                return Ok(None);
            }
            if let Some((_, seg)) = st.segments.range(..=position).next_back() {
                if position < seg.end_position() {
                    return Ok(Some(seg.clone()));
                }
            }
        }

        let mut st = self.state.write();
        if st.closed {
            return Err(Error::Closed);
        }
        if position >= st.end {
            return Ok(None);
        }
        // re-check under the exclusive latch
        if let Some((_, seg)) = st.segments.range(..=position).next_back() {
            if position < seg.end_position() {
                return Ok(Some(seg.clone()));
            }
        }

        // Tile a new segment at `position`, clipped so it can never
        // overlap a segment allocated further ahead by a non-contiguous
        // writer.
        let mut len = self.sizing.len_for(st.segments.len());
        if let Some((next_start, _)) = st.segments.range(position + 1..).next() {
            len = len.min(next_start - position);
        }
        if st.end != UNBOUNDED {
            len = len.min(st.end - position);
        }
        let name = SegmentName::new(self.prev_term, self.term, position);
        let seg = Arc::new(Segment::create(name, &self.base, len));
        st.segments.insert(position, seg.clone());
        tracing::trace!(term = self.term, start = position, len, "allocated segment");
        Ok(Some(seg))
    }

    fn write_at(&self, mut position: u64, mut data: &[u8]) -> Result<u64> {
        while !data.is_empty() {
            let Some(seg) = self.segment_for(position)? else {
                // past the finished end, remainder is discarded
                break;
            };
            seg.acquire();
            let res = seg.write(position, data);
            let newly_dirty = seg.enlist_dirty();
            if newly_dirty {
                self.dirty.lock().push_back(seg.clone());
            }
            seg.release();
            let n = res?;
            if n == 0 {
                break;
            }
            position += n as u64;
            data = &data[n..];
        }
        Ok(position)
    }

    fn write_finished(&self, shared: &WriterShared, new_pos: u64, highest_hint: u64) {
        let mut st = self.state.write();
        let new_pos = new_pos.min(st.end);
        let mut hint = highest_hint.min(st.end);
        shared.position.store(new_pos, Ordering::Relaxed);
        shared.highest.store(hint.max(shared.start), Ordering::Relaxed);

        if shared.start <= st.contig {
            if new_pos > st.contig {
                st.contig = new_pos;
            }
            // Writers that the new contig swallowed extend it further;
            // their hints count as if they had just finished too.
            while let Some((top, _)) = st.non_contig.peek() {
                if top.0.start > st.contig {
                    break;
                }
                let (w, _) = st.non_contig.pop().unwrap();
                let pos = w.0.position.load(Ordering::Relaxed).min(st.end);
                if pos > st.contig {
                    st.contig = pos;
                }
                hint = hint.max(w.0.highest.load(Ordering::Relaxed).min(st.end));
            }
        }

        if st.contig == st.end || st.contig <= st.commit {
            st.highest = st.contig;
        } else if hint <= st.contig {
            st.highest = st.highest.max(hint);
        }

        self.publish(&st);
    }

    fn publish(&self, st: &LogState) {
        let next = st.progress();
        self.progress.send_if_modified(|cur| {
            if *cur != next {
                *cur = next;
                true
            } else {
                false
            }
        });
    }

    /// Raises the commit position, clamped by the finished end.
    pub fn commit(&self, position: u64) {
        let mut st = self.state.write();
        let position = position.min(st.end);
        if position > st.commit {
            st.commit = position;
            if st.highest < position {
                st.highest = position.min(st.contig);
            }
            self.publish(&st);
        }
    }

    /// Finishes the term at `end`. Segments past `end` are truncated or
    /// deleted, non-contiguous writers are evicted or clipped, and waiters
    /// beyond `end` observe the term-end signal.
    pub fn finish(&self, end: u64) -> Result<u64> {
        let mut doomed = Vec::new();
        {
            let mut st = self.state.write();
            if st.closed {
                return Err(Error::Closed);
            }
            if st.finished {
                if end == st.end {
                    return Ok(st.end);
                }
                if end > st.end {
                    return Err(Error::InvalidState(
                        "cannot raise the end of a finished term",
                    ));
                }
            }
            if end < st.commit && st.commit > self.start {
                return Err(Error::InvalidState("finish below committed position"));
            }
            let end = end.max(self.start);
            st.end = end;
            st.finished = true;
            st.contig = st.contig.min(end);
            st.highest = st.highest.min(end);
            st.commit = st.commit.min(end);

            let clipped: Vec<u64> = st.segments.range(end..).map(|(s, _)| *s).collect();
            for seg_start in clipped {
                let seg = st.segments.remove(&seg_start).unwrap();
                doomed.push(seg);
            }
            if let Some((_, seg)) = st.segments.range(..end).next_back() {
                if seg.set_end_position(end) {
                    seg.truncate()?;
                }
            }

            // Evict writers rooted past the end; clip the ones spanning
            // it so a later drain can never overadvance contig.
            let survivors: Vec<(WriterRef, Reverse<u64>)> = st
                .non_contig
                .iter()
                .filter(|(w, _)| w.0.start < end)
                .map(|(w, p)| (w.clone(), *p))
                .collect();
            let mut heap = PriorityQueue::new();
            for (w, p) in survivors {
                let pos = w.0.position.load(Ordering::Relaxed);
                w.0.position.store(pos.min(end), Ordering::Relaxed);
                let hi = w.0.highest.load(Ordering::Relaxed);
                w.0.highest.store(hi.min(end), Ordering::Relaxed);
                heap.push(w, p);
            }
            st.non_contig = heap;

            self.publish(&st);
        }

        for seg in doomed {
            seg.delete()?;
        }
        Ok(end.max(self.start))
    }

    /// Removes and deletes whole segments at or below `position`. Returns
    /// whether the term is fully consumed: finished, compacted past its
    /// end, with no segments left.
    pub fn compact(&self, position: u64) -> Result<bool> {
        let mut doomed = Vec::new();
        let consumed;
        {
            let mut st = self.state.write();
            let removable: Vec<u64> = st
                .segments
                .iter()
                .filter(|(_, seg)| seg.end_position() <= position)
                .map(|(s, _)| *s)
                .collect();
            for seg_start in removable {
                doomed.push(st.segments.remove(&seg_start).unwrap());
            }
            consumed = st.finished && position >= st.end && st.segments.is_empty();
        }
        for seg in doomed {
            tracing::debug!(term = self.term, start = seg.start_position(), "compacting segment");
            seg.delete()?;
        }
        Ok(consumed)
    }

    /// Flushes every dirty segment, FIFO. Writes arriving during the
    /// flush re-enqueue their segment; only the sync latch is held here.
    pub fn sync(&self) -> Result<()> {
        loop {
            let seg = { self.dirty.lock().pop_front() };
            match seg {
                None => return Ok(()),
                Some(seg) => {
                    if let Err(e) = seg.sync() {
                        self.dirty.lock().push_front(seg);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Waits until the appliable commit reaches `position`, the term ends
    /// below it, the log closes, or the timeout expires.
    pub async fn wait_for_commit(&self, position: u64, timeout: Duration) -> CommitWait {
        let mut rx = self.progress.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|p| p.closed || p.appliable >= position || p.end < position),
        )
        .await;
        match waited {
            Err(_) => CommitWait::TimedOut,
            Ok(Err(_)) => CommitWait::TermEnded,
            Ok(Ok(p)) => {
                if p.appliable >= position {
                    CommitWait::Reached(p.appliable)
                } else {
                    CommitWait::TermEnded
                }
            }
        }
    }

    /// Missing `[from, to)` ranges between `contig` and data known to
    /// exist above it: non-contiguous writer extents, the commit
    /// position the leader advertised, and the full range of a finished
    /// term. At most `max` ranges are returned.
    pub fn missing_ranges(&self, max: usize) -> Vec<(u64, u64)> {
        let st = self.state.read();
        let mut above: Vec<(u64, u64)> = st
            .non_contig
            .iter()
            .map(|(w, _)| {
                (
                    w.0.start,
                    w.0.position.load(Ordering::Relaxed),
                )
            })
            .collect();
        above.sort_unstable();

        let mut ranges = Vec::new();
        let mut from = st.contig;
        for (start, pos) in above {
            if ranges.len() == max {
                return ranges;
            }
            if start > from {
                ranges.push((from, start));
            }
            from = from.max(pos);
        }
        let known = if st.finished {
            st.end
        } else {
            st.commit.min(st.end)
        };
        if known > from && ranges.len() < max {
            ranges.push((from, known));
        }
        ranges
    }

    /// Closes the log: waiters observe the term-end signal and segment
    /// handles are released.
    pub fn close(&self, permanent: bool) {
        let mut st = self.state.write();
        st.closed = true;
        for seg in st.segments.values() {
            seg.close(permanent);
        }
        self.publish(&st);
    }
}

impl std::fmt::Debug for TermLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info();
        f.debug_struct("TermLog")
            .field("term", &self.term)
            .field("start", &self.start)
            .field("commit", &info.commit)
            .field("highest", &info.highest)
            .field("contig", &info.contig)
            .field("end", &info.end)
            .finish()
    }
}

/// Exclusive cursor appending bytes to one term log.
pub struct LogWriter {
    log: Arc<TermLog>,
    shared: Arc<WriterShared>,
}

impl LogWriter {
    pub fn term(&self) -> u64 {
        self.log.term
    }

    pub fn prev_term(&self) -> u64 {
        self.log.prev_term
    }

    pub fn start(&self) -> u64 {
        self.shared.start
    }

    /// Published position; safe to read from any thread.
    pub fn position(&self) -> u64 {
        self.shared.position.load(Ordering::Relaxed)
    }

    pub fn log(&self) -> &Arc<TermLog> {
        &self.log
    }

    /// Appends `data` at the writer position. `highest_hint` is the
    /// caller's message-boundary hint; pass the resulting end position for
    /// self-contained messages. Bytes past a finished end are discarded.
    pub fn write(&mut self, data: &[u8], highest_hint: u64) -> Result<u64> {
        let position = self.shared.position.load(Ordering::Relaxed);
        let new_pos = self.log.write_at(position, data)?;
        self.log.write_finished(&self.shared, new_pos, highest_hint);
        Ok(self.shared.position.load(Ordering::Relaxed))
    }

    pub async fn wait_for_commit(&self, position: u64, timeout: Duration) -> CommitWait {
        self.log.wait_for_commit(position, timeout).await
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let mut st = self.log.state.write();
        st.non_contig.remove(&WriterRef(self.shared.clone()));
    }
}

/// Cursor reading committed bytes from one term log.
pub struct LogReader {
    log: Arc<TermLog>,
    position: u64,
    progress: watch::Receiver<Progress>,
}

impl LogReader {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn term(&self) -> u64 {
        self.log.term
    }

    fn read_below(&mut self, limit: u64, buf: &mut [u8]) -> Result<usize> {
        if self.position >= limit {
            return Ok(0);
        }
        let want = buf.len().min((limit - self.position) as usize);
        let seg = {
            let st = self.log.state.read();
            match st.segments.range(..=self.position).next_back() {
                Some((_, seg)) if self.position < seg.end_position() => seg.clone(),
                _ => {
                    return Err(Error::InvalidState(
                        "no segment below the appliable position",
                    ))
                }
            }
        };
        seg.acquire();
        let res = seg.read(self.position, &mut buf[..want]);
        seg.release();
        let n = res?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "segment shorter than contig",
            )
            .into());
        }
        self.position += n as u64;
        Ok(n)
    }

    /// Waits until committed bytes are available past the cursor, then
    /// reads. Returns 0 only when the term ended at or below the cursor.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let p = *self.progress.borrow_and_update();
            if self.position < p.appliable {
                return self.read_below(p.appliable, buf);
            }
            if p.closed || p.end <= self.position {
                return Ok(0);
            }
            if self.progress.changed().await.is_err() {
                return Ok(0);
            }
        }
    }

    /// Reads committed bytes without waiting; 0 when none are available.
    pub fn try_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let appliable = self.progress.borrow().appliable;
        self.read_below(appliable, buf)
    }

    /// Reads written-but-not-necessarily-committed bytes, up to `contig`.
    /// This is what a leader uses to feed replication.
    pub fn try_read_any(&mut self, buf: &mut [u8]) -> Result<usize> {
        let contig = self.log.state.read().contig;
        self.read_below(contig, buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn log_at(tmp: &tempfile::TempDir, prev: u64, term: u64, start: u64) -> Arc<TermLog> {
        TermLog::create(
            tmp.path().join("log"),
            prev,
            term,
            start,
            SegmentSizing {
                min_len: 1024,
                max_len: 64 * 1024,
            },
        )
    }

    fn invariants(log: &TermLog) {
        let info = log.info();
        assert!(info.start <= info.contig, "start <= contig: {info:?}");
        assert!(info.contig <= info.end, "contig <= end: {info:?}");
        assert!(info.highest <= info.contig, "highest <= contig: {info:?}");
        assert_eq!(info.appliable(), info.commit.min(info.highest));
        let st = log.state.read();
        for (start, seg) in st.segments.iter() {
            assert!(info.start <= *start);
            assert!(seg.end_position() <= info.end || info.end == UNBOUNDED);
        }
    }

    #[tokio::test]
    async fn contiguous_append_advances_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);

        let mut w = log.open_writer(0).unwrap();
        w.write(&[1u8; 100], 100).unwrap();
        invariants(&log);

        let info = log.info();
        assert_eq!(info.contig, 100);
        // nothing committed yet: the hint parks at highest
        assert_eq!(info.highest, 100);
        assert_eq!(info.appliable(), 0);

        log.commit(100);
        assert_eq!(log.info().appliable(), 100);

        let mut r = log.open_reader(0);
        let mut buf = [0u8; 100];
        assert_eq!(r.read(&mut buf).await.unwrap(), 100);
        assert_eq!(buf, [1u8; 100]);
        invariants(&log);
    }

    #[tokio::test]
    async fn segments_tile_and_double() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);
        let mut w = log.open_writer(0).unwrap();
        // crosses the first (1 KiB) segment into the second (2 KiB)
        w.write(&[7u8; 2500], 2500).unwrap();
        invariants(&log);

        let st = log.state.read();
        let bounds: Vec<(u64, u64)> = st
            .segments
            .values()
            .map(|s| (s.start_position(), s.end_position()))
            .collect();
        assert_eq!(bounds, vec![(0, 1024), (1024, 3072)]);
    }

    #[tokio::test]
    async fn non_contig_jump_wakes_waiters_once() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);
        log.commit(4000);

        let mut far = log.open_writer(2000).unwrap();
        far.write(&[2u8; 2000], 4000).unwrap();
        invariants(&log);
        assert_eq!(log.info().contig, 0);
        assert_eq!(log.info().appliable(), 0);

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_for_commit(4000, Duration::from_secs(5)).await })
        };

        let mut near = log.open_writer(0).unwrap();
        near.write(&[1u8; 2000], 2000).unwrap();
        invariants(&log);

        // contig jumped 0 -> 4000 in one writeFinished
        let info = log.info();
        assert_eq!(info.contig, 4000);
        assert_eq!(info.highest, 4000);
        assert_eq!(waiter.await.unwrap(), CommitWait::Reached(4000));

        let mut r = log.open_reader(0);
        let mut buf = vec![0u8; 4000];
        let mut read = 0;
        while read < 4000 {
            read += r.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..2000], &[1u8; 2000][..]);
        assert_eq!(&buf[2000..], &[2u8; 2000][..]);
    }

    #[tokio::test]
    async fn rewrite_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);
        let mut w = log.open_writer(0).unwrap();
        w.write(b"hello world", 11).unwrap();
        log.commit(11);

        // identical bytes at the same position: a no-op for positions
        let mut again = log.open_writer(0).unwrap();
        again.write(b"hello world", 11).unwrap();
        let info = log.info();
        assert_eq!(info.contig, 11);
        assert_eq!(info.appliable(), 11);

        let mut r = log.open_reader(0);
        let mut buf = [0u8; 11];
        r.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn finish_clips_spanning_writer() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);

        let mut near = log.open_writer(0).unwrap();
        near.write(&[1u8; 50], 50).unwrap();

        let mut spanning = log.open_writer(100).unwrap();
        spanning.write(&[2u8; 400], 500).unwrap(); // [100, 500)
        invariants(&log);

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_for_commit(400, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(log.finish(300).unwrap(), 300);
        invariants(&log);
        assert_eq!(log.end_position(), 300);
        // waiters past the end observe the term-end signal
        assert_eq!(waiter.await.unwrap(), CommitWait::TermEnded);

        // later data from the spanning writer is discarded
        spanning.write(&[3u8; 100], 600).unwrap();
        assert_eq!(spanning.position(), 300);

        // fill the hole: contig stops exactly at the clipped end
        near.write(&[1u8; 50], 100).unwrap();
        let mut filler = log.open_writer(50).unwrap();
        filler.write(&[1u8; 50], 100).unwrap();
        invariants(&log);
        assert_eq!(log.info().contig, 300);

        // finishing again with the same end is a no-op
        assert_eq!(log.finish(300).unwrap(), 300);
        assert!(matches!(log.finish(400), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn finish_below_commit_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);
        let mut w = log.open_writer(0).unwrap();
        w.write(&[0u8; 200], 200).unwrap();
        log.commit(200);
        assert!(matches!(log.finish(100), Err(Error::InvalidState(_))));
        assert_eq!(log.finish(200).unwrap(), 200);
    }

    #[tokio::test]
    async fn compact_is_monotone_and_reports_consumed() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);
        let mut w = log.open_writer(0).unwrap();
        w.write(&[9u8; 3000], 3000).unwrap();
        log.commit(3000);
        log.finish(3000).unwrap();

        assert!(!log.compact(1024).unwrap());
        assert!(!log.compact(1024).unwrap()); // idempotent
        {
            let st = log.state.read();
            assert_eq!(st.segments.len(), 1);
        }
        assert!(log.compact(4000).unwrap());
        assert!(log.compact(4000).unwrap());
    }

    #[tokio::test]
    async fn wait_for_commit_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);
        assert_eq!(
            log.wait_for_commit(10, Duration::from_millis(20)).await,
            CommitWait::TimedOut
        );
        log.close(false);
        assert_eq!(
            log.wait_for_commit(10, Duration::from_secs(5)).await,
            CommitWait::TermEnded
        );
    }

    #[tokio::test]
    async fn missing_ranges_cover_holes() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);

        let mut far = log.open_writer(2000).unwrap();
        far.write(&[0u8; 500], 2500).unwrap();
        log.commit(4000);

        let ranges = log.missing_ranges(8);
        assert_eq!(ranges, vec![(0, 2000), (2500, 4000)]);

        // holes filled: nothing missing below commit
        let mut near = log.open_writer(0).unwrap();
        near.write(&[0u8; 2000], 2000).unwrap();
        let mut tail = log.open_writer(2500).unwrap();
        tail.write(&[0u8; 1500], 4000).unwrap();
        assert!(log.missing_ranges(8).is_empty());
    }

    #[tokio::test]
    async fn dirty_fifo_sync() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log_at(&tmp, 1, 1, 0);
        let mut w = log.open_writer(0).unwrap();
        w.write(&[1u8; 2048], 2048).unwrap();
        {
            let dirty = log.dirty.lock();
            assert_eq!(dirty.len(), 2);
        }
        log.sync().unwrap();
        assert!(log.dirty.lock().is_empty());
        let st = log.state.read();
        assert!(st.segments.values().all(|s| !s.is_dirty()));
    }
}
