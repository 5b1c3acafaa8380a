use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::io::FileIo;
use crate::name::SegmentName;

/// One bounded file backing `[start, start + max_len)` of a single term.
///
/// The file handle is opened lazily and dropped again when the last
/// reference goes away, so a long-lived cursor never pins an idle file.
/// `max_len` can only shrink: `set_end_position` is how a finished term
/// clips its tail segment.
pub struct Segment {
    name: SegmentName,
    path: PathBuf,
    start: u64,
    max_len: AtomicU64,
    dirty: AtomicBool,
    /// Set while the segment sits in its term log's dirty FIFO.
    enlisted: AtomicBool,
    refs: AtomicU64,
    file: Mutex<FileSlot>,
}

enum FileSlot {
    Closed,
    Open(File),
    /// Permanently closed; reopen is refused.
    Dead,
}

impl Segment {
    pub fn create(name: SegmentName, base: &std::path::Path, max_len: u64) -> Segment {
        Segment {
            path: name.file_path(base),
            name,
            start: name.start,
            max_len: AtomicU64::new(max_len),
            dirty: AtomicBool::new(false),
            enlisted: AtomicBool::new(false),
            refs: AtomicU64::new(0),
            file: Mutex::new(FileSlot::Closed),
        }
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    pub fn start_position(&self) -> u64 {
        self.start
    }

    /// Exclusive end of the range this segment may hold.
    pub fn end_position(&self) -> u64 {
        self.start + self.max_len.load(Ordering::Acquire)
    }

    pub fn max_len(&self) -> u64 {
        self.max_len.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks the segment as sitting in a dirty FIFO. Returns false if it
    /// already was, so each segment is enqueued at most once.
    pub(crate) fn enlist_dirty(&self) -> bool {
        !self.enlisted.swap(true, Ordering::AcqRel)
    }

    pub fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last reference: drop the handle if it is clean. A dirty
            // handle stays open until the next sync flushes it.
            if !self.is_dirty() {
                let mut slot = self.file.lock();
                if self.refs.load(Ordering::Acquire) == 0 {
                    if let FileSlot::Open(_) = &*slot {
                        *slot = FileSlot::Closed;
                    }
                }
            }
        }
    }

    fn with_file<R>(&self, f: impl FnOnce(&File) -> std::io::Result<R>) -> Result<R> {
        let mut slot = self.file.lock();
        match &*slot {
            FileSlot::Open(file) => Ok(f(file)?),
            FileSlot::Dead => Err(Error::Closed),
            FileSlot::Closed => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&self.path)?;
                let res = f(&file)?;
                *slot = FileSlot::Open(file);
                Ok(res)
            }
        }
    }

    /// Writes within segment bounds, returning the bytes actually written.
    /// A write crossing the end of the segment is clipped; a write at or
    /// past the end writes nothing.
    pub fn write(&self, position: u64, buf: &[u8]) -> Result<usize> {
        let end = self.end_position();
        if position < self.start || position >= end {
            return Ok(0);
        }
        let n = buf.len().min((end - position) as usize);
        self.with_file(|file| file.write_all_at(&buf[..n], position - self.start))?;
        self.dirty.store(true, Ordering::Release);
        Ok(n)
    }

    /// Reads within segment bounds; returns 0 at end-of-segment.
    pub fn read(&self, position: u64, buf: &mut [u8]) -> Result<usize> {
        let end = self.end_position();
        if position < self.start || position >= end {
            return Ok(0);
        }
        let n = buf.len().min((end - position) as usize);
        let n = self.with_file(|file| file.read_at(&mut buf[..n], position - self.start))?;
        Ok(n)
    }

    /// Flushes dirty bytes. The dirty flag is cleared up front and
    /// restored on failure, so a concurrent write can never be lost.
    pub fn sync(&self) -> Result<()> {
        self.enlisted.store(false, Ordering::Release);
        if self.dirty.swap(false, Ordering::AcqRel) {
            let res = self.with_file(|file| file.sync_all());
            if res.is_err() {
                self.dirty.store(true, Ordering::Release);
            }
            res?;
        }
        Ok(())
    }

    /// Lowers the writable end of the segment. Returns whether a physical
    /// truncate is now required.
    pub fn set_end_position(&self, position: u64) -> bool {
        let new_len = position.saturating_sub(self.start);
        let prev = self.max_len.load(Ordering::Acquire);
        if new_len >= prev {
            return false;
        }
        self.max_len.store(new_len, Ordering::Release);
        true
    }

    /// Shrinks the file to the current `max_len`, or deletes it when the
    /// segment was clipped to nothing.
    pub fn truncate(&self) -> Result<()> {
        let len = self.max_len();
        if len == 0 {
            self.delete()
        } else {
            self.with_file(|file| FileIo::set_len(file, len))
        }
    }

    /// Permanently closes the segment and removes its file.
    pub fn delete(&self) -> Result<()> {
        {
            let mut slot = self.file.lock();
            *slot = FileSlot::Dead;
        }
        self.dirty.store(false, Ordering::Release);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the file handle. A permanent close refuses any reopen.
    pub fn close(&self, permanent: bool) {
        let mut slot = self.file.lock();
        *slot = if permanent {
            FileSlot::Dead
        } else {
            FileSlot::Closed
        };
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("max_len", &self.max_len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn segment(start: u64, max_len: u64) -> (tempfile::TempDir, Segment) {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("log");
        let seg = Segment::create(SegmentName::new(1, 1, start), &base, max_len);
        (tmp, seg)
    }

    #[test]
    fn bounded_write_and_read() {
        let (_tmp, seg) = segment(100, 16);

        assert_eq!(seg.write(100, b"hello").unwrap(), 5);
        // crossing the end is clipped
        assert_eq!(seg.write(110, b"0123456789").unwrap(), 6);
        // at the end writes nothing
        assert_eq!(seg.write(116, b"x").unwrap(), 0);

        let mut buf = [0u8; 5];
        assert_eq!(seg.read(100, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(seg.read(116, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sync_clears_dirty() {
        let (_tmp, seg) = segment(0, 64);
        assert!(!seg.is_dirty());
        seg.write(0, b"abc").unwrap();
        assert!(seg.is_dirty());
        seg.sync().unwrap();
        assert!(!seg.is_dirty());
    }

    #[test]
    fn clip_and_truncate() {
        let (_tmp, seg) = segment(0, 64);
        seg.write(0, &[7u8; 64]).unwrap();

        assert!(seg.set_end_position(10));
        // raising the end back is refused
        assert!(!seg.set_end_position(20));
        seg.truncate().unwrap();
        assert_eq!(seg.end_position(), 10);

        let mut buf = [0u8; 64];
        assert_eq!(seg.read(0, &mut buf).unwrap(), 10);
    }

    #[test]
    fn truncate_to_zero_deletes() {
        let (tmp, seg) = segment(50, 64);
        seg.write(50, b"data").unwrap();
        let path = tmp.path().join("log.1.50");
        assert!(path.exists());

        seg.set_end_position(50);
        seg.truncate().unwrap();
        assert!(!path.exists());
        assert_eq!(seg.max_len(), 0);
    }

    #[test]
    fn permanent_close_refuses_reopen() {
        let (_tmp, seg) = segment(0, 64);
        seg.write(0, b"abc").unwrap();
        seg.close(false);
        // transient close reopens fine
        let mut buf = [0u8; 3];
        assert_eq!(seg.read(0, &mut buf).unwrap(), 3);

        seg.close(true);
        assert!(matches!(seg.read(0, &mut buf), Err(Error::Closed)));
    }
}
