//! Paged file mapping
//!
//! A store file is addressed as a sequence of 1 GiB segments, each mapped
//! on demand and kept mapped until the store is torn down. Readers hold
//! `Arc<SegmentMap>` handles, so a segment that has been re-mapped after
//! the file grew stays valid for anyone still holding the old handle.
//!
//! Mutation never goes through the mappings: the transaction layer buffers
//! page images and writes them with positional file writes at commit, which
//! is what lets concurrent readers keep their pre-transaction snapshot.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// log2 of the segment size.
pub const SEGMENT_SHIFT: u32 = 30;

/// Mapping granularity: 1 GiB.
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_SHIFT;

/// Cap on the number of segments (4 TiB addressable).
pub const MAX_SEGMENTS: usize = 4096;

/// One mapped 1 GiB window of the store file.
#[derive(Debug)]
pub struct SegmentMap {
    index: u32,
    map: Mmap,
}

impl SegmentMap {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// The store file plus its lazily-populated segment table.
#[derive(Debug)]
pub struct Mapping {
    path: PathBuf,
    file: File,
    segments: RwLock<Vec<Option<Arc<SegmentMap>>>>,
}

impl Mapping {
    /// Open an existing store file. Fails with `FileNotFound` if the path
    /// does not exist; `writable` also opens the file for positional
    /// writes (required to begin transactions).
    pub fn open(path: &Path, writable: bool) -> Result<Mapping> {
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Ok(Mapping {
            path: path.to_path_buf(),
            file,
            segments: RwLock::new(Vec::new()),
        })
    }

    /// Create a new, empty store file. Fails if the path already exists.
    pub fn create(path: &Path) -> Result<Mapping> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Mapping {
            path: path.to_path_buf(),
            file,
            segments: RwLock::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// The mapping for segment `index`, mapping it on first use.
    pub fn segment(&self, index: u32) -> Result<Arc<SegmentMap>> {
        if let Some(seg) = self.segments.read().get(index as usize).and_then(|s| s.clone()) {
            return Ok(seg);
        }
        self.map_segment(index)
    }

    fn map_segment(&self, index: u32) -> Result<Arc<SegmentMap>> {
        let mut segments = self.segments.write();
        // Another thread may have won the race while we waited for the lock.
        if let Some(seg) = segments.get(index as usize).and_then(|s| s.clone()) {
            return Ok(seg);
        }
        if index as usize >= MAX_SEGMENTS {
            return Err(Error::InvalidFormat(format!(
                "segment {} beyond addressable limit",
                index
            )));
        }
        let offset = (index as u64) << SEGMENT_SHIFT;
        let file_len = self.file.metadata()?.len();
        if offset >= file_len {
            return Err(Error::InvalidFormat(format!(
                "segment {} starts at {} beyond end of file ({})",
                index, offset, file_len
            )));
        }
        let len = (file_len - offset).min(SEGMENT_SIZE) as usize;
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map(&self.file)? };
        debug!(segment = index, len, "mapped store segment");
        let seg = Arc::new(SegmentMap { index, map });
        if segments.len() <= index as usize {
            segments.resize(index as usize + 1, None);
        }
        segments[index as usize] = Some(seg.clone());
        Ok(seg)
    }

    /// Re-map every populated segment whose window is shorter than the
    /// file now is. Called after a commit extends the file; handles held
    /// by readers keep the old window.
    pub fn refresh(&self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut segments = self.segments.write();
        for slot in segments.iter_mut() {
            let Some(seg) = slot else { continue };
            let offset = (seg.index as u64) << SEGMENT_SHIFT;
            let want = (file_len.saturating_sub(offset)).min(SEGMENT_SIZE) as usize;
            if want > seg.len() {
                let index = seg.index;
                let map =
                    unsafe { MmapOptions::new().offset(offset).len(want).map(&self.file)? };
                *slot = Some(Arc::new(SegmentMap { index, map }));
            }
        }
        Ok(())
    }

    /// Advisory hint that `len` bytes starting inside `seg` will be read
    /// sequentially. No-op on platforms without madvise.
    pub fn prefetch(&self, seg: &SegmentMap, offset: usize, len: usize) {
        #[cfg(unix)]
        {
            let end = offset.saturating_add(len).min(seg.len());
            if offset < end {
                let _ = seg.map.advise_range(memmap2::Advice::Sequential, offset, end - offset);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (seg, offset, len);
        }
    }

    /// Positional write, bypassing the mappings.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.write_all_at(data, offset)?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut written = 0;
            while written < data.len() {
                let n = self.file.seek_write(&data[written..], offset + written as u64)?;
                written += n;
            }
        }
        Ok(())
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Flush dirty data to disk.
    pub fn force(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = Mapping::open(&tmp.path().join("absent.gol"), false).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn test_map_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("small.gol");
        let mapping = Mapping::create(&path).unwrap();
        mapping.write_at(0, b"hello segment zero").unwrap();
        mapping.set_len(4096).unwrap();

        let seg = mapping.segment(0).unwrap();
        assert_eq!(&seg.bytes()[..5], b"hello");
        assert_eq!(seg.len(), 4096);
    }

    #[test]
    fn test_segment_beyond_eof() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tiny.gol");
        let mapping = Mapping::create(&path).unwrap();
        mapping.set_len(4096).unwrap();
        assert!(mapping.segment(1).is_err());
    }

    #[test]
    fn test_refresh_after_growth() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grow.gol");
        let mapping = Mapping::create(&path).unwrap();
        mapping.set_len(4096).unwrap();
        let before = mapping.segment(0).unwrap();
        assert_eq!(before.len(), 4096);

        mapping.set_len(8192).unwrap();
        mapping.refresh().unwrap();
        let after = mapping.segment(0).unwrap();
        assert_eq!(after.len(), 8192);
        // The old handle still reads its original window.
        assert_eq!(before.len(), 4096);
    }
}
