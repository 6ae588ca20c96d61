//! GOL store access
//!
//! A store is a single file partitioned into 1 GiB segments, each segment
//! divided into pages of `1 << page_size_shift` bytes. Page 0 of segment 0
//! is the header:
//!
//! | offset | field |
//! |--------|-------|
//! | 0x00   | magic (0x7ADA0BB1) |
//! | 0x04   | version (1_000_000) |
//! | 0x08   | creation timestamp, epoch millis |
//! | 0x10   | total page count |
//! | 0x14   | guid (16 bytes) |
//! | 0x24   | page size shift + 3 reserved bytes |
//! | 0x28   | metadata size |
//! | 0x2C   | properties pointer (global string table blob) |
//! | 0x30   | index pointer (tile index root blob) |
//! | 0x34   | trunk free-table range bits |
//! | 0x38   | subtype data (64 bytes, opaque) |
//! | 0x78   | trunk free-table (512 page numbers) |
//!
//! The last 8 bytes of the header page hold an XXH3-64 checksum of the rest
//! of the page; a mismatch on open means a torn commit and triggers journal
//! rollback. All multi-byte values are little-endian.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use std::sync::atomic::AtomicBool;

use binrw::{binrw, BinRead, BinWrite};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use xxhash_rust::xxh3::{xxh3_64, xxh3_128};

use crate::error::{Error, Result};
use crate::mapping::{Mapping, SegmentMap, SEGMENT_SHIFT};
use crate::string::read_varstr;
use crate::transaction::{self, Transaction};

/// Identifies a GOL file.
pub const MAGIC: u32 = 0x7ADA_0BB1;

/// Format version accepted by this build.
pub const VERSION: u32 = 1_000_000;

/// 4 KiB pages unless a store was created with something else.
pub const DEFAULT_PAGE_SIZE_SHIFT: u8 = 12;

/// Number of trunk free-table slots.
pub const TRUNK_SLOTS: usize = 512;

/// Number of leaf free-table slots carried by a free blob.
pub const LEAF_SLOTS: usize = 512;

/// Every blob starts with two little-endian words.
pub const BLOB_HEADER_SIZE: u32 = 8;

/// Low 30 bits of the second header word.
pub const PAYLOAD_SIZE_MASK: u32 = 0x3FFF_FFFF;

/// Bit 31 of the second header word.
pub const FREE_FLAG: u32 = 0x8000_0000;

/// Index of a page within the store; byte offset = page << page_size_shift.
pub type PageNum = u32;

/// The header page, minus its trailing checksum.
#[binrw]
#[brw(little)]
#[derive(Clone)]
pub struct StoreHeader {
    pub magic: u32,
    pub version: u32,
    pub creation_timestamp: u64,
    pub total_page_count: u32,
    pub guid: [u8; 16],
    pub page_size_shift: u8,
    pub reserved: [u8; 3],
    pub metadata_size: u32,
    pub properties_pointer: u32,
    pub index_pointer: u32,
    pub trunk_free_table_ranges: u32,
    pub subtype_data: [u8; 64],
    pub trunk_free_table: [u32; TRUNK_SLOTS],
}

impl StoreHeader {
    fn new(page_size_shift: u8, guid: [u8; 16], timestamp: u64) -> Self {
        StoreHeader {
            magic: MAGIC,
            version: VERSION,
            creation_timestamp: timestamp,
            total_page_count: 1,
            guid,
            page_size_shift,
            reserved: [0; 3],
            metadata_size: 0,
            properties_pointer: 0,
            index_pointer: 0,
            trunk_free_table_ranges: 0,
            subtype_data: [0; 64],
            trunk_free_table: [0; TRUNK_SLOTS],
        }
    }

    /// Serialize into a full header page with the checksum stamped in the
    /// last 8 bytes.
    pub(crate) fn to_page_bytes(&self, page_size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; page_size];
        let mut cur = Cursor::new(&mut buf[..]);
        self.write(&mut cur)?;
        let sum = xxh3_64(&buf[..page_size - 8]);
        let at = page_size - 8;
        buf[at..].copy_from_slice(&sum.to_le_bytes());
        Ok(buf)
    }

    pub(crate) fn checksum_ok(page: &[u8]) -> bool {
        if page.len() < 16 {
            return false;
        }
        let at = page.len() - 8;
        let stored = u64::from_le_bytes(page[at..].try_into().unwrap());
        xxh3_64(&page[..at]) == stored
    }
}

/// Options for opening or creating a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Open for mutation; required to begin transactions.
    pub writable: bool,
    /// Page size shift used when creating a new store. Valid range 12..=16.
    pub page_size_shift: u8,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            writable: false,
            page_size_shift: DEFAULT_PAGE_SIZE_SHIFT,
        }
    }
}

/// Store-level facts, serializable for tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_pages: u32,
    pub page_size: u32,
    pub segments: u32,
    pub creation_timestamp: u64,
    pub global_strings: usize,
}

/// A blob resolved to its mapped bytes. The segment handle keeps the
/// mapping alive for as long as the reference is held.
#[derive(Clone)]
pub(crate) struct BlobRef {
    pub seg: Arc<SegmentMap>,
    pub start: usize,
    pub payload_len: usize,
}

impl BlobRef {
    pub fn payload(&self) -> &[u8] {
        let from = self.start + BLOB_HEADER_SIZE as usize;
        &self.seg.bytes()[from..from + self.payload_len]
    }

    /// Absolute in-segment offset of the payload start.
    pub fn payload_start(&self) -> usize {
        self.start + BLOB_HEADER_SIZE as usize
    }
}

/// An open GOL file: mappings, the current header snapshot, and the global
/// string table. Shared by every `Features` handle over the same path.
pub struct FeatureStore {
    mapping: Mapping,
    header: RwLock<Arc<StoreHeader>>,
    strings: Vec<String>,
    string_index: HashMap<String, u16>,
    writable: bool,
    writer_active: AtomicBool,
}

impl FeatureStore {
    /// Open an existing store read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<FeatureStore>> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Arc<FeatureStore>> {
        let path = path.as_ref();
        let mapping = Mapping::open(path, options.writable)?;
        // A leftover journal means the last commit never completed; put the
        // pre-images back before trusting anything in the file.
        transaction::recover(path)?;
        let header = Self::read_header(path, &mapping)?;
        let (strings, string_index) = Self::load_strings(&mapping, &header)?;
        info!(path = %path.display(), pages = header.total_page_count, "opened store");
        Ok(Arc::new(FeatureStore {
            mapping,
            header: RwLock::new(Arc::new(header)),
            strings,
            string_index,
            writable: options.writable,
            writer_active: AtomicBool::new(false),
        }))
    }

    /// Create a new store containing only a header page. The maintenance
    /// path for building fixtures and fresh libraries.
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Arc<FeatureStore>> {
        let path = path.as_ref();
        if !(12..=16).contains(&options.page_size_shift) {
            return Err(Error::InvalidFormat(format!(
                "unsupported page size shift {}",
                options.page_size_shift
            )));
        }
        let mapping = Mapping::create(path)?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seed = format!("{}:{}", path.display(), timestamp);
        let guid = xxh3_128(seed.as_bytes()).to_le_bytes();
        let header = StoreHeader::new(options.page_size_shift, guid, timestamp);
        let page_size = 1usize << options.page_size_shift;
        mapping.write_at(0, &header.to_page_bytes(page_size)?)?;
        mapping.set_len(page_size as u64)?;
        mapping.force()?;
        info!(path = %path.display(), "created store");
        Ok(Arc::new(FeatureStore {
            mapping,
            header: RwLock::new(Arc::new(header)),
            strings: Vec::new(),
            string_index: HashMap::new(),
            writable: true,
            writer_active: AtomicBool::new(false),
        }))
    }

    fn read_header(path: &Path, mapping: &Mapping) -> Result<StoreHeader> {
        let file_len = mapping.file_len()?;
        if file_len < 4096 {
            return Err(Error::InvalidFormat(format!(
                "{}: truncated header ({} bytes)",
                path.display(),
                file_len
            )));
        }
        let seg = mapping.segment(0)?;
        let bytes = seg.bytes();
        let mut cur = Cursor::new(bytes);
        let header = StoreHeader::read(&mut cur)?;
        if header.magic != MAGIC {
            return Err(Error::InvalidFormat(format!(
                "{}: bad magic 0x{:08X}",
                path.display(),
                header.magic
            )));
        }
        if header.version != VERSION {
            return Err(Error::InvalidFormat(format!(
                "{}: unsupported version {}",
                path.display(),
                header.version
            )));
        }
        if !(12..=16).contains(&header.page_size_shift) {
            return Err(Error::InvalidFormat(format!(
                "{}: bad page size shift {}",
                path.display(),
                header.page_size_shift
            )));
        }
        let page_size = 1usize << header.page_size_shift;
        if bytes.len() < page_size || !StoreHeader::checksum_ok(&bytes[..page_size]) {
            return Err(Error::InvalidFormat(format!(
                "{}: header checksum mismatch",
                path.display()
            )));
        }
        Ok(header)
    }

    fn load_strings(
        mapping: &Mapping,
        header: &StoreHeader,
    ) -> Result<(Vec<String>, HashMap<String, u16>)> {
        if header.properties_pointer == 0 {
            return Ok((Vec::new(), HashMap::new()));
        }
        let blob = Self::blob_at(mapping, header, header.properties_pointer)?;
        let payload = blob.payload();
        if payload.len() < 4 {
            return Err(Error::InvalidFormat("truncated string table".into()));
        }
        let count = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
        let mut strings = Vec::with_capacity(count);
        let mut index = HashMap::with_capacity(count);
        let mut pos = 4;
        for i in 0..count {
            let (s, next) = read_varstr(payload, pos).ok_or_else(|| {
                Error::InvalidFormat(format!("string table truncated at entry {}", i))
            })?;
            index.insert(s.to_string(), i as u16);
            strings.push(s.to_string());
            pos = next;
        }
        Ok((strings, index))
    }

    pub fn path(&self) -> &Path {
        self.mapping.path()
    }

    pub fn page_size_shift(&self) -> u8 {
        self.header.read().page_size_shift
    }

    pub fn page_size(&self) -> u32 {
        1u32 << self.page_size_shift()
    }

    pub fn total_page_count(&self) -> u32 {
        self.header.read().total_page_count
    }

    pub fn guid(&self) -> [u8; 16] {
        self.header.read().guid
    }

    pub fn creation_timestamp(&self) -> u64 {
        self.header.read().creation_timestamp
    }

    pub fn subtype_data(&self) -> [u8; 64] {
        self.header.read().subtype_data
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The header as of now; a consistent snapshot for the duration of a
    /// query. Commits publish a fresh `Arc`, never mutate in place.
    pub(crate) fn header_snapshot(&self) -> Arc<StoreHeader> {
        self.header.read().clone()
    }

    pub(crate) fn publish_header(&self, header: StoreHeader) {
        *self.header.write() = Arc::new(header);
    }

    pub(crate) fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub(crate) fn writer_active(&self) -> &AtomicBool {
        &self.writer_active
    }

    /// Look up an interned tag key string.
    pub fn global_string(&self, index: u16) -> Option<&str> {
        self.strings.get(index as usize).map(|s| s.as_str())
    }

    /// The interned index of a tag key, if the store knows it.
    pub fn global_key(&self, s: &str) -> Option<u16> {
        self.string_index.get(s).copied()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let header = self.header_snapshot();
        let file_len = self.mapping.file_len()?;
        Ok(StoreStats {
            total_pages: header.total_page_count,
            page_size: 1u32 << header.page_size_shift,
            segments: ((file_len + ((1u64 << SEGMENT_SHIFT) - 1)) >> SEGMENT_SHIFT) as u32,
            creation_timestamp: header.creation_timestamp,
            global_strings: self.strings.len(),
        })
    }

    /// Begin the (single) writer transaction.
    pub fn begin(self: &Arc<Self>) -> Result<Transaction> {
        Transaction::begin(self.clone())
    }

    /// Resolve an allocated blob to its mapped bytes, with size bounds
    /// checked against the segment.
    pub(crate) fn blob(&self, page: PageNum) -> Result<BlobRef> {
        let header = self.header_snapshot();
        if page == 0 || page >= header.total_page_count {
            return Err(Error::InvalidFormat(format!(
                "blob page {} out of range (store has {})",
                page, header.total_page_count
            )));
        }
        Self::blob_at(&self.mapping, &header, page)
    }

    fn blob_at(mapping: &Mapping, header: &StoreHeader, page: PageNum) -> Result<BlobRef> {
        let shift = header.page_size_shift as u32;
        let offset = (page as u64) << shift;
        let seg = mapping.segment((offset >> SEGMENT_SHIFT) as u32)?;
        let start = (offset & ((1u64 << SEGMENT_SHIFT) - 1)) as usize;
        let bytes = seg.bytes();
        if start + BLOB_HEADER_SIZE as usize > bytes.len() {
            return Err(Error::InvalidFormat(format!("blob page {} beyond mapping", page)));
        }
        let word = u32::from_le_bytes(bytes[start + 4..start + 8].try_into().unwrap());
        if word & FREE_FLAG != 0 {
            return Err(Error::InvalidFormat(format!("blob page {} is free", page)));
        }
        let payload_len = (word & PAYLOAD_SIZE_MASK) as usize;
        if start + BLOB_HEADER_SIZE as usize + payload_len > bytes.len() {
            return Err(Error::InvalidFormat(format!(
                "blob page {} payload ({} bytes) exceeds segment",
                page, payload_len
            )));
        }
        Ok(BlobRef {
            seg,
            start,
            payload_len,
        })
    }

    /// Hint that a blob is about to be scanned sequentially.
    pub fn prefetch(&self, page: PageNum) {
        if let Ok(blob) = self.blob(page) {
            let len = blob.payload_len + BLOB_HEADER_SIZE as usize;
            self.mapping.prefetch(&blob.seg, blob.start, len);
        }
    }

    /// Flush dirty pages to disk.
    pub fn force(&self) -> Result<()> {
        self.mapping.force()
    }
}

impl std::fmt::Debug for FeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStore")
            .field("path", &self.mapping.path())
            .field("pages", &self.total_page_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_open() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fresh.gol");
        {
            let store = FeatureStore::create(&path, StoreOptions::default()).unwrap();
            assert_eq!(store.total_page_count(), 1);
            assert_eq!(store.page_size(), 4096);
        }
        let store = FeatureStore::open(&path).unwrap();
        assert_eq!(store.total_page_count(), 1);
        assert!(!store.is_writable());
    }

    #[test]
    fn test_header_bytes_on_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("magic.gol");
        FeatureStore::create(&path, StoreOptions::default()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        // magic then version 1_000_000, little-endian
        assert_eq!(&bytes[..8], &[0xB1, 0x0B, 0xDA, 0x7A, 0x40, 0x42, 0x0F, 0x00]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("corrupt.gol");
        FeatureStore::create(&path, StoreOptions::default()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = 0x00;
        std::fs::write(&path, &bytes).unwrap();
        let err = FeatureStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)), "{:?}", err);
    }

    #[test]
    fn test_bad_version_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("version.gol");
        FeatureStore::create(&path, StoreOptions::default()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&999_999u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(FeatureStore::open(&path).is_err());
    }

    #[test]
    fn test_torn_header_rejected_without_journal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("torn.gol");
        FeatureStore::create(&path, StoreOptions::default()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte in the middle of the trunk table; magic and version
        // still match, only the checksum catches it.
        bytes[0x100] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        let err = FeatureStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[test]
    fn test_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = FeatureStore::open(tmp.path().join("nope.gol")).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn test_stats_roundtrip_through_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stats.gol");
        let store = FeatureStore::create(&path, StoreOptions::default()).unwrap();
        let stats = store.stats().unwrap();
        let json = serde_json::to_string(&stats).unwrap();
        let back: StoreStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total_pages, 1);
        assert_eq!(back.page_size, 4096);
    }
}
