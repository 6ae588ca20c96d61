//! Store integrity checking
//!
//! Audits every blob between page 1 and the header's page count against
//! the allocator's invariants:
//!
//! - every free blob appears in exactly one free-list, filed under its
//!   exact size class
//! - no two adjacent free blobs (coalescing is complete at commit
//!   boundaries)
//! - each blob's preceding-free link matches reality
//! - no blob crosses a segment boundary, none overruns the store
//! - free-table range bits agree with their slots
//!
//! The report is serializable so tooling can persist or ship it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::mapping::SEGMENT_SHIFT;
use crate::store::{FeatureStore, PageNum, FREE_FLAG, LEAF_SLOTS, PAYLOAD_SIZE_MASK, TRUNK_SLOTS};
use crate::transaction::{blob_pages, leaf_slot, trunk_slot};

const OFF_SIZE_WORD: usize = 4;
const OFF_PRECEDING: usize = 0;
const OFF_NEXT_FREE: usize = 12;
const OFF_LEAF_RANGES: usize = 16;
const OFF_LEAF_TABLE: usize = 20;

/// Blob-level accounting for a store.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BlobStats {
    pub total_pages: u32,
    pub used_blobs: u32,
    pub used_pages: u32,
    pub free_blobs: u32,
    pub free_pages: u32,
}

/// Result of auditing a store.
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub stats: BlobStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn new() -> ValidationReport {
        ValidationReport {
            valid: true,
            stats: BlobStats::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn add_error(&mut self, msg: impl Into<String>) {
        self.valid = false;
        self.errors.push(msg.into());
    }

    fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

fn read_u32(store: &FeatureStore, page: PageNum, off: usize) -> Result<u32> {
    let shift = store.page_size_shift() as u32;
    let offset = (page as u64) << shift;
    let seg = store.mapping().segment((offset >> SEGMENT_SHIFT) as u32)?;
    let start = (offset & ((1u64 << SEGMENT_SHIFT) - 1)) as usize + off;
    let bytes = seg.bytes();
    if start + 4 > bytes.len() {
        return Err(crate::error::Error::InvalidFormat(format!(
            "read past mapping at page {} offset {}",
            page, off
        )));
    }
    Ok(u32::from_le_bytes([
        bytes[start],
        bytes[start + 1],
        bytes[start + 2],
        bytes[start + 3],
    ]))
}

/// Every free blob reachable from the trunk table: `(first_page, pages)`,
/// sorted by page. The observable serialization of the free table.
pub fn free_table_entries(store: &FeatureStore) -> Result<Vec<(PageNum, u32)>> {
    let mut out = Vec::new();
    collect_free_lists(store, &mut out, None)?;
    out.sort();
    Ok(out)
}

fn collect_free_lists(
    store: &FeatureStore,
    out: &mut Vec<(PageNum, u32)>,
    mut report: Option<&mut ValidationReport>,
) -> Result<()> {
    let header = store.header_snapshot();
    let mut seen = HashSet::new();
    for t in 0..TRUNK_SLOTS {
        let holder = header.trunk_free_table[t];
        let bit = header.trunk_free_table_ranges & (1 << (t >> 4)) != 0;
        if holder == 0 {
            continue;
        }
        if !bit {
            if let Some(r) = report.as_deref_mut() {
                r.add_error(format!("trunk slot {} occupied but range bit clear", t));
            }
        }
        let ranges = read_u32(store, holder, OFF_LEAF_RANGES)?;
        for l in 0..LEAF_SLOTS {
            let head = read_u32(store, holder, OFF_LEAF_TABLE + l * 4)?;
            if head != 0 && ranges & (1 << (l >> 4)) == 0 {
                if let Some(r) = report.as_deref_mut() {
                    r.add_error(format!(
                        "leaf slot {} of trunk {} occupied but range bit clear",
                        l, t
                    ));
                }
            }
            let expected_pages = (t as u32) * 512 + l as u32 + 1;
            let mut p = head;
            while p != 0 {
                if !seen.insert(p) {
                    if let Some(r) = report.as_deref_mut() {
                        r.add_error(format!("free blob at page {} linked more than once", p));
                    }
                    break;
                }
                let word = read_u32(store, p, OFF_SIZE_WORD)?;
                if word & FREE_FLAG == 0 {
                    if let Some(r) = report.as_deref_mut() {
                        r.add_error(format!("page {} in free list but not marked free", p));
                    }
                    break;
                }
                let pages = blob_pages(word, store.page_size_shift() as u32);
                if pages != expected_pages
                    || trunk_slot(pages) != t
                    || leaf_slot(pages) != l
                {
                    if let Some(r) = report.as_deref_mut() {
                        r.add_error(format!(
                            "free blob at page {} ({} pages) filed in class {}/{}",
                            p, pages, t, l
                        ));
                    }
                }
                out.push((p, pages));
                p = read_u32(store, p, OFF_NEXT_FREE)?;
            }
        }
    }
    Ok(())
}

/// Audit the whole store.
pub fn validate_store(store: &FeatureStore) -> Result<ValidationReport> {
    let mut report = ValidationReport::new();
    let header = store.header_snapshot();
    let shift = store.page_size_shift() as u32;
    let pages_per_segment = 1u32 << (SEGMENT_SHIFT - shift);
    let total = header.total_page_count;
    report.stats.total_pages = total;

    let mut listed = Vec::new();
    collect_free_lists(store, &mut listed, Some(&mut report))?;
    let listed: HashMap<PageNum, u32> = listed.into_iter().collect();

    let mut walked_free = HashSet::new();
    let mut page: PageNum = 1;
    let mut prev_free: Option<u32> = None;
    while page < total {
        if page & (pages_per_segment - 1) == 0 {
            // Links never cross a segment boundary.
            prev_free = None;
        }
        let word = read_u32(store, page, OFF_SIZE_WORD)?;
        let pages = blob_pages(word, shift);
        if page + pages > total {
            report.add_error(format!(
                "blob at page {} ({} pages) overruns the store ({} pages)",
                page, pages, total
            ));
            break;
        }
        if (page & (pages_per_segment - 1)) + pages > pages_per_segment {
            report.add_error(format!(
                "blob at page {} ({} pages) crosses a segment boundary",
                page, pages
            ));
            break;
        }

        let preceding = read_u32(store, page, OFF_PRECEDING)?;
        let expected = prev_free.unwrap_or(0);
        if preceding != expected {
            report.add_error(format!(
                "blob at page {}: preceding-free link is {}, expected {}",
                page, preceding, expected
            ));
        }

        if word & FREE_FLAG != 0 {
            if prev_free.is_some() {
                report.add_error(format!(
                    "adjacent free blobs at page {} (coalescing incomplete)",
                    page
                ));
            }
            match listed.get(&page) {
                Some(&p) if p == pages => {}
                Some(&p) => report.add_error(format!(
                    "free blob at page {} has {} pages but is filed as {}",
                    page, pages, p
                )),
                None => report.add_error(format!(
                    "free blob at page {} is in no free list",
                    page
                )),
            }
            walked_free.insert(page);
            report.stats.free_blobs += 1;
            report.stats.free_pages += pages;
            prev_free = Some(pages);
        } else {
            let payload = word & PAYLOAD_SIZE_MASK;
            let capacity = ((pages as u64) << shift) - 8;
            if payload as u64 > capacity {
                report.add_warning(format!(
                    "blob at page {} claims payload {} beyond capacity {}",
                    page, payload, capacity
                ));
            }
            report.stats.used_blobs += 1;
            report.stats.used_pages += pages;
            prev_free = None;
        }
        page += pages;
    }

    for &p in listed.keys() {
        if !walked_free.contains(&p) {
            report.add_error(format!(
                "free list names page {} but no free blob starts there",
                p
            ));
        }
    }

    if report.stats.used_pages + report.stats.free_pages != total.saturating_sub(1) {
        report.add_error(format!(
            "page accounting mismatch: {} used + {} free != {} total - 1",
            report.stats.used_pages, report.stats.free_pages, total
        ));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_store_is_valid() {
        let tmp = TempDir::new().unwrap();
        let store =
            FeatureStore::create(tmp.path().join("valid.gol"), StoreOptions::default()).unwrap();
        let report = validate_store(&store).unwrap();
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.stats.total_pages, 1);
        assert_eq!(report.stats.used_blobs, 0);
    }

    #[test]
    fn test_allocations_stay_valid() {
        let tmp = TempDir::new().unwrap();
        let store =
            FeatureStore::create(tmp.path().join("churn.gol"), StoreOptions::default()).unwrap();
        let mut txn = store.begin().unwrap();
        let mut held = Vec::new();
        for i in 0..24u32 {
            held.push(txn.alloc(100 + i * 700).unwrap());
        }
        // Free every other blob, then half of the survivors' neighbors,
        // exercising both merge directions.
        for (i, &p) in held.iter().enumerate() {
            if i % 2 == 0 {
                txn.free(p).unwrap();
            }
        }
        for (i, &p) in held.iter().enumerate() {
            if i % 4 == 1 {
                txn.free(p).unwrap();
            }
        }
        txn.commit().unwrap();

        let report = validate_store(&store).unwrap();
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.stats.free_blobs > 0);
        assert_eq!(
            report.stats.used_pages + report.stats.free_pages,
            report.stats.total_pages - 1
        );
    }

    #[test]
    fn test_free_table_entries_sees_coalesced_blob() {
        let tmp = TempDir::new().unwrap();
        let store =
            FeatureStore::create(tmp.path().join("entries.gol"), StoreOptions::default()).unwrap();
        let mut txn = store.begin().unwrap();
        let a = txn.alloc(100).unwrap();
        let b = txn.alloc(100).unwrap();
        txn.free(a).unwrap();
        txn.free(b).unwrap();
        txn.commit().unwrap();

        assert_eq!(free_table_entries(&store).unwrap(), vec![(1, 2)]);
        let report = validate_store(&store).unwrap();
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_report_serializes() {
        let tmp = TempDir::new().unwrap();
        let store =
            FeatureStore::create(tmp.path().join("json.gol"), StoreOptions::default()).unwrap();
        let report = validate_store(&store).unwrap();
        let json = serde_json::to_string_pretty(&report).unwrap();
        let back: ValidationReport = serde_json::from_str(&json).unwrap();
        assert!(back.valid);
    }
}
