//! Feature records and tag tables
//!
//! A tile's feature blob starts with a u32 feature count and a reserved
//! word; records follow back-to-back, 4-byte aligned. Record layout,
//! little-endian:
//!
//! | offset | field |
//! |--------|-------|
//! | 0      | type (u8: 0 node, 1 way, 2 relation) |
//! | 1      | flags (u8, bit 0 = area) |
//! | 2      | tag-table offset (u16, bit 0 = local-keys layout) |
//! | 4      | id (u64) |
//! | 12     | bounding box (4 × i32: min x, min y, max x, max y) |
//! | 28     | body size (u32, total record bytes) |
//! | 32     | geometry |
//!
//! Geometry is empty for nodes (the box is the point), a coordinate list
//! for ways (u32 count, then x/y pairs), and a member list for relations
//! (u32 count, then per member: type byte, u64 id, varstr role).
//!
//! The tag table sits at the record offset named in the header word, with
//! its low bit stripped: a u16 tag count, then either `(u16 key, varstr
//! value)` entries referencing the store's interned strings, or
//! `(varstr key, varstr value)` entries when the low bit marked the table
//! as local.

use std::sync::Arc;

use bitflags::bitflags;

use crate::geom::{BoundingBox, Coordinate};
use crate::store::FeatureStore;
use crate::string::{read_varstr, skip_varstr};
use crate::tile::Tile;

/// Byte offset of the geometry section within a record.
pub(crate) const RECORD_GEOMETRY: usize = 32;

bitflags! {
    /// Which kinds of features a query accepts. Ways and relations each
    /// split into a linear and an area population so the `a` type
    /// selector can address closed shapes across both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeMask: u32 {
        const NODES = 1;
        const LINEAR_WAYS = 1 << 1;
        const AREA_WAYS = 1 << 2;
        const NONAREA_RELATIONS = 1 << 3;
        const AREA_RELATIONS = 1 << 4;
    }
}

impl TypeMask {
    pub const WAYS: TypeMask = TypeMask::LINEAR_WAYS.union(TypeMask::AREA_WAYS);
    pub const RELATIONS: TypeMask =
        TypeMask::NONAREA_RELATIONS.union(TypeMask::AREA_RELATIONS);
    pub const AREAS: TypeMask = TypeMask::AREA_WAYS.union(TypeMask::AREA_RELATIONS);
}

/// The three feature kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureType {
    Node,
    Way,
    Relation,
}

impl FeatureType {
    pub(crate) fn from_byte(b: u8) -> Option<FeatureType> {
        match b {
            0 => Some(FeatureType::Node),
            1 => Some(FeatureType::Way),
            2 => Some(FeatureType::Relation),
            _ => None,
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            FeatureType::Node => 0,
            FeatureType::Way => 1,
            FeatureType::Relation => 2,
        }
    }
}

/// Locates a feature record inside a tile blob. Valid only while the
/// store that produced it is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeaturePtr {
    /// First page of the tile's feature blob.
    pub page: u32,
    /// Byte offset of the record within the blob payload.
    pub offset: u32,
}

/// One member of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member<'a> {
    pub member_type: FeatureType,
    pub id: u64,
    pub role: &'a str,
}

/// A feature resolved against its mapped bytes. Cheap to clone; the
/// segment handle keeps the mapping alive.
#[derive(Clone)]
pub struct Feature {
    store: Arc<FeatureStore>,
    tile: Tile,
    ptr: FeaturePtr,
    seg: Arc<crate::mapping::SegmentMap>,
    start: usize,
    len: usize,
}

impl Feature {
    pub(crate) fn new(
        store: Arc<FeatureStore>,
        tile: Tile,
        ptr: FeaturePtr,
        seg: Arc<crate::mapping::SegmentMap>,
        start: usize,
        len: usize,
    ) -> Feature {
        Feature {
            store,
            tile,
            ptr,
            seg,
            start,
            len,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.seg.bytes()[self.start..self.start + self.len]
    }

    fn read_u32(&self, off: usize) -> u32 {
        let b = self.bytes();
        u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
    }

    fn read_i32(&self, off: usize) -> i32 {
        self.read_u32(off) as i32
    }

    pub fn store(&self) -> &Arc<FeatureStore> {
        &self.store
    }

    /// The tile whose blob holds this record.
    pub fn tile(&self) -> Tile {
        self.tile
    }

    pub fn ptr(&self) -> FeaturePtr {
        self.ptr
    }

    pub fn feature_type(&self) -> FeatureType {
        FeatureType::from_byte(self.bytes()[0]).unwrap_or(FeatureType::Node)
    }

    pub fn is_area(&self) -> bool {
        self.bytes()[1] & 0x01 != 0
    }

    /// The population bit this feature belongs to.
    pub fn type_bit(&self) -> TypeMask {
        match (self.feature_type(), self.is_area()) {
            (FeatureType::Node, _) => TypeMask::NODES,
            (FeatureType::Way, false) => TypeMask::LINEAR_WAYS,
            (FeatureType::Way, true) => TypeMask::AREA_WAYS,
            (FeatureType::Relation, false) => TypeMask::NONAREA_RELATIONS,
            (FeatureType::Relation, true) => TypeMask::AREA_RELATIONS,
        }
    }

    pub fn id(&self) -> u64 {
        let b = self.bytes();
        u64::from_le_bytes([b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11]])
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(
            self.read_i32(12),
            self.read_i32(16),
            self.read_i32(20),
            self.read_i32(24),
        )
    }

    /// Nodes: the single stored point. Others: the box center.
    pub fn center(&self) -> Coordinate {
        let b = self.bounds();
        Coordinate::new(
            ((b.min_x as i64 + b.max_x as i64) / 2) as i32,
            ((b.min_y as i64 + b.max_y as i64) / 2) as i32,
        )
    }

    /// The raw tag table; `None` if the record is malformed.
    pub(crate) fn tag_table(&self) -> Option<TagTable<'_>> {
        let b = self.bytes();
        let word = u16::from_le_bytes([b[2], b[3]]);
        let local = word & 1 != 0;
        let at = (word & !1) as usize;
        if at + 2 > b.len() {
            return None;
        }
        Some(TagTable {
            bytes: b,
            start: at,
            local,
        })
    }

    /// Tag value for `key`, searching interned and inline keys.
    pub fn tag(&self, key: &str) -> Option<&str> {
        let table = self.tag_table()?;
        if table.local {
            table.find_local(key)
        } else {
            let index = self.store.global_key(key)?;
            table.find_global(index)
        }
    }

    /// All tags, with interned keys resolved through the store.
    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        let table = self.tag_table();
        TagIter {
            store: &self.store,
            table,
            index: 0,
            pos: 0,
        }
    }

    /// Way geometry; empty for nodes and relations.
    pub fn coords(&self) -> CoordIter<'_> {
        let b = self.bytes();
        if self.feature_type() != FeatureType::Way || b.len() < RECORD_GEOMETRY + 4 {
            return CoordIter {
                bytes: b,
                pos: 0,
                remaining: 0,
            };
        }
        let count = self.read_u32(RECORD_GEOMETRY);
        CoordIter {
            bytes: b,
            pos: RECORD_GEOMETRY + 4,
            remaining: count,
        }
    }

    /// Relation members in stored order; empty for nodes and ways.
    pub fn members(&self) -> MemberIter<'_> {
        let b = self.bytes();
        if self.feature_type() != FeatureType::Relation || b.len() < RECORD_GEOMETRY + 4 {
            return MemberIter {
                bytes: b,
                pos: 0,
                remaining: 0,
            };
        }
        let count = self.read_u32(RECORD_GEOMETRY);
        MemberIter {
            bytes: b,
            pos: RECORD_GEOMETRY + 4,
            remaining: count,
        }
    }
}

impl std::fmt::Debug for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feature")
            .field("type", &self.feature_type())
            .field("id", &self.id())
            .field("tile", &self.tile.to_string())
            .finish()
    }
}

/// A record's tag table. All lookups are fail-closed: corruption reads as
/// "tag absent".
pub(crate) struct TagTable<'a> {
    bytes: &'a [u8],
    start: usize,
    local: bool,
}

impl<'a> TagTable<'a> {
    pub fn is_local(&self) -> bool {
        self.local
    }

    fn count(&self) -> usize {
        let b = self.bytes;
        if self.start + 2 > b.len() {
            return 0;
        }
        u16::from_le_bytes([b[self.start], b[self.start + 1]]) as usize
    }

    /// Value of the interned key `key`; `None` on local tables.
    pub fn find_global(&self, key: u16) -> Option<&'a str> {
        if self.local {
            return None;
        }
        let mut pos = self.start + 2;
        for _ in 0..self.count() {
            let k = u16::from_le_bytes([*self.bytes.get(pos)?, *self.bytes.get(pos + 1)?]);
            if k == key {
                let (v, _) = read_varstr(self.bytes, pos + 2)?;
                return Some(v);
            }
            pos = skip_varstr(self.bytes, pos + 2)?;
        }
        None
    }

    /// Raw entries in stored order, for scans that cannot allocate.
    pub fn entries(&self) -> TagEntryIter<'a> {
        TagEntryIter {
            bytes: self.bytes,
            local: self.local,
            pos: self.start + 2,
            remaining: self.count(),
        }
    }

    /// Value of the inline key `key`; `None` on global tables.
    pub fn find_local(&self, key: &str) -> Option<&'a str> {
        if !self.local {
            return None;
        }
        let mut pos = self.start + 2;
        for _ in 0..self.count() {
            let (k, after_key) = read_varstr(self.bytes, pos)?;
            if k == key {
                let (v, _) = read_varstr(self.bytes, after_key)?;
                return Some(v);
            }
            pos = skip_varstr(self.bytes, after_key)?;
        }
        None
    }
}

/// A tag key as stored: interned index or inline string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagKeyRef<'a> {
    Global(u16),
    Local(&'a str),
}

pub(crate) struct TagEntryIter<'a> {
    bytes: &'a [u8],
    local: bool,
    pos: usize,
    remaining: usize,
}

impl<'a> Iterator for TagEntryIter<'a> {
    type Item = (TagKeyRef<'a>, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        if self.local {
            let (k, after_key) = read_varstr(self.bytes, self.pos)?;
            let (v, next) = read_varstr(self.bytes, after_key)?;
            self.pos = next;
            Some((TagKeyRef::Local(k), v))
        } else {
            let k = u16::from_le_bytes([
                *self.bytes.get(self.pos)?,
                *self.bytes.get(self.pos + 1)?,
            ]);
            let (v, next) = read_varstr(self.bytes, self.pos + 2)?;
            self.pos = next;
            Some((TagKeyRef::Global(k), v))
        }
    }
}

struct TagIter<'a> {
    store: &'a Arc<FeatureStore>,
    table: Option<TagTable<'a>>,
    index: usize,
    pos: usize,
}

impl<'a> Iterator for TagIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let table = self.table.as_ref()?;
        if self.index >= table.count() {
            return None;
        }
        if self.index == 0 {
            self.pos = table.start + 2;
        }
        self.index += 1;
        if table.local {
            let (k, after_key) = read_varstr(table.bytes, self.pos)?;
            let (v, next) = read_varstr(table.bytes, after_key)?;
            self.pos = next;
            Some((k, v))
        } else {
            let k = u16::from_le_bytes([
                *table.bytes.get(self.pos)?,
                *table.bytes.get(self.pos + 1)?,
            ]);
            let (v, next) = read_varstr(table.bytes, self.pos + 2)?;
            self.pos = next;
            let key = self.store.global_string(k)?;
            Some((key, v))
        }
    }
}

/// Way coordinates in stored order.
pub struct CoordIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    remaining: u32,
}

impl Iterator for CoordIter<'_> {
    type Item = Coordinate;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.pos + 8 > self.bytes.len() {
            return None;
        }
        let b = self.bytes;
        let x = i32::from_le_bytes([b[self.pos], b[self.pos + 1], b[self.pos + 2], b[self.pos + 3]]);
        let y = i32::from_le_bytes([
            b[self.pos + 4],
            b[self.pos + 5],
            b[self.pos + 6],
            b[self.pos + 7],
        ]);
        self.pos += 8;
        self.remaining -= 1;
        Some(Coordinate::new(x, y))
    }
}

/// Relation members in stored order.
pub struct MemberIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    remaining: u32,
}

impl<'a> Iterator for MemberIter<'a> {
    type Item = Member<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.pos + 9 > self.bytes.len() {
            return None;
        }
        let b = self.bytes;
        let member_type = FeatureType::from_byte(b[self.pos])?;
        let id = u64::from_le_bytes([
            b[self.pos + 1],
            b[self.pos + 2],
            b[self.pos + 3],
            b[self.pos + 4],
            b[self.pos + 5],
            b[self.pos + 6],
            b[self.pos + 7],
            b[self.pos + 8],
        ]);
        let (role, next) = read_varstr(b, self.pos + 9)?;
        self.pos = next;
        self.remaining -= 1;
        Some(Member {
            member_type,
            id,
            role,
        })
    }
}

#[cfg(test)]
pub(crate) mod encode {
    //! Record encoders for fixtures. The decode side above is the
    //! contract; these mirror it.

    use super::*;
    use crate::string::write_varstr;

    pub enum Tags<'a> {
        Global(Vec<(u16, &'a str)>),
        Local(Vec<(&'a str, &'a str)>),
    }

    fn append_tags(out: &mut Vec<u8>, tags: &Tags<'_>) -> (u16, bool) {
        // Tag table offsets carry a flag in bit 0, so the table must start
        // on an even offset.
        if out.len() % 2 != 0 {
            out.push(0);
        }
        let at = out.len() as u16;
        match tags {
            Tags::Global(entries) => {
                out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                for (k, v) in entries {
                    out.extend_from_slice(&k.to_le_bytes());
                    write_varstr(out, v);
                }
                (at, false)
            }
            Tags::Local(entries) => {
                out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                for (k, v) in entries {
                    write_varstr(out, k);
                    write_varstr(out, v);
                }
                (at, true)
            }
        }
    }

    fn finish(mut out: Vec<u8>, tags: &Tags<'_>) -> Vec<u8> {
        let (tag_ofs, local) = append_tags(&mut out, tags);
        let word = tag_ofs | if local { 1 } else { 0 };
        out[2..4].copy_from_slice(&word.to_le_bytes());
        let body = out.len() as u32;
        out[28..32].copy_from_slice(&body.to_le_bytes());
        out
    }

    fn header(feature_type: FeatureType, area: bool, id: u64, bounds: BoundingBox) -> Vec<u8> {
        let mut out = vec![0u8; RECORD_GEOMETRY];
        out[0] = feature_type.to_byte();
        out[1] = if area { 1 } else { 0 };
        out[4..12].copy_from_slice(&id.to_le_bytes());
        out[12..16].copy_from_slice(&bounds.min_x.to_le_bytes());
        out[16..20].copy_from_slice(&bounds.min_y.to_le_bytes());
        out[20..24].copy_from_slice(&bounds.max_x.to_le_bytes());
        out[24..28].copy_from_slice(&bounds.max_y.to_le_bytes());
        out
    }

    pub fn node(id: u64, at: Coordinate, tags: Tags<'_>) -> Vec<u8> {
        finish(header(FeatureType::Node, false, id, BoundingBox::point(at)), &tags)
    }

    pub fn way(id: u64, area: bool, coords: &[Coordinate], tags: Tags<'_>) -> Vec<u8> {
        let mut bounds = BoundingBox::empty();
        for c in coords {
            bounds.min_x = bounds.min_x.min(c.x);
            bounds.min_y = bounds.min_y.min(c.y);
            bounds.max_x = bounds.max_x.max(c.x);
            bounds.max_y = bounds.max_y.max(c.y);
        }
        let mut out = header(FeatureType::Way, area, id, bounds);
        out.extend_from_slice(&(coords.len() as u32).to_le_bytes());
        for c in coords {
            out.extend_from_slice(&c.x.to_le_bytes());
            out.extend_from_slice(&c.y.to_le_bytes());
        }
        finish(out, &tags)
    }

    pub fn relation(
        id: u64,
        area: bool,
        bounds: BoundingBox,
        members: &[(FeatureType, u64, &str)],
        tags: Tags<'_>,
    ) -> Vec<u8> {
        let mut out = header(FeatureType::Relation, area, id, bounds);
        out.extend_from_slice(&(members.len() as u32).to_le_bytes());
        for &(t, id, role) in members {
            out.push(t.to_byte());
            out.extend_from_slice(&id.to_le_bytes());
            write_varstr(&mut out, role);
        }
        finish(out, &tags)
    }

    /// Assemble a tile blob payload from encoded records.
    pub fn tile_payload(records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(records.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for record in records {
            out.extend_from_slice(record);
            while out.len() % 4 != 0 {
                out.push(0);
            }
        }
        out
    }
}
