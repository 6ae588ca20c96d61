//! Fixture stores for tests
//!
//! Builds a small but real GOL through the public Transaction API: a
//! global string table, per-tile feature blobs, and a quadtree index
//! linking every payload tile through its ancestors to the zoom-0 root.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::feature::encode::{self, Tags};
use crate::feature::FeatureType;
use crate::geom::{BoundingBox, Coordinate};
use crate::store::{FeatureStore, PageNum, StoreOptions};
use crate::string::write_varstr;
use crate::tile::{Tile, NODE_FLAG_LEAF};

type TileKey = (u8, u32, u32);

/// Route store tracing into the test harness; honors RUST_LOG.
#[allow(dead_code)]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn key_of(tile: Tile) -> TileKey {
    (tile.zoom(), tile.col(), tile.row())
}

pub fn tile_center(tile: Tile) -> Coordinate {
    let b = tile.bounds();
    Coordinate::new(
        ((b.min_x as i64 + b.max_x as i64) / 2) as i32,
        ((b.min_y as i64 + b.max_y as i64) / 2) as i32,
    )
}

pub struct FixtureBuilder {
    strings: Vec<String>,
    string_index: HashMap<String, u16>,
    tiles: BTreeMap<TileKey, Vec<Vec<u8>>>,
}

impl FixtureBuilder {
    pub fn new() -> FixtureBuilder {
        FixtureBuilder {
            strings: Vec::new(),
            string_index: HashMap::new(),
            tiles: BTreeMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> u16 {
        if let Some(&i) = self.string_index.get(s) {
            return i;
        }
        let i = self.strings.len() as u16;
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), i);
        i
    }

    fn global_tags<'a>(&mut self, tags: &[(&str, &'a str)]) -> Tags<'a> {
        Tags::Global(tags.iter().map(|&(k, v)| (self.intern(k), v)).collect())
    }

    fn push(&mut self, tile: &str, record: Vec<u8>) {
        let t = Tile::from_string(tile).expect("fixture tile string");
        self.tiles.entry(key_of(t)).or_default().push(record);
    }

    /// A node somewhere inside the tile, displaced by id so fixtures get
    /// distinct positions.
    pub fn add_node(&mut self, tile: &str, id: u64, tags: &[(&str, &str)]) {
        let t = Tile::from_string(tile).expect("fixture tile string");
        let c = tile_center(t);
        let at = Coordinate::new(
            c.x.wrapping_add((id as i32 % 97) * 16),
            c.y.wrapping_add((id as i32 % 89) * 16),
        );
        self.add_node_at(tile, id, at, tags);
    }

    pub fn add_node_at(&mut self, tile: &str, id: u64, at: Coordinate, tags: &[(&str, &str)]) {
        let encoded = self.global_tags(tags);
        self.push(tile, encode::node(id, at, encoded));
    }

    /// A node whose tag table uses the inline local-key layout.
    pub fn add_node_local(&mut self, tile: &str, id: u64, tags: &[(&str, &str)]) {
        let t = Tile::from_string(tile).expect("fixture tile string");
        let at = tile_center(t);
        self.push(tile, encode::node(id, at, Tags::Local(tags.to_vec())));
    }

    pub fn add_way(
        &mut self,
        tile: &str,
        id: u64,
        area: bool,
        coords: &[(i32, i32)],
        tags: &[(&str, &str)],
    ) {
        let cs: Vec<Coordinate> = coords.iter().map(|&(x, y)| Coordinate::new(x, y)).collect();
        let encoded = self.global_tags(tags);
        self.push(tile, encode::way(id, area, &cs, encoded));
    }

    /// A small way placed around the tile's center.
    pub fn add_way_in_tile(&mut self, tile: &str, id: u64, area: bool, tags: &[(&str, &str)]) {
        let t = Tile::from_string(tile).expect("fixture tile string");
        let c = tile_center(t);
        let coords: Vec<(i32, i32)> = if area {
            vec![
                (c.x - 800, c.y - 800),
                (c.x + 800, c.y - 800),
                (c.x + 800, c.y + 800),
                (c.x - 800, c.y + 800),
            ]
        } else {
            vec![(c.x - 800, c.y), (c.x + 800, c.y + 100)]
        };
        self.add_way(tile, id, area, &coords, tags);
    }

    pub fn add_relation_in_tile(
        &mut self,
        tile: &str,
        id: u64,
        area: bool,
        members: &[(FeatureType, u64, &str)],
        tags: &[(&str, &str)],
    ) {
        let t = Tile::from_string(tile).expect("fixture tile string");
        let c = tile_center(t);
        let bounds = BoundingBox::new(c.x - 500, c.y - 500, c.x + 500, c.y + 500);
        let encoded = self.global_tags(tags);
        self.push(tile, encode::relation(id, area, bounds, members, encoded));
    }

    /// Write the store and reopen it read-only.
    pub fn build(&self, path: impl AsRef<Path>) -> Arc<FeatureStore> {
        let path = path.as_ref();
        let store = FeatureStore::create(path, StoreOptions::default()).unwrap();
        let mut txn = store.begin().unwrap();

        if !self.strings.is_empty() {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
            for s in &self.strings {
                write_varstr(&mut payload, s);
            }
            let page = txn.alloc_payload(&payload).unwrap();
            txn.set_properties_pointer(page);
        }

        let mut payload_pages: HashMap<TileKey, PageNum> = HashMap::new();
        for (key, records) in &self.tiles {
            let payload = encode::tile_payload(records);
            payload_pages.insert(*key, txn.alloc_payload(&payload).unwrap());
        }

        // Every payload tile plus its ancestor chain needs an index node.
        let mut need: BTreeSet<TileKey> = BTreeSet::new();
        for &(zoom, col, row) in self.tiles.keys() {
            let tile = Tile::new(zoom, col, row).unwrap();
            for z in 0..=zoom {
                need.insert(key_of(tile.ancestor(z).unwrap()));
            }
        }

        let max_zoom = need.iter().map(|k| k.0).max();
        let mut node_pages: HashMap<TileKey, PageNum> = HashMap::new();
        if let Some(max_zoom) = max_zoom {
            for zoom in (0..=max_zoom).rev() {
                for &key in need.iter().filter(|k| k.0 == zoom) {
                    let tile = Tile::new(key.0, key.1, key.2).unwrap();
                    let mut children: Vec<(u8, PageNum)> = Vec::new();
                    for q in 0..4u8 {
                        if let Some(child) = tile.child(q) {
                            if let Some(&page) = node_pages.get(&key_of(child)) {
                                children.push((q, page));
                            }
                        }
                    }
                    let payload = payload_pages.get(&key).copied().unwrap_or(0);
                    let bytes = encode_index_node(tile, payload, &children);
                    let page = txn.alloc_payload(&bytes).unwrap();
                    node_pages.insert(key, page);
                }
            }
            let root = node_pages
                .get(&(0, 0, 0))
                .copied()
                .expect("index reaches the zoom-0 root");
            txn.set_index_pointer(root);
        }

        txn.commit().unwrap();
        drop(store);
        FeatureStore::open(path).unwrap()
    }
}

fn encode_index_node(tile: Tile, payload: PageNum, children: &[(u8, PageNum)]) -> Vec<u8> {
    let mut out = vec![0u8; 20];
    out[0] = tile.zoom();
    out[1] = if children.is_empty() { NODE_FLAG_LEAF } else { 0 };
    out[4..8].copy_from_slice(&tile.col().to_le_bytes());
    out[8..12].copy_from_slice(&tile.row().to_le_bytes());
    out[12..16].copy_from_slice(&payload.to_le_bytes());
    let mask: u32 = children.iter().fold(0, |m, &(q, _)| m | 1 << q);
    out[16..20].copy_from_slice(&mask.to_le_bytes());
    for &(_, page) in children {
        out.extend_from_slice(&page.to_le_bytes());
    }
    out
}
