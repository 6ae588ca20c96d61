//! The Features façade
//!
//! A `Features` value names a query without running it: a store handle, an
//! accepted-type mask, an optional compiled matcher, an optional filter
//! chain, and a bounding window. Every refinement method returns a new
//! value and leaves the receiver untouched, so handles compose like
//! persistent values and are freely copyable across threads.
//!
//! Materialization is lazy. Iteration walks the tile index depth-first,
//! streams each tile's records, and applies type mask, matcher, window
//! and filters per feature; a tile-level `All` verdict from the filter
//! chain skips the per-feature filter calls for that tile. Nothing is
//! cached: `count()` followed by iteration pays the walk twice.

use std::ops::Deref;
use std::sync::Arc;

use tracing::debug;

use crate::error::{QueryError, Result};
use crate::feature::{Feature, FeaturePtr, TypeMask};
use crate::filter::{
    BoundsFilter, BoundsMode, ComboFilter, ContainsPointFilter, Filter, MaxDistanceFilter,
    MatcherFilter, PredicateFilter, TileAcceptance,
};
use crate::geom::{BoundingBox, Coordinate};
use crate::goql::compile_query;
use crate::mapping::SegmentMap;
use crate::matcher::MatcherProgram;
use crate::store::{FeatureStore, PageNum};
use crate::tile::{Tile, TileWalker};
use crate::units::Unit;

/// A lazily evaluated feature query. Cloning is cheap; all heavy state is
/// reference-counted and immutable.
#[derive(Clone)]
pub struct Features {
    store: Arc<FeatureStore>,
    types: TypeMask,
    matcher: Option<Arc<MatcherProgram>>,
    filter: Option<Arc<dyn Filter>>,
    bounds: BoundingBox,
}

impl Features {
    /// Open the store at `path` and view every feature in it.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Features> {
        Ok(Features::from_store(FeatureStore::open(path)?))
    }

    /// View every feature of an already-open store.
    pub fn from_store(store: Arc<FeatureStore>) -> Features {
        Features {
            store,
            types: TypeMask::all(),
            matcher: None,
            filter: None,
            bounds: BoundingBox::world(),
        }
    }

    pub fn store(&self) -> &Arc<FeatureStore> {
        &self.store
    }

    /// Restrict by a GOQL query. A matcher already in place moves into
    /// the filter chain, so stacked queries conjoin.
    pub fn query(&self, goql: &str) -> Result<Features> {
        let compiled = compile_query(&self.store, goql)?;
        let mut next = self.clone();
        next.types &= compiled.types;
        if let Some(previous) = next.matcher.take() {
            next.filter = Some(ComboFilter::compose(
                next.filter.take(),
                Arc::new(MatcherFilter::new(previous)),
            ));
        }
        next.matcher = Some(Arc::new(compiled.program));
        Ok(next)
    }

    fn restrict(&self, mask: TypeMask) -> Features {
        let mut next = self.clone();
        next.types &= mask;
        next
    }

    pub fn nodes(&self) -> Nodes {
        Nodes(self.restrict(TypeMask::NODES))
    }

    pub fn ways(&self) -> Ways {
        Ways(self.restrict(TypeMask::WAYS))
    }

    pub fn relations(&self) -> Relations {
        Relations(self.restrict(TypeMask::RELATIONS))
    }

    fn with_filter(&self, filter: Arc<dyn Filter>) -> Features {
        let mut next = self.clone();
        next.filter = Some(ComboFilter::compose(next.filter.take(), filter));
        next
    }

    /// Features lying entirely inside `bounds`.
    pub fn within(&self, bounds: BoundingBox) -> Features {
        let mut next = self.with_filter(Arc::new(BoundsFilter::new(bounds, BoundsMode::Within)));
        next.bounds = next.bounds.intersection(&bounds);
        next
    }

    /// Features whose extent overlaps `bounds`.
    pub fn intersecting(&self, bounds: BoundingBox) -> Features {
        let mut next =
            self.with_filter(Arc::new(BoundsFilter::new(bounds, BoundsMode::Intersects)));
        next.bounds = next.bounds.intersection(&bounds);
        next
    }

    /// Features whose geometry contains `point`.
    pub fn containing(&self, point: Coordinate) -> Features {
        let mut next = self.with_filter(Arc::new(ContainsPointFilter::new(point)));
        next.bounds = next.bounds.intersection(&BoundingBox::point(point));
        next
    }

    /// Features within `meters` of `center`.
    pub fn max_meters_from(&self, meters: f64, center: Coordinate) -> Features {
        let window = BoundingBox::around(center, meters);
        let mut next = self.with_filter(Arc::new(MaxDistanceFilter::new(center, meters)));
        next.bounds = next.bounds.intersection(&window);
        next
    }

    /// Features within `value` `unit`s of `center`.
    pub fn max_distance_from(&self, value: f64, unit: Unit, center: Coordinate) -> Features {
        self.max_meters_from(unit.to_meters(value), center)
    }

    /// Features passing a caller predicate. The predicate must be
    /// re-entrant; in multi-threaded mode it may run on worker threads.
    pub fn filter<P>(&self, predicate: P) -> Features
    where
        P: Fn(&Feature) -> bool + Send + Sync + 'static,
    {
        self.with_filter(Arc::new(PredicateFilter::new(predicate)))
    }

    /// Restrict the query to one tile's extent. Fails with `MissingTile`
    /// if the store's index has no payload for that tile.
    pub fn in_tile(&self, tile: Tile) -> Result<Features> {
        let header = self.store.header_snapshot();
        let walker = TileWalker::new(self.store.clone(), header.index_pointer, tile.bounds());
        let mut present = false;
        for item in walker {
            let (t, _page) = item?;
            if t == tile {
                present = true;
                break;
            }
        }
        if !present {
            return Err(QueryError::MissingTile(tile).into());
        }
        let mut next = self.clone();
        next.bounds = next.bounds.intersection(&tile.bounds());
        Ok(next)
    }

    pub fn iter(&self) -> FeatureIter {
        FeatureIter::new(self)
    }

    /// Number of features the query yields.
    pub fn count(&self) -> Result<u64> {
        #[cfg(feature = "multithreaded")]
        {
            crate::executor::parallel_count(self)
        }
        #[cfg(not(feature = "multithreaded"))]
        {
            let mut n = 0u64;
            for feature in self.iter() {
                feature?;
                n += 1;
            }
            Ok(n)
        }
    }

    /// The first feature in iteration order, if any.
    pub fn first(&self) -> Result<Option<Feature>> {
        self.iter().next().transpose()
    }

    /// Exactly one result. `Empty` on none, `NotUnique` on two or more.
    pub fn one(&self) -> Result<Feature> {
        let mut iter = self.iter();
        let first = match iter.next() {
            None => return Err(QueryError::Empty.into()),
            Some(feature) => feature?,
        };
        match iter.next() {
            None => Ok(first),
            Some(Err(e)) => Err(e),
            Some(Ok(_)) => Err(QueryError::NotUnique.into()),
        }
    }

    /// Collect eagerly.
    pub fn to_vec(&self) -> Result<Vec<Feature>> {
        self.iter().collect()
    }
}

impl std::fmt::Debug for Features {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Features")
            .field("store", &self.store.path())
            .field("types", &self.types)
            .field("matched", &self.matcher.is_some())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl<'a> IntoIterator for &'a Features {
    type Item = Result<Feature>;
    type IntoIter = FeatureIter;

    fn into_iter(self) -> FeatureIter {
        self.iter()
    }
}

macro_rules! typed_view {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone)]
        pub struct $name(Features);

        impl $name {
            pub fn into_inner(self) -> Features {
                self.0
            }
        }

        impl Deref for $name {
            type Target = Features;

            fn deref(&self) -> &Features {
                &self.0
            }
        }

        impl<'a> IntoIterator for &'a $name {
            type Item = Result<Feature>;
            type IntoIter = FeatureIter;

            fn into_iter(self) -> FeatureIter {
                self.0.iter()
            }
        }
    };
}

typed_view!(Nodes, "A Features view restricted to nodes.");
typed_view!(Ways, "A Features view restricted to ways.");
typed_view!(Relations, "A Features view restricted to relations.");

struct TileCursor {
    tile: Tile,
    page: PageNum,
    seg: Arc<SegmentMap>,
    payload_abs: usize,
    payload_len: usize,
    next: usize,
    remaining: u32,
}

/// Pull iterator over a query's results: the tile walker, the current
/// tile's record cursor, and the filter chain, as one state machine.
/// Dropping it mid-stream releases everything it holds.
pub struct FeatureIter {
    store: Arc<FeatureStore>,
    types: TypeMask,
    matcher: Option<Arc<MatcherProgram>>,
    filter: Option<Arc<dyn Filter>>,
    bounds: BoundingBox,
    walker: TileWalker,
    cursor: Option<TileCursor>,
    skip_tile_filter: bool,
    done: bool,
}

impl FeatureIter {
    fn new(features: &Features) -> FeatureIter {
        let header = features.store.header_snapshot();
        FeatureIter {
            store: features.store.clone(),
            types: features.types,
            matcher: features.matcher.clone(),
            filter: features.filter.clone(),
            bounds: features.bounds,
            walker: TileWalker::new(
                features.store.clone(),
                header.index_pointer,
                features.bounds,
            ),
            cursor: None,
            skip_tile_filter: false,
            done: false,
        }
    }

    /// An iterator over a single, already-located tile; the executor's
    /// per-task unit.
    #[cfg(feature = "multithreaded")]
    pub(crate) fn single_tile(
        features: &Features,
        tile: Tile,
        page: PageNum,
        skip_tile_filter: bool,
    ) -> Result<FeatureIter> {
        let cursor = load_cursor(&features.store, tile, page)?;
        Ok(FeatureIter {
            store: features.store.clone(),
            types: features.types,
            matcher: features.matcher.clone(),
            filter: features.filter.clone(),
            bounds: features.bounds,
            walker: TileWalker::new(features.store.clone(), 0, features.bounds),
            cursor: Some(cursor),
            skip_tile_filter,
            done: false,
        })
    }

    fn fail(&mut self, e: crate::error::Error) -> Option<Result<Feature>> {
        self.done = true;
        self.cursor = None;
        Some(Err(e))
    }

    /// Decode the next record of an owned cursor and apply the per-feature
    /// tests. `Ok(Some)` yields, `Ok(None)` filters it out, `Err` is a
    /// corrupt record.
    fn step(&self, cur: &mut TileCursor) -> Result<Option<Feature>> {
        let off = cur.next;
        let end = cur.payload_abs + cur.payload_len;
        let bytes = &cur.seg.bytes()[cur.payload_abs..end];
        if off + 32 > bytes.len() {
            return Err(crate::error::Error::InvalidFormat(format!(
                "record in tile {} truncated",
                cur.tile
            )));
        }
        let body = u32::from_le_bytes([
            bytes[off + 28],
            bytes[off + 29],
            bytes[off + 30],
            bytes[off + 31],
        ]) as usize;
        if body < 32 || off + body > bytes.len() {
            return Err(crate::error::Error::InvalidFormat(format!(
                "record in tile {} has bad body size {}",
                cur.tile, body
            )));
        }
        cur.next = (off + body + 3) & !3;
        cur.remaining -= 1;

        let feature = Feature::new(
            self.store.clone(),
            cur.tile,
            FeaturePtr {
                page: cur.page,
                offset: off as u32,
            },
            cur.seg.clone(),
            cur.payload_abs + off,
            body,
        );
        if !self.types.contains(feature.type_bit()) {
            return Ok(None);
        }
        if !self.bounds.intersects(&feature.bounds()) {
            return Ok(None);
        }
        if let Some(matcher) = &self.matcher {
            if matcher.accept(&feature) == 0 {
                return Ok(None);
            }
        }
        if !self.skip_tile_filter {
            if let Some(filter) = &self.filter {
                if !filter.accept(&feature) {
                    return Ok(None);
                }
            }
        }
        Ok(Some(feature))
    }
}

fn load_cursor(store: &Arc<FeatureStore>, tile: Tile, page: PageNum) -> Result<TileCursor> {
    let blob = store.blob(page)?;
    let payload = blob.payload();
    if payload.len() < 8 {
        return Err(crate::error::Error::InvalidFormat(format!(
            "tile {} payload truncated",
            tile
        )));
    }
    let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    debug!(tile = %tile, features = count, "scanning tile");
    Ok(TileCursor {
        tile,
        page,
        seg: blob.seg.clone(),
        payload_abs: blob.payload_start(),
        payload_len: blob.payload().len(),
        next: 8,
        remaining: count,
    })
}

impl Iterator for FeatureIter {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(mut cur) = self.cursor.take() {
                while cur.remaining > 0 {
                    match self.step(&mut cur) {
                        Err(e) => return self.fail(e),
                        Ok(Some(feature)) => {
                            self.cursor = Some(cur);
                            return Some(Ok(feature));
                        }
                        Ok(None) => {}
                    }
                }
            }

            match self.walker.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => return self.fail(e),
                Some(Ok((tile, page))) => {
                    let mut skip = false;
                    if let Some(filter) = &self.filter {
                        match filter.accept_tile(&tile) {
                            TileAcceptance::None => continue,
                            TileAcceptance::All => skip = true,
                            TileAcceptance::Some => {}
                        }
                    }
                    self.store.prefetch(page);
                    match load_cursor(&self.store, tile, page) {
                        Ok(cursor) => {
                            self.cursor = Some(cursor);
                            self.skip_tile_filter = skip;
                        }
                        Err(e) => return self.fail(e),
                    }
                }
            }
        }
    }
}

/// Tile candidates for a query, with the filter's tile verdict applied.
/// The executor feeds these to workers.
#[cfg(feature = "multithreaded")]
pub(crate) struct TileCandidates {
    walker: TileWalker,
    filter: Option<Arc<dyn Filter>>,
}

#[cfg(feature = "multithreaded")]
impl TileCandidates {
    pub fn new(features: &Features) -> TileCandidates {
        let header = features.store.header_snapshot();
        TileCandidates {
            walker: TileWalker::new(
                features.store.clone(),
                header.index_pointer,
                features.bounds,
            ),
            filter: features.filter.clone(),
        }
    }
}

#[cfg(feature = "multithreaded")]
impl Iterator for TileCandidates {
    type Item = Result<(Tile, PageNum, bool)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.walker.next()? {
                Err(e) => return Some(Err(e)),
                Ok((tile, page)) => {
                    let mut skip = false;
                    if let Some(filter) = &self.filter {
                        match filter.accept_tile(&tile) {
                            TileAcceptance::None => continue,
                            TileAcceptance::All => skip = true,
                            TileAcceptance::Some => {}
                        }
                    }
                    return Some(Ok((tile, page, skip)));
                }
            }
        }
    }
}
