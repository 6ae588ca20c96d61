//! Filter composition
//!
//! Filters test features one by one and, where they can, whole tiles at
//! once: a tile verdict of `None` prunes the tile before any feature is
//! decoded, `All` lets the iterator skip per-feature tests. `ComboFilter`
//! chains filters and flattens nested combos so composition order never
//! changes behavior.

use std::sync::Arc;

use crate::feature::{Feature, FeatureType};
use crate::geom::{BoundingBox, Coordinate};
use crate::matcher::MatcherProgram;
use crate::tile::Tile;

/// Coarse verdict for every feature in a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileAcceptance {
    /// Every feature in the tile passes; per-feature tests may be skipped.
    All,
    /// Some features may pass; test each one.
    Some,
    /// No feature in the tile can pass; skip it.
    None,
}

/// A predicate over features with an optional tile-level fast path.
pub trait Filter: Send + Sync {
    fn accept(&self, feature: &Feature) -> bool;

    fn accept_tile(&self, _tile: &Tile) -> TileAcceptance {
        TileAcceptance::Some
    }

    /// Combos override this so `ComboFilter::add` can flatten them.
    fn as_combo(&self) -> Option<&ComboFilter> {
        None
    }
}

/// An ordered conjunction of filters.
#[derive(Default)]
pub struct ComboFilter {
    parts: Vec<Arc<dyn Filter>>,
}

impl ComboFilter {
    pub fn new() -> ComboFilter {
        ComboFilter { parts: Vec::new() }
    }

    /// Append a filter, splicing in the parts of nested combos.
    pub fn add(&mut self, filter: Arc<dyn Filter>) {
        match filter.as_combo() {
            Some(combo) => self.parts.extend(combo.parts.iter().cloned()),
            None => self.parts.push(filter),
        }
    }

    pub fn parts(&self) -> &[Arc<dyn Filter>] {
        &self.parts
    }

    /// The composition of an optional existing filter with a new one,
    /// collapsed to the single filter when that is all there is.
    pub fn compose(existing: Option<Arc<dyn Filter>>, added: Arc<dyn Filter>) -> Arc<dyn Filter> {
        let mut combo = ComboFilter::new();
        if let Some(filter) = existing {
            combo.add(filter);
        }
        combo.add(added);
        if combo.parts.len() == 1 {
            combo.parts.remove(0)
        } else {
            Arc::new(combo)
        }
    }
}

impl Filter for ComboFilter {
    fn accept(&self, feature: &Feature) -> bool {
        self.parts.iter().all(|f| f.accept(feature))
    }

    fn accept_tile(&self, tile: &Tile) -> TileAcceptance {
        let mut verdict = TileAcceptance::All;
        for filter in &self.parts {
            match filter.accept_tile(tile) {
                TileAcceptance::None => return TileAcceptance::None,
                TileAcceptance::Some => verdict = TileAcceptance::Some,
                TileAcceptance::All => {}
            }
        }
        verdict
    }

    fn as_combo(&self) -> Option<&ComboFilter> {
        Some(self)
    }
}

/// How a bounds filter relates features to its box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsMode {
    Intersects,
    Within,
}

/// Spatial test against a fixed box.
pub struct BoundsFilter {
    bounds: BoundingBox,
    mode: BoundsMode,
}

impl BoundsFilter {
    pub fn new(bounds: BoundingBox, mode: BoundsMode) -> BoundsFilter {
        BoundsFilter { bounds, mode }
    }
}

impl Filter for BoundsFilter {
    fn accept(&self, feature: &Feature) -> bool {
        match self.mode {
            BoundsMode::Intersects => self.bounds.intersects(&feature.bounds()),
            BoundsMode::Within => self.bounds.contains_box(&feature.bounds()),
        }
    }

    fn accept_tile(&self, tile: &Tile) -> TileAcceptance {
        let tb = tile.bounds();
        if !tb.intersects(&self.bounds) {
            return TileAcceptance::None;
        }
        // A feature listed in a tile intersects that tile, so a tile fully
        // inside the box implies intersection for all its features. The
        // same is not true for containment: a feature may leak out of its
        // tile.
        if self.mode == BoundsMode::Intersects && self.bounds.contains_box(&tb) {
            return TileAcceptance::All;
        }
        TileAcceptance::Some
    }
}

/// Features whose geometry contains a point. Area ways are tested against
/// their ring; everything else against its box.
pub struct ContainsPointFilter {
    point: Coordinate,
}

impl ContainsPointFilter {
    pub fn new(point: Coordinate) -> ContainsPointFilter {
        ContainsPointFilter { point }
    }
}

impl Filter for ContainsPointFilter {
    fn accept(&self, feature: &Feature) -> bool {
        if !feature.bounds().contains(self.point) {
            return false;
        }
        if feature.feature_type() == FeatureType::Way && feature.is_area() {
            return ring_contains(feature.coords(), self.point);
        }
        true
    }

    fn accept_tile(&self, tile: &Tile) -> TileAcceptance {
        if tile.bounds().contains(self.point) {
            TileAcceptance::Some
        } else {
            TileAcceptance::None
        }
    }
}

/// Ray cast along +x; the ring closes itself if needed.
fn ring_contains(coords: impl Iterator<Item = Coordinate>, point: Coordinate) -> bool {
    let mut inside = false;
    let mut first: Option<Coordinate> = None;
    let mut prev: Option<Coordinate> = None;
    for c in coords {
        if let Some(p) = prev {
            if crosses(p, c, point) {
                inside = !inside;
            }
        } else {
            first = Some(c);
        }
        prev = Some(c);
    }
    if let (Some(last), Some(head)) = (prev, first) {
        if last != head && crosses(last, head, point) {
            inside = !inside;
        }
    }
    inside
}

fn crosses(a: Coordinate, b: Coordinate, p: Coordinate) -> bool {
    if (a.y > p.y) == (b.y > p.y) {
        return false;
    }
    let t = (p.y as f64 - a.y as f64) / (b.y as f64 - a.y as f64);
    let x = a.x as f64 + t * (b.x as f64 - a.x as f64);
    x > p.x as f64
}

/// Features within a metric distance of a point, measured to the nearest
/// edge of the feature's box at the anchor's Mercator scale.
pub struct MaxDistanceFilter {
    point: Coordinate,
    meters: f64,
    window: BoundingBox,
}

impl MaxDistanceFilter {
    pub fn new(point: Coordinate, meters: f64) -> MaxDistanceFilter {
        MaxDistanceFilter {
            point,
            meters,
            window: BoundingBox::around(point, meters),
        }
    }
}

impl Filter for MaxDistanceFilter {
    fn accept(&self, feature: &Feature) -> bool {
        let units = feature.bounds().distance_sq(self.point).sqrt();
        units * self.point.meters_per_unit() <= self.meters
    }

    fn accept_tile(&self, tile: &Tile) -> TileAcceptance {
        if tile.bounds().intersects(&self.window) {
            TileAcceptance::Some
        } else {
            TileAcceptance::None
        }
    }
}

/// A user predicate. Never consulted for tiles, and required to be
/// re-entrant: the executor may call it from worker threads.
pub struct PredicateFilter<F> {
    predicate: F,
}

impl<F> PredicateFilter<F>
where
    F: Fn(&Feature) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> PredicateFilter<F> {
        PredicateFilter { predicate }
    }
}

impl<F> Filter for PredicateFilter<F>
where
    F: Fn(&Feature) -> bool + Send + Sync,
{
    fn accept(&self, feature: &Feature) -> bool {
        (self.predicate)(feature)
    }
}

/// Wraps a matcher program displaced by a later `query` call, so stacked
/// GOQL applications conjoin.
pub struct MatcherFilter {
    program: Arc<MatcherProgram>,
}

impl MatcherFilter {
    pub fn new(program: Arc<MatcherProgram>) -> MatcherFilter {
        MatcherFilter { program }
    }
}

impl Filter for MatcherFilter {
    fn accept(&self, feature: &Feature) -> bool {
        self.program.accept(feature) != 0
    }
}
