//! gol-core: random-access, queryable storage for Geographic Object
//! Library (GOL) files
//!
//! A GOL is a single memory-mapped file of fixed-size pages grouped into
//! 1 GiB segments, with a two-level free table for blob allocation and a
//! quadtree tile index over its features. This crate provides:
//!
//! - the page-oriented blob store with crash-safe transactional mutation
//!   (journal sidecar, checksummed header)
//! - a bytecode interpreter for compiled GOQL tag predicates
//! - the lazy `Features` query pipeline: type masks, matchers, spatial
//!   and user filters over a depth-first tile walk
//!
//! The on-disk format is little-endian and bit-exact; see the module docs
//! of `store`, `transaction`, `tile` and `feature` for the layouts.
//!
//! Reading is the dominant mode. The single-writer `Transaction` exists
//! for maintenance; readers keep a consistent header snapshot while a
//! writer runs and only observe its effects after commit.

pub mod error;
pub mod feature;
pub mod features;
pub mod filter;
pub mod geom;
pub mod goql;
pub mod mapping;
pub mod matcher;
pub mod store;
pub mod string;
pub mod taskqueue;
pub mod tile;
pub mod transaction;
pub mod units;
pub mod validate;

#[cfg(feature = "multithreaded")]
mod executor;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience
pub use error::{Error, QueryError, Result};
pub use feature::{Feature, FeaturePtr, FeatureType, Member, TypeMask};
pub use features::{FeatureIter, Features, Nodes, Relations, Ways};
pub use filter::{ComboFilter, Filter, TileAcceptance};
pub use geom::{BoundingBox, Coordinate};
pub use goql::{compile_query, ClauseOp, CompiledQuery, Selector, TagClause};
pub use matcher::MatcherProgram;
pub use store::{FeatureStore, PageNum, StoreOptions, StoreStats};
pub use taskqueue::TaskQueue;
pub use tile::{Tile, TileWalker};
pub use transaction::Transaction;
pub use units::Unit;
pub use validate::{free_table_entries, validate_store, BlobStats, ValidationReport};
