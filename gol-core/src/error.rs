//! Error types for gol-core

use std::path::PathBuf;

use thiserror::Error;

use crate::tile::Tile;

#[derive(Error, Debug)]
pub enum Error {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("store full: {0}")]
    StoreFull(String),

    #[error("query error: {0}")]
    Query(#[from] QueryError),
}

/// Errors raised while compiling or evaluating a query.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("syntax error at column {column}: {message}")]
    Syntax { column: usize, message: String },

    #[error("query produced no results")]
    Empty,

    #[error("query produced more than one result")]
    NotUnique,

    #[error("tile {0} is not present in the store")]
    MissingTile(Tile),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::InvalidFormat(e.to_string())
    }
}
