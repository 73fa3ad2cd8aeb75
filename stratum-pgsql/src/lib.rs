//! PostgreSQL middle store for the stratum staging layer.
//!
//! This crate implements the staging store between an OSM parser and the
//! geometry-building output layer: a budgeted in-memory node cache, an
//! optional direct-addressed flat file for node coordinates, and three
//! relational tables (nodes/ways/relations) fed over one connection per
//! table so bulk COPY streaming on one table never blocks lookups on
//! another. During diff updates, inverted-index queries over the `nodes`
//! and `parts` arrays mark dependent ways and relations for reprocessing.

#![forbid(unsafe_code)]

mod cache;
mod codec;
mod error;
mod middle;
mod options;
mod sql;
mod table;

pub use cache::{FlatCacheError, FlatNodeCache, NodeRamCache};
pub use codec::{
    append_id_array, append_text_array, parse_id_array, parse_text_array, ArrayParseError,
    EscapeMode,
};
pub use error::MiddleError;
pub use middle::PgMiddle;
pub use options::{CoordRepr, MiddleOptions};
