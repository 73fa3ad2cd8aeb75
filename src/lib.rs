//! Facade crate for the stratum staging store.
//!
//! Stratum sits between an OpenStreetMap parser front-end and a
//! geometry-building output layer: it stages raw nodes, ways and relations
//! in PostgreSQL (plus in-memory and flat-file node caches) so the output
//! layer can resolve way nodes and relation members by id while geometries
//! are assembled. This crate re-exports the core domain types and the
//! PostgreSQL middle store behind a default feature flag.

#![forbid(unsafe_code)]

pub use stratum_core::{
    IdTracker, Member, MemberType, NullOutput, OsmId, Output, OutputError, Tags,
};

#[cfg(feature = "middle-pgsql")]
pub use stratum_pgsql::{
    CoordRepr, FlatNodeCache, MiddleError, MiddleOptions, NodeRamCache, PgMiddle,
};
