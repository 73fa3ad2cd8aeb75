//! Core domain types for the stratum staging store.
//!
//! The staging store sits between an OSM parser front-end and a
//! geometry-building output layer. This crate holds the vocabulary shared
//! across that boundary: element identifiers, tag collections, relation
//! members, the dirty-id tracker that schedules reprocessing during diff
//! updates, and the output-layer trait together with its null reference
//! implementation.

#![forbid(unsafe_code)]

mod element;
mod output;
mod tracker;

pub use element::{Member, MemberType, OsmId, Tags};
pub use output::{NullOutput, Output, OutputError};
pub use tracker::IdTracker;
