//! The output-layer seam and its null reference implementation.
//!
//! The staging store drives the output layer in two ways: element
//! add/modify/delete notifications as data streams in, and pending-way /
//! pending-relation callbacks while the dirty trackers drain. `NullOutput`
//! accepts everything and touches nothing; it is used to exercise the
//! staging store alone and as a placeholder while input is validated.

use geo::Coord;
use thiserror::Error;

use crate::{Member, OsmId, Tags};

/// Error surfaced by an output layer implementation.
///
/// The staging store does not interpret the failure; it stops the drain
/// loop and hands the error back to the caller.
#[derive(Debug, Error)]
#[error("output layer failed: {reason}")]
pub struct OutputError {
    /// Human-readable description from the output layer.
    pub reason: String,
}

impl OutputError {
    /// Constructs an error with the given description.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Geometry-building output layer driven by the staging store.
///
/// Coordinates use `geo::Coord` with `x` = longitude and `y` = latitude.
/// The `exists` flag on the pending callbacks is true in append (diff
/// update) mode, where the element may already have been emitted by an
/// earlier run.
pub trait Output {
    fn node_add(&mut self, id: OsmId, location: Coord<f64>, tags: &Tags)
        -> Result<(), OutputError>;
    fn way_add(&mut self, id: OsmId, nodes: &[OsmId], tags: &Tags) -> Result<(), OutputError>;
    fn relation_add(
        &mut self,
        id: OsmId,
        members: &[Member],
        tags: &Tags,
    ) -> Result<(), OutputError>;

    fn node_modify(
        &mut self,
        id: OsmId,
        location: Coord<f64>,
        tags: &Tags,
    ) -> Result<(), OutputError>;
    fn way_modify(&mut self, id: OsmId, nodes: &[OsmId], tags: &Tags) -> Result<(), OutputError>;
    fn relation_modify(
        &mut self,
        id: OsmId,
        members: &[Member],
        tags: &Tags,
    ) -> Result<(), OutputError>;

    fn node_delete(&mut self, id: OsmId) -> Result<(), OutputError>;
    fn way_delete(&mut self, id: OsmId) -> Result<(), OutputError>;
    fn relation_delete(&mut self, id: OsmId) -> Result<(), OutputError>;

    /// Invoked for each pending way while the way tracker drains, with the
    /// way's tags and its resolved node coordinates in way order.
    fn pending_way(
        &mut self,
        id: OsmId,
        tags: &Tags,
        nodes: &[Coord<f64>],
        exists: bool,
    ) -> Result<(), OutputError>;

    /// Invoked for each pending relation while the relation tracker drains.
    fn pending_relation(
        &mut self,
        id: OsmId,
        members: &[Member],
        tags: &Tags,
        exists: bool,
    ) -> Result<(), OutputError>;
}

/// Output layer that accepts every call and performs no work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl Output for NullOutput {
    fn node_add(&mut self, _: OsmId, _: Coord<f64>, _: &Tags) -> Result<(), OutputError> {
        Ok(())
    }

    fn way_add(&mut self, _: OsmId, _: &[OsmId], _: &Tags) -> Result<(), OutputError> {
        Ok(())
    }

    fn relation_add(&mut self, _: OsmId, _: &[Member], _: &Tags) -> Result<(), OutputError> {
        Ok(())
    }

    fn node_modify(&mut self, _: OsmId, _: Coord<f64>, _: &Tags) -> Result<(), OutputError> {
        Ok(())
    }

    fn way_modify(&mut self, _: OsmId, _: &[OsmId], _: &Tags) -> Result<(), OutputError> {
        Ok(())
    }

    fn relation_modify(&mut self, _: OsmId, _: &[Member], _: &Tags) -> Result<(), OutputError> {
        Ok(())
    }

    fn node_delete(&mut self, _: OsmId) -> Result<(), OutputError> {
        Ok(())
    }

    fn way_delete(&mut self, _: OsmId) -> Result<(), OutputError> {
        Ok(())
    }

    fn relation_delete(&mut self, _: OsmId) -> Result<(), OutputError> {
        Ok(())
    }

    fn pending_way(
        &mut self,
        _: OsmId,
        _: &Tags,
        _: &[Coord<f64>],
        _: bool,
    ) -> Result<(), OutputError> {
        Ok(())
    }

    fn pending_relation(
        &mut self,
        _: OsmId,
        _: &[Member],
        _: &Tags,
        _: bool,
    ) -> Result<(), OutputError> {
        Ok(())
    }
}
