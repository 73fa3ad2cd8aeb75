//! Errors raised by the PostgreSQL middle store.
//!
//! A backend failure in the staging store invalidates the run: partial
//! writes here would surface as corrupted geometries downstream, so the
//! defined recovery is to restart the import (or re-run the whole diff).
//! Callers must treat every error from this module as fatal for the run.
//! Shorter-than-requested results (ways with unresolvable nodes, relations
//! with absent members) are *not* errors; the affected entries are elided
//! from the returned lists.

use stratum_core::{OsmId, OutputError};
use thiserror::Error;

use crate::cache::FlatCacheError;

/// Errors emitted by [`PgMiddle`](crate::PgMiddle) and its connections.
#[derive(Debug, Error)]
pub enum MiddleError {
    /// Establishing a backend connection failed.
    #[error("connection to database failed")]
    Connect(#[source] postgres::Error),
    /// Applying per-session settings (`synchronous_commit = off`) failed.
    #[error("failed to configure session for table {table}")]
    ConfigureSession {
        /// Table the connection belongs to.
        table: String,
        #[source]
        source: postgres::Error,
    },
    /// A schema statement (DROP/CREATE/BEGIN/COMMIT/ANALYZE/index) failed.
    #[error("schema statement failed on table {table}: {sql}")]
    Schema {
        /// Table the connection belongs to.
        table: String,
        /// The statement that failed.
        sql: String,
        #[source]
        source: postgres::Error,
    },
    /// Registering a prepared statement failed.
    #[error("failed to prepare statement {statement}")]
    Prepare {
        /// Contractual statement name.
        statement: &'static str,
        #[source]
        source: postgres::Error,
    },
    /// A prepared statement returned a backend error.
    #[error("statement {statement} failed")]
    Execute {
        /// Contractual statement name.
        statement: &'static str,
        #[source]
        source: postgres::Error,
    },
    /// A dependency-tracking statement was invoked outside append mode,
    /// where it is never registered.
    #[error("statement {statement} is only prepared in append mode")]
    StatementNotPrepared {
        /// Contractual statement name.
        statement: &'static str,
    },
    /// Opening or closing a COPY batch failed.
    #[error("COPY stream for table {table} failed")]
    Copy {
        /// Table the stream belongs to.
        table: String,
        #[source]
        source: postgres::Error,
    },
    /// Writing rows into an open COPY batch failed.
    #[error("writing COPY data for table {table} failed")]
    CopyWrite {
        /// Table the stream belongs to.
        table: String,
        #[source]
        source: std::io::Error,
    },
    /// The server has the `intarray` contrib module loaded. Its operator
    /// class overrides defeat the GIN indexes on `nodes[]` and `parts[]`,
    /// slowing diff updates to a crawl; refuse to run against such a
    /// database.
    #[error(
        "the target database has the intarray contrib module loaded; \
         it interferes with the array indexes used for diff updates; \
         use a database without intarray"
    )]
    IntarrayLoaded,
    /// Appending to tables whose id column width does not match this
    /// build. Re-create the database or use a matching build.
    #[error(
        "the target database was created with {stored_bits}-bit ids, \
         but this build uses {expected_bits}-bit ids; \
         re-create the database or append with a matching build"
    )]
    IdWidthMismatch {
        /// Width of the stored id column, in bits.
        stored_bits: u32,
        /// Width this build writes, in bits.
        expected_bits: u32,
    },
    /// The flat-file node cache failed.
    #[error(transparent)]
    FlatCache(#[from] FlatCacheError),
    /// A stored relation member key did not carry a valid type code and id.
    #[error("relation {id} has a malformed member key {key:?}")]
    MalformedMember {
        /// Relation whose member list is damaged.
        id: OsmId,
        /// The offending key.
        key: String,
    },
    /// The output layer rejected a pending element during a drain.
    #[error(transparent)]
    Output(#[from] OutputError),
}
