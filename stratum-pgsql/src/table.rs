//! Per-table backend connections.
//!
//! The store opens one connection per table because a connection in
//! copy-in mode cannot serve anything else: separate connections let
//! node rows stream while way or relation lookups proceed. Each
//! connection carries its templated SQL set, a prepared-statement
//! catalog, and two state flags: `copy_mode` while the bulk stream is
//! logically open and `txn_mode` while an explicit transaction is.
//!
//! Copy mode buffers tab-delimited lines and ships them in bounded
//! `COPY ... FROM STDIN` batches; `end_copy` pushes the tail batch and
//! drains the stream, which is why every read on a connection must call
//! it first; afterwards the read observes all rows streamed so far.

use std::collections::HashMap;
use std::time::Instant;

use log::info;
use postgres::{Client, NoTls, Row, SimpleQueryMessage, Statement};
use postgres::types::{ToSql, Type};
use stratum_core::OsmId;

use crate::error::MiddleError;
use crate::options::MiddleOptions;
use crate::sql::{expand, TemplateVars};

/// Buffered copy bytes that trigger an intermediate batch.
const COPY_FLUSH_BYTES: usize = 512 * 1024;

/// Templated SQL set for one table.
#[derive(Debug, Clone)]
pub(crate) struct TableDesc {
    pub(crate) name: String,
    start: Option<&'static str>,
    create: Option<String>,
    prepare: Vec<(&'static str, String)>,
    /// Dependency-tracking statements, registered in append mode only.
    prepare_dependency: Vec<(&'static str, String)>,
    copy: String,
    analyze: String,
    stop: Option<&'static str>,
    array_indexes: Option<String>,
}

impl TableDesc {
    pub(crate) fn nodes(opts: &MiddleOptions) -> Self {
        let vars = template_vars(opts);
        let coord = opts.coord_repr.sql_type();
        Self {
            name: expand("%p_nodes", &vars),
            start: Some("BEGIN"),
            create: Some(expand(
                &format!(
                    "CREATE %m TABLE %p_nodes (id int8 PRIMARY KEY {{USING INDEX TABLESPACE %i}}, \
                     lat {coord} not null, lon {coord} not null, tags text[]) {{TABLESPACE %t}}"
                ),
                &vars,
            )),
            prepare: vec![
                ("insert_node", expand("INSERT INTO %p_nodes VALUES ($1, $2, $3, $4)", &vars)),
                ("get_node", expand("SELECT lat, lon FROM %p_nodes WHERE id = $1 LIMIT 1", &vars)),
                (
                    "get_node_list",
                    expand("SELECT id, lat, lon FROM %p_nodes WHERE id = ANY($1::int8[])", &vars),
                ),
                ("delete_node", expand("DELETE FROM %p_nodes WHERE id = $1", &vars)),
            ],
            prepare_dependency: Vec::new(),
            copy: expand("COPY %p_nodes FROM STDIN", &vars),
            analyze: expand("ANALYZE %p_nodes", &vars),
            stop: Some("COMMIT"),
            array_indexes: None,
        }
    }

    pub(crate) fn ways(opts: &MiddleOptions) -> Self {
        let vars = template_vars(opts);
        Self {
            name: expand("%p_ways", &vars),
            start: Some("BEGIN"),
            create: Some(expand(
                "CREATE %m TABLE %p_ways (id int8 PRIMARY KEY {USING INDEX TABLESPACE %i}, \
                 nodes int8[] not null, tags text[]) {TABLESPACE %t}",
                &vars,
            )),
            prepare: vec![
                ("insert_way", expand("INSERT INTO %p_ways VALUES ($1, $2, $3)", &vars)),
                ("get_way", expand("SELECT nodes, tags FROM %p_ways WHERE id = $1", &vars)),
                (
                    "get_way_list",
                    expand("SELECT id, nodes, tags FROM %p_ways WHERE id = ANY($1::int8[])", &vars),
                ),
                ("delete_way", expand("DELETE FROM %p_ways WHERE id = $1", &vars)),
            ],
            prepare_dependency: vec![
                (
                    "mark_ways_by_node",
                    expand("SELECT id FROM %p_ways WHERE nodes && ARRAY[$1::int8]", &vars),
                ),
                (
                    "mark_ways_by_rel",
                    expand(
                        "SELECT id FROM %p_ways WHERE id IN \
                         (SELECT unnest(parts[way_off+1:rel_off]) FROM %p_rels WHERE id = $1)",
                        &vars,
                    ),
                ),
            ],
            copy: expand("COPY %p_ways FROM STDIN", &vars),
            analyze: expand("ANALYZE %p_ways", &vars),
            stop: Some("COMMIT"),
            array_indexes: Some(expand(
                "CREATE INDEX %p_ways_nodes ON %p_ways USING gin (nodes) {TABLESPACE %i}",
                &vars,
            )),
        }
    }

    pub(crate) fn rels(opts: &MiddleOptions) -> Self {
        let vars = template_vars(opts);
        Self {
            name: expand("%p_rels", &vars),
            start: Some("BEGIN"),
            create: Some(expand(
                "CREATE %m TABLE %p_rels (id int8 PRIMARY KEY {USING INDEX TABLESPACE %i}, \
                 way_off int2, rel_off int2, parts int8[], members text[], tags text[]) \
                 {TABLESPACE %t}",
                &vars,
            )),
            prepare: vec![
                ("insert_rel", expand("INSERT INTO %p_rels VALUES ($1, $2, $3, $4, $5, $6)", &vars)),
                ("get_rel", expand("SELECT members, tags FROM %p_rels WHERE id = $1", &vars)),
                ("delete_rel", expand("DELETE FROM %p_rels WHERE id = $1", &vars)),
            ],
            prepare_dependency: vec![
                (
                    "rels_using_way",
                    expand(
                        "SELECT id FROM %p_rels WHERE parts && ARRAY[$1::int8] \
                         AND parts[way_off+1:rel_off] && ARRAY[$1::int8]",
                        &vars,
                    ),
                ),
                (
                    "mark_rels_by_node",
                    expand(
                        "SELECT id FROM %p_rels WHERE parts && ARRAY[$1::int8] \
                         AND parts[1:way_off] && ARRAY[$1::int8]",
                        &vars,
                    ),
                ),
                (
                    "mark_rels_by_way",
                    expand(
                        "SELECT id FROM %p_rels WHERE parts && ARRAY[$1::int8] \
                         AND parts[way_off+1:rel_off] && ARRAY[$1::int8]",
                        &vars,
                    ),
                ),
                (
                    "mark_rels",
                    expand(
                        "SELECT id FROM %p_rels WHERE parts && ARRAY[$1::int8] \
                         AND parts[rel_off+1:array_length(parts,1)] && ARRAY[$1::int8]",
                        &vars,
                    ),
                ),
            ],
            copy: expand("COPY %p_rels FROM STDIN", &vars),
            analyze: expand("ANALYZE %p_rels", &vars),
            stop: Some("COMMIT"),
            array_indexes: Some(expand(
                "CREATE INDEX %p_rels_parts ON %p_rels USING gin (parts) {TABLESPACE %i}",
                &vars,
            )),
        }
    }
}

fn template_vars(opts: &MiddleOptions) -> TemplateVars<'_> {
    TemplateVars {
        prefix: &opts.prefix,
        tablespace_data: opts.tablespace_data.as_deref(),
        tablespace_index: opts.tablespace_index.as_deref(),
        unlogged: opts.unlogged,
    }
}

/// Inserts `WITH (FASTUPDATE=OFF)` ahead of any `TABLESPACE` clause, or
/// appends it when there is none. Servers from 8.4 on accept the option
/// and it keeps bulk index builds from maintaining the fastupdate
/// pending list.
fn with_fastupdate_off(sql: &str) -> String {
    match sql.find("TABLESPACE") {
        Some(pos) => format!("{}WITH (FASTUPDATE=OFF) {}", &sql[..pos], &sql[pos..]),
        None => format!("{} WITH (FASTUPDATE=OFF)", sql.trim_end()),
    }
}

/// One table's connection, statement catalog and streaming state.
pub(crate) struct TableConn {
    pub(crate) desc: TableDesc,
    client: Client,
    statements: HashMap<&'static str, Statement>,
    copy_mode: bool,
    txn_mode: bool,
    copy_buf: String,
}

impl TableConn {
    /// Connects and applies the per-session settings.
    ///
    /// `synchronous_commit = off` trades the last few commits on a crash
    /// for bulk throughput; the defined recovery for this store is a
    /// rerun, so nothing of value is at risk.
    pub(crate) fn connect(conninfo: &str, desc: TableDesc) -> Result<Self, MiddleError> {
        let mut client = Client::connect(conninfo, NoTls).map_err(MiddleError::Connect)?;
        client
            .batch_execute("SET synchronous_commit TO off")
            .map_err(|source| MiddleError::ConfigureSession {
                table: desc.name.clone(),
                source,
            })?;
        Ok(Self {
            desc,
            client,
            statements: HashMap::new(),
            copy_mode: false,
            txn_mode: false,
            copy_buf: String::new(),
        })
    }

    fn schema_err(&self, sql: &str, source: postgres::Error) -> MiddleError {
        MiddleError::Schema {
            table: self.desc.name.clone(),
            sql: sql.to_owned(),
            source,
        }
    }

    fn schema_exec(&mut self, sql: &str) -> Result<(), MiddleError> {
        self.client
            .batch_execute(sql)
            .map_err(|source| MiddleError::Schema {
                table: self.desc.name.clone(),
                sql: sql.to_owned(),
                source,
            })
    }

    /// Drops the table if it exists (fresh-import setup).
    pub(crate) fn drop_table(&mut self) -> Result<(), MiddleError> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.desc.name);
        self.schema_exec(&sql)
    }

    /// Creates the table.
    pub(crate) fn create_table(&mut self) -> Result<(), MiddleError> {
        if let Some(create) = self.desc.create.clone() {
            self.schema_exec(&create)?;
        }
        Ok(())
    }

    /// Opens the per-table transaction.
    pub(crate) fn begin(&mut self) -> Result<(), MiddleError> {
        if let Some(start) = self.desc.start {
            self.schema_exec(start)?;
            self.txn_mode = true;
        }
        Ok(())
    }

    /// Flushes any open copy stream, then commits the open transaction.
    pub(crate) fn commit(&mut self) -> Result<(), MiddleError> {
        self.end_copy()?;
        if self.txn_mode {
            if let Some(stop) = self.desc.stop {
                self.schema_exec(stop)?;
            }
            self.txn_mode = false;
        }
        Ok(())
    }

    /// Registers the main prepared statements.
    pub(crate) fn prepare_main(&mut self) -> Result<(), MiddleError> {
        let set: Vec<(&'static str, String)> = self.desc.prepare.clone();
        self.prepare_set(&set)
    }

    /// Registers the dependency-tracking statements (append mode only).
    pub(crate) fn prepare_dependency(&mut self) -> Result<(), MiddleError> {
        let set: Vec<(&'static str, String)> = self.desc.prepare_dependency.clone();
        self.prepare_set(&set)
    }

    fn prepare_set(&mut self, set: &[(&'static str, String)]) -> Result<(), MiddleError> {
        for (name, sql) in set {
            let stmt = self
                .client
                .prepare(sql)
                .map_err(|source| MiddleError::Prepare {
                    statement: name,
                    source,
                })?;
            self.statements.insert(name, stmt);
        }
        Ok(())
    }

    fn statement(&self, name: &'static str) -> Result<Statement, MiddleError> {
        self.statements
            .get(name)
            .cloned()
            .ok_or(MiddleError::StatementNotPrepared { statement: name })
    }

    /// Runs a prepared statement that returns no rows.
    pub(crate) fn execute(
        &mut self,
        name: &'static str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, MiddleError> {
        let stmt = self.statement(name)?;
        self.client
            .execute(&stmt, params)
            .map_err(|source| MiddleError::Execute {
                statement: name,
                source,
            })
    }

    /// Runs a prepared statement and returns its rows.
    pub(crate) fn query(
        &mut self,
        name: &'static str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, MiddleError> {
        let stmt = self.statement(name)?;
        self.client
            .query(&stmt, params)
            .map_err(|source| MiddleError::Execute {
                statement: name,
                source,
            })
    }

    /// Runs a prepared single-row lookup.
    pub(crate) fn query_opt(
        &mut self,
        name: &'static str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, MiddleError> {
        let stmt = self.statement(name)?;
        self.client
            .query_opt(&stmt, params)
            .map_err(|source| MiddleError::Execute {
                statement: name,
                source,
            })
    }

    /// Runs an id-yielding dependency query.
    pub(crate) fn query_ids(
        &mut self,
        name: &'static str,
        id: OsmId,
    ) -> Result<Vec<OsmId>, MiddleError> {
        let rows = self.query(name, &[&id])?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Enters copy mode; rows go through [`TableConn::copy_row`] until
    /// [`TableConn::end_copy`].
    pub(crate) fn begin_copy(&mut self) {
        self.copy_mode = true;
    }

    pub(crate) fn copy_mode(&self) -> bool {
        self.copy_mode
    }

    /// Appends one pre-formatted, newline-terminated COPY line.
    pub(crate) fn copy_row(&mut self, line: &str) -> Result<(), MiddleError> {
        debug_assert!(self.copy_mode, "copy_row outside copy mode");
        self.copy_buf.push_str(line);
        if self.copy_buf.len() >= COPY_FLUSH_BYTES {
            self.ship_copy_batch()?;
        }
        Ok(())
    }

    fn ship_copy_batch(&mut self) -> Result<(), MiddleError> {
        use std::io::Write;

        if self.copy_buf.is_empty() {
            return Ok(());
        }
        let mut writer = self
            .client
            .copy_in(self.desc.copy.as_str())
            .map_err(|source| MiddleError::Copy {
                table: self.desc.name.clone(),
                source,
            })?;
        writer
            .write_all(self.copy_buf.as_bytes())
            .map_err(|source| MiddleError::CopyWrite {
                table: self.desc.name.clone(),
                source,
            })?;
        writer.finish().map_err(|source| MiddleError::Copy {
            table: self.desc.name.clone(),
            source,
        })?;
        self.copy_buf.clear();
        Ok(())
    }

    /// Leaves copy mode: the tail batch is shipped and drained, after
    /// which reads on this connection observe every streamed row.
    pub(crate) fn end_copy(&mut self) -> Result<(), MiddleError> {
        if self.copy_mode {
            self.ship_copy_batch()?;
            self.copy_mode = false;
        }
        Ok(())
    }

    /// Runs the per-table ANALYZE.
    pub(crate) fn analyze(&mut self) -> Result<(), MiddleError> {
        self.end_copy()?;
        let sql = self.desc.analyze.clone();
        self.schema_exec(&sql)
    }

    /// Numeric server version (e.g. 90600, 160002); 0 when unavailable.
    fn server_version_num(&mut self) -> Result<i32, MiddleError> {
        let messages = self
            .client
            .simple_query("SHOW server_version_num")
            .map_err(|source| self.schema_err("SHOW server_version_num", source))?;
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                return Ok(row.get(0).and_then(|v| v.parse().ok()).unwrap_or(0));
            }
        }
        Ok(0)
    }

    /// Refuses to run against a server with the intarray contrib module,
    /// whose operator classes defeat the GIN indexes on the id arrays.
    pub(crate) fn check_intarray_absent(&mut self) -> Result<(), MiddleError> {
        let sql = "SELECT 1 FROM pg_opclass WHERE opcname = 'gist__intbig_ops'";
        let rows = self
            .client
            .query(sql, &[])
            .map_err(|source| self.schema_err(sql, source))?;
        if rows.is_empty() {
            Ok(())
        } else {
            Err(MiddleError::IntarrayLoaded)
        }
    }

    /// Append-mode probe: the stored id column must be as wide as the
    /// ids this build writes.
    pub(crate) fn check_id_width(&mut self) -> Result<(), MiddleError> {
        let sql = format!("SELECT id FROM {} LIMIT 1", self.desc.name);
        let rows = self
            .client
            .query(sql.as_str(), &[])
            .map_err(|source| self.schema_err(&sql, source))?;
        let Some(row) = rows.first() else {
            return Ok(());
        };
        let stored = row.columns()[0].type_().clone();
        if stored == Type::INT8 {
            return Ok(());
        }
        let stored_bits = if stored == Type::INT4 {
            32
        } else if stored == Type::INT2 {
            16
        } else {
            0
        };
        Err(MiddleError::IdWidthMismatch {
            stored_bits,
            expected_bits: 64,
        })
    }

    /// Final per-table shutdown: flush copy, then either drop the table
    /// or build its array index, and disconnect.
    pub(crate) fn finish(mut self, droptemp: bool, build_indexes: bool) -> Result<(), MiddleError> {
        info!("stopping table {}", self.desc.name);
        self.end_copy()?;
        let started = Instant::now();

        if droptemp {
            let sql = format!("DROP TABLE {}", self.desc.name);
            self.schema_exec(&sql)?;
        } else if build_indexes {
            if let Some(index_sql) = self.desc.array_indexes.clone() {
                let sql = if self.server_version_num()? >= 80400 {
                    info!("building index on table {} (fastupdate=off)", self.desc.name);
                    with_fastupdate_off(&index_sql)
                } else {
                    info!("building index on table {}", self.desc.name);
                    index_sql
                };
                self.schema_exec(&sql)?;
            }
        }

        info!(
            "stopped table {} in {}s",
            self.desc.name,
            started.elapsed().as_secs()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CoordRepr;
    use rstest::rstest;

    #[rstest]
    fn fastupdate_inserts_before_tablespace() {
        let sql = "CREATE INDEX osm_ways_nodes ON osm_ways USING gin (nodes) TABLESPACE fast";
        assert_eq!(
            with_fastupdate_off(sql),
            "CREATE INDEX osm_ways_nodes ON osm_ways USING gin (nodes) \
             WITH (FASTUPDATE=OFF) TABLESPACE fast"
        );
    }

    #[rstest]
    fn fastupdate_appends_without_tablespace() {
        let sql = "CREATE INDEX osm_ways_nodes ON osm_ways USING gin (nodes)";
        assert_eq!(
            with_fastupdate_off(sql),
            "CREATE INDEX osm_ways_nodes ON osm_ways USING gin (nodes) WITH (FASTUPDATE=OFF)"
        );
    }

    #[rstest]
    fn descs_carry_the_prefix_through_every_statement() {
        let opts = MiddleOptions {
            prefix: "test_osm".to_owned(),
            ..MiddleOptions::default()
        };
        for desc in [TableDesc::nodes(&opts), TableDesc::ways(&opts), TableDesc::rels(&opts)] {
            assert!(desc.name.starts_with("test_osm_"));
            assert!(desc.copy.contains(&desc.name));
            assert!(desc.analyze.contains(&desc.name));
            for (_, sql) in desc.prepare.iter().chain(&desc.prepare_dependency) {
                assert!(sql.contains("test_osm_"), "unprefixed statement: {sql}");
            }
        }
    }

    #[rstest]
    fn node_columns_follow_the_representation() {
        let fixed = MiddleOptions::default();
        let double = MiddleOptions {
            coord_repr: CoordRepr::Double,
            ..MiddleOptions::default()
        };
        let fixed_create = TableDesc::nodes(&fixed).create.unwrap();
        let double_create = TableDesc::nodes(&double).create.unwrap();
        assert!(fixed_create.contains("lat int4 not null"));
        assert!(double_create.contains("lat double precision not null"));
    }

    #[rstest]
    fn unlogged_and_tablespaces_shape_the_create() {
        let opts = MiddleOptions {
            prefix: "osm".to_owned(),
            unlogged: true,
            tablespace_data: Some("bulk".to_owned()),
            tablespace_index: Some("fast".to_owned()),
            ..MiddleOptions::default()
        };
        let create = TableDesc::ways(&opts).create.unwrap();
        assert!(create.starts_with("CREATE UNLOGGED TABLE osm_ways"));
        assert!(create.contains("USING INDEX TABLESPACE fast"));
        assert!(create.ends_with("TABLESPACE bulk"));

        let index = TableDesc::ways(&opts).array_indexes.unwrap();
        assert_eq!(
            index,
            "CREATE INDEX osm_ways_nodes ON osm_ways USING gin (nodes) TABLESPACE fast"
        );
    }
}
