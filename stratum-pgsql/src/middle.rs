//! The middle store: orchestration of caches, tables and trackers.
//!
//! `PgMiddle` owns the RAM node cache, the optional flat node file, one
//! connection per table and the two dirty trackers for the lifetime of a
//! run. During an initial import, element writes stream through COPY;
//! during diff updates, writes go through prepared statements and the
//! `*_changed` operations walk the inverted indexes to mark dependent
//! ways and relations for re-emission. Elements returned from the get
//! operations are fresh values owned by the caller.
//!
//! Cross-table consistency is maintained by operation sequencing alone:
//! each operation flushes copy mode on exactly the connections it is
//! about to read, and no two operations ever share a connection.

use std::collections::HashMap;
use std::time::Instant;

use geo::Coord;
use log::info;
use postgres::Row;
use stratum_core::{IdTracker, Member, MemberType, OsmId, Output, OutputError, Tags};

use crate::cache::{FlatNodeCache, NodeRamCache};
use crate::codec::{append_id_array, append_text_array, EscapeMode};
use crate::error::MiddleError;
use crate::options::{from_fixed, to_fixed, CoordRepr, MiddleOptions};
use crate::table::{TableConn, TableDesc};

/// The staging store between the parser and the output layer.
///
/// Created by [`PgMiddle::start`]; shut down by [`PgMiddle::stop`], which
/// builds the array indexes (one worker per table) unless `droptemp`
/// asked for the tables to be dropped instead.
pub struct PgMiddle {
    opts: MiddleOptions,
    nodes: TableConn,
    ways: TableConn,
    rels: TableConn,
    ram: NodeRamCache,
    flat: Option<FlatNodeCache>,
    ways_pending: IdTracker,
    rels_pending: IdTracker,
    build_indexes: bool,
    line_buf: String,
}

impl PgMiddle {
    /// Opens the connections, (re)creates the tables unless appending,
    /// begins a transaction per table, registers the statement catalogs
    /// and enters copy mode.
    pub fn start(opts: MiddleOptions) -> Result<Self, MiddleError> {
        info!(
            "middle: pgsql, {:?}, cache {} MiB",
            opts.coord_repr, opts.cache_mib
        );

        let ram = NodeRamCache::new(opts.cache_mib, opts.coord_repr, true);
        let flat = if opts.flat_node_cache_enabled {
            Some(FlatNodeCache::open(
                &opts.flat_node_file,
                opts.append,
                opts.coord_repr,
            )?)
        } else {
            None
        };

        let mut nodes = TableConn::connect(&opts.conninfo, TableDesc::nodes(&opts))?;
        // Warn before mountains of work: both probes want a live
        // connection that has done nothing else yet.
        nodes.check_intarray_absent()?;
        if opts.append {
            nodes.check_id_width()?;
        }
        let mut ways = TableConn::connect(&opts.conninfo, TableDesc::ways(&opts))?;
        let mut rels = TableConn::connect(&opts.conninfo, TableDesc::rels(&opts))?;

        for conn in [&mut nodes, &mut ways, &mut rels] {
            info!("setting up table {}", conn.desc.name);
            if !opts.append {
                conn.drop_table()?;
            }
            conn.begin()?;
            if !opts.append {
                conn.create_table()?;
            }
            conn.prepare_main()?;
            if opts.append {
                conn.prepare_dependency()?;
            }
            conn.begin_copy();
        }

        Ok(Self {
            build_indexes: !opts.append,
            nodes,
            ways,
            rels,
            ram,
            flat,
            ways_pending: IdTracker::new(),
            rels_pending: IdTracker::new(),
            line_buf: String::new(),
            opts,
        })
    }

    // ----- nodes -------------------------------------------------------

    /// Upserts a node: RAM cache always, then flat file or nodes table
    /// depending on configuration.
    pub fn node_set(
        &mut self,
        id: OsmId,
        location: Coord<f64>,
        tags: &Tags,
    ) -> Result<(), MiddleError> {
        self.ram.set(id, location);
        if let Some(flat) = self.flat.as_mut() {
            flat.set(id, location)?;
            return Ok(());
        }

        if self.nodes.copy_mode() {
            let mut line = std::mem::take(&mut self.line_buf);
            node_line(&mut line, self.opts.coord_repr, id, location, tags);
            let shipped = self.nodes.copy_row(&line);
            self.line_buf = line;
            shipped
        } else {
            let tags = tags_param(tags);
            match self.opts.coord_repr {
                CoordRepr::Fixed { scale } => {
                    let lat = to_fixed(location.y, scale);
                    let lon = to_fixed(location.x, scale);
                    self.nodes.execute("insert_node", &[&id, &lat, &lon, &tags])?;
                }
                CoordRepr::Double => {
                    self.nodes
                        .execute("insert_node", &[&id, &location.y, &location.x, &tags])?;
                }
            }
            Ok(())
        }
    }

    /// Resolves a single node: RAM cache, then flat file or nodes table.
    pub fn node_get(&mut self, id: OsmId) -> Result<Option<Coord<f64>>, MiddleError> {
        if let Some(location) = self.ram.get(id) {
            return Ok(Some(location));
        }
        if let Some(flat) = self.flat.as_mut() {
            return Ok(flat.get(id)?);
        }
        self.nodes.end_copy()?;
        let row = self.nodes.query_opt("get_node", &[&id])?;
        Ok(row.map(|row| self.row_coord(&row, 0, 1)))
    }

    /// Resolves a batch of nodes, preserving input order and eliding ids
    /// that cannot be found anywhere (the caller decides whether the
    /// shortened geometry is still worth emitting).
    pub fn node_get_list(&mut self, ids: &[OsmId]) -> Result<Vec<Coord<f64>>, MiddleError> {
        let mut found: Vec<Option<Coord<f64>>> =
            ids.iter().map(|&id| self.ram.get(id)).collect();
        let residual: Vec<OsmId> = ids
            .iter()
            .zip(&found)
            .filter(|(_, hit)| hit.is_none())
            .map(|(&id, _)| id)
            .collect();

        if !residual.is_empty() {
            if let Some(flat) = self.flat.as_mut() {
                let fetched = flat.get_list(&residual)?;
                let mut fetched = fetched.into_iter();
                for slot in found.iter_mut().filter(|slot| slot.is_none()) {
                    *slot = fetched.next().flatten();
                }
            } else {
                self.nodes.end_copy()?;
                let rows = self.nodes.query("get_node_list", &[&residual])?;
                let mut by_id: HashMap<OsmId, Coord<f64>> = HashMap::with_capacity(rows.len());
                for row in &rows {
                    by_id.insert(row.get(0), self.row_coord(row, 1, 2));
                }
                for (slot, &id) in found.iter_mut().zip(ids) {
                    if slot.is_none() {
                        *slot = by_id.get(&id).copied();
                    }
                }
            }
        }

        Ok(found.into_iter().flatten().collect())
    }

    /// Deletes a node. The RAM cache is left alone; the flat file or
    /// table is authoritative on the next lookup.
    pub fn node_delete(&mut self, id: OsmId) -> Result<(), MiddleError> {
        if let Some(flat) = self.flat.as_mut() {
            flat.delete(id)?;
            return Ok(());
        }
        self.nodes.end_copy()?;
        self.nodes.execute("delete_node", &[&id])?;
        Ok(())
    }

    /// Marks every way and relation that references the changed node.
    pub fn node_changed(&mut self, id: OsmId) -> Result<(), MiddleError> {
        self.ways.end_copy()?;
        self.rels.end_copy()?;
        for way in self.ways.query_ids("mark_ways_by_node", id)? {
            self.ways_pending.mark(way);
        }
        for rel in self.rels.query_ids("mark_rels_by_node", id)? {
            self.rels_pending.mark(rel);
        }
        Ok(())
    }

    // ----- ways --------------------------------------------------------

    /// Inserts a way (copy or prepared path).
    pub fn way_set(&mut self, id: OsmId, nodes: &[OsmId], tags: &Tags) -> Result<(), MiddleError> {
        if self.ways.copy_mode() {
            let mut line = std::mem::take(&mut self.line_buf);
            way_line(&mut line, id, nodes, tags);
            let shipped = self.ways.copy_row(&line);
            self.line_buf = line;
            shipped
        } else {
            self.ways
                .execute("insert_way", &[&id, &nodes, &tags_param(tags)])?;
            Ok(())
        }
    }

    /// Fetches a way's tags and node coordinates, in way order, with
    /// unresolvable nodes elided.
    pub fn way_get(&mut self, id: OsmId) -> Result<Option<(Tags, Vec<Coord<f64>>)>, MiddleError> {
        self.ways.end_copy()?;
        let Some(row) = self.ways.query_opt("get_way", &[&id])? else {
            return Ok(None);
        };
        let node_ids: Vec<OsmId> = row.get(0);
        let tags = tags_from_column(row.get(1));
        let coords = self.node_get_list(&node_ids)?;
        Ok(Some((tags, coords)))
    }

    /// Batched way fetch. The backend returns rows in arbitrary order;
    /// they are rematched to the input order here. Ways that do not
    /// exist are elided.
    pub fn way_get_list(
        &mut self,
        ids: &[OsmId],
    ) -> Result<Vec<(OsmId, Tags, Vec<Coord<f64>>)>, MiddleError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.ways.end_copy()?;
        let rows = self.ways.query("get_way_list", &[&ids])?;

        let mut by_id: HashMap<OsmId, (Vec<OsmId>, Option<Vec<String>>)> =
            HashMap::with_capacity(rows.len());
        for row in rows {
            by_id.insert(row.get(0), (row.get(1), row.get(2)));
        }

        let mut out = Vec::with_capacity(by_id.len());
        for &id in ids {
            if let Some((node_ids, tag_column)) = by_id.remove(&id) {
                let coords = self.node_get_list(&node_ids)?;
                out.push((id, tags_from_column(tag_column), coords));
            }
        }
        Ok(out)
    }

    /// Deletes a way.
    pub fn way_delete(&mut self, id: OsmId) -> Result<(), MiddleError> {
        self.ways.end_copy()?;
        self.ways.execute("delete_way", &[&id])?;
        Ok(())
    }

    /// Marks every relation that references the changed way.
    pub fn way_changed(&mut self, id: OsmId) -> Result<(), MiddleError> {
        self.rels.end_copy()?;
        for rel in self.rels.query_ids("mark_rels_by_way", id)? {
            self.rels_pending.mark(rel);
        }
        Ok(())
    }

    // ----- relations ---------------------------------------------------

    /// Inserts a relation, partitioning its members into the node, way
    /// and relation slices of `parts` (intra-group order preserved) and
    /// serialising the member list as `<type-char><id>` → role pairs.
    pub fn relation_set(
        &mut self,
        id: OsmId,
        members: &[Member],
        tags: &Tags,
    ) -> Result<(), MiddleError> {
        let partitioned = partition_members(members);

        if self.rels.copy_mode() {
            let mut line = std::mem::take(&mut self.line_buf);
            rel_line(&mut line, id, &partitioned, tags);
            let shipped = self.rels.copy_row(&line);
            self.line_buf = line;
            shipped
        } else {
            let members_param = if partitioned.member_pairs.is_empty() {
                None
            } else {
                Some(
                    partitioned
                        .member_pairs
                        .iter()
                        .flat_map(|(key, role)| [key.clone(), role.clone()])
                        .collect::<Vec<String>>(),
                )
            };
            self.rels.execute(
                "insert_rel",
                &[
                    &id,
                    &partitioned.way_off,
                    &partitioned.rel_off,
                    &partitioned.parts,
                    &members_param,
                    &tags_param(tags),
                ],
            )?;
            Ok(())
        }
    }

    /// Fetches a relation's members (original order, roles intact) and
    /// tags.
    pub fn relation_get(
        &mut self,
        id: OsmId,
    ) -> Result<Option<(Vec<Member>, Tags)>, MiddleError> {
        self.rels.end_copy()?;
        let Some(row) = self.rels.query_opt("get_rel", &[&id])? else {
            return Ok(None);
        };
        let member_column: Option<Vec<String>> = row.get(0);
        let tags = tags_from_column(row.get(1));

        let raw = member_column.unwrap_or_default();
        let mut members = Vec::with_capacity(raw.len() / 2);
        for pair in raw.chunks_exact(2) {
            members.push(decode_member(id, &pair[0], &pair[1])?);
        }
        Ok(Some((members, tags)))
    }

    /// Deletes a relation. Ways listed in its way slice are marked first,
    /// since their geometry may have depended on the relation.
    pub fn relation_delete(&mut self, id: OsmId) -> Result<(), MiddleError> {
        self.ways.end_copy()?;
        self.rels.end_copy()?;
        for way in self.ways.query_ids("mark_ways_by_rel", id)? {
            self.ways_pending.mark(way);
        }
        self.rels.execute("delete_rel", &[&id])?;
        Ok(())
    }

    /// Marks every relation whose relation slice references the changed
    /// relation.
    pub fn relation_changed(&mut self, id: OsmId) -> Result<(), MiddleError> {
        self.rels.end_copy()?;
        for rel in self.rels.query_ids("mark_rels", id)? {
            self.rels_pending.mark(rel);
        }
        Ok(())
    }

    /// Relations whose way slice contains the given way.
    pub fn relations_using_way(&mut self, way_id: OsmId) -> Result<Vec<OsmId>, MiddleError> {
        self.rels.end_copy()?;
        self.rels.query_ids("rels_using_way", way_id)
    }

    // ----- pending iteration -------------------------------------------

    /// Drains the pending-way tracker in ascending id order, invoking the
    /// callback with each way's tags and resolved coordinates. The
    /// boolean flag tells the callback whether it runs in append mode
    /// (the way may already exist downstream).
    pub fn iterate_ways<F>(&mut self, mut callback: F) -> Result<(), MiddleError>
    where
        F: FnMut(OsmId, &Tags, &[Coord<f64>], bool) -> Result<(), OutputError>,
    {
        info!("going over pending ways...");
        self.end_copy_all()?;
        self.reopen_flat_for_append()?;

        let pending = self.ways_pending.len();
        info!("{pending} ways are pending");

        let exists = self.opts.append;
        let started = Instant::now();
        let mut count: u64 = 0;
        while let Some(id) = self.ways_pending.pop_mark() {
            if count % 1000 == 0 && count > 0 {
                let secs = started.elapsed().as_secs_f64();
                info!(
                    "processing way ({}k) at {:.2}k/s",
                    count / 1000,
                    count as f64 / 1000.0 / secs.max(1.0)
                );
            }
            count += 1;
            if let Some((tags, coords)) = self.way_get(id)? {
                callback(id, &tags, &coords, exists)?;
            }
        }

        let secs = started.elapsed().as_secs().max(1);
        info!(
            "processed {count} pending ways in {secs}s ({:.2}/s)",
            count as f64 / secs as f64
        );
        Ok(())
    }

    /// Drains the pending-relation tracker; the counterpart of
    /// [`PgMiddle::iterate_ways`].
    pub fn iterate_relations<F>(&mut self, mut callback: F) -> Result<(), MiddleError>
    where
        F: FnMut(OsmId, &[Member], &Tags, bool) -> Result<(), OutputError>,
    {
        info!("going over pending relations...");
        self.end_copy_all()?;
        self.reopen_flat_for_append()?;

        let pending = self.rels_pending.len();
        info!("{pending} relations are pending");

        let exists = self.opts.append;
        let started = Instant::now();
        let mut count: u64 = 0;
        while let Some(id) = self.rels_pending.pop_mark() {
            if count % 10 == 0 && count > 0 {
                let secs = started.elapsed().as_secs_f64();
                info!(
                    "processing relation ({count}) at {:.2}/s",
                    count as f64 / secs.max(1.0)
                );
            }
            count += 1;
            if let Some((members, tags)) = self.relation_get(id)? {
                callback(id, &members, &tags, exists)?;
            }
        }

        let secs = started.elapsed().as_secs().max(1);
        info!(
            "processed {count} pending relations in {secs}s ({:.2}/s)",
            count as f64 / secs as f64
        );
        Ok(())
    }

    /// Wires an output layer into both drain loops.
    pub fn drain_pending(&mut self, output: &mut dyn Output) -> Result<(), MiddleError> {
        self.iterate_ways(|id, tags, coords, exists| {
            output.pending_way(id, tags, coords, exists)
        })?;
        self.iterate_relations(|id, members, tags, exists| {
            output.pending_relation(id, members, tags, exists)
        })
    }

    fn end_copy_all(&mut self) -> Result<(), MiddleError> {
        for conn in [&mut self.nodes, &mut self.ways, &mut self.rels] {
            conn.end_copy()?;
        }
        Ok(())
    }

    /// Reopens the flat file in append mode for the iteration phases, so
    /// it is not deleted and recreated mid-run.
    fn reopen_flat_for_append(&mut self) -> Result<(), MiddleError> {
        if self.opts.flat_node_cache_enabled {
            self.flat = None;
            self.flat = Some(FlatNodeCache::open(
                &self.opts.flat_node_file,
                true,
                self.opts.coord_repr,
            )?);
        }
        Ok(())
    }

    // ----- lifecycle ---------------------------------------------------

    /// Flushes every copy stream and commits every open transaction.
    /// Flushing first means buffered rows are in the tables before the
    /// commit, never lost behind it.
    pub fn commit(&mut self) -> Result<(), MiddleError> {
        for conn in [&mut self.nodes, &mut self.ways, &mut self.rels] {
            conn.commit()?;
        }
        Ok(())
    }

    /// Runs ANALYZE on each table.
    pub fn analyze(&mut self) -> Result<(), MiddleError> {
        for conn in [&mut self.nodes, &mut self.ways, &mut self.rels] {
            conn.analyze()?;
        }
        Ok(())
    }

    /// Shuts the store down: caches are dropped, then each table worker
    /// (one thread per table, nothing shared between them) flushes its
    /// stream, builds its array index (or drops the table under
    /// `droptemp`) and disconnects.
    pub fn stop(self) -> Result<(), MiddleError> {
        let Self {
            opts,
            nodes,
            ways,
            rels,
            ram,
            flat,
            build_indexes,
            ..
        } = self;
        drop(ram);
        drop(flat);

        let droptemp = opts.droptemp;
        std::thread::scope(|scope| {
            let handles = [nodes, ways, rels]
                .map(|conn| scope.spawn(move || conn.finish(droptemp, build_indexes)));

            let mut result = Ok(());
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        if result.is_ok() {
                            result = Err(error);
                        }
                    }
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            result
        })
    }

    fn row_coord(&self, row: &Row, lat_idx: usize, lon_idx: usize) -> Coord<f64> {
        match self.opts.coord_repr {
            CoordRepr::Fixed { scale } => Coord {
                x: from_fixed(row.get(lon_idx), scale),
                y: from_fixed(row.get(lat_idx), scale),
            },
            CoordRepr::Double => Coord {
                x: row.get(lon_idx),
                y: row.get(lat_idx),
            },
        }
    }
}

/// A relation's members split into the derived indexing fields.
struct PartitionedMembers {
    /// Count of node members; `parts[..way_off]` is the node slice.
    way_off: i16,
    /// Node plus way count; `parts[way_off..rel_off]` is the way slice.
    rel_off: i16,
    /// Node ids ++ way ids ++ relation ids, original order within each
    /// type class.
    parts: Vec<OsmId>,
    /// `<type-char><id>` → role pairs, in original member order.
    member_pairs: Vec<(String, String)>,
}

fn partition_members(members: &[Member]) -> PartitionedMembers {
    let mut node_parts = Vec::new();
    let mut way_parts = Vec::new();
    let mut rel_parts = Vec::new();
    let mut member_pairs = Vec::with_capacity(members.len());

    for member in members {
        match member.mtype {
            MemberType::Node => node_parts.push(member.id),
            MemberType::Way => way_parts.push(member.id),
            MemberType::Relation => rel_parts.push(member.id),
        }
        member_pairs.push((
            format!("{}{}", member.mtype.type_char(), member.id),
            member.role.clone(),
        ));
    }

    let way_off = node_parts.len() as i16;
    let rel_off = (node_parts.len() + way_parts.len()) as i16;
    let mut parts = node_parts;
    parts.append(&mut way_parts);
    parts.append(&mut rel_parts);

    PartitionedMembers {
        way_off,
        rel_off,
        parts,
        member_pairs,
    }
}

fn decode_member(relation: OsmId, key: &str, role: &str) -> Result<Member, MiddleError> {
    let malformed = || MiddleError::MalformedMember {
        id: relation,
        key: key.to_owned(),
    };
    let mut chars = key.chars();
    let type_char = chars.next().ok_or_else(malformed)?;
    let mtype = MemberType::from_type_char(type_char).ok_or_else(malformed)?;
    let member_id: OsmId = chars.as_str().parse().map_err(|_| malformed())?;
    Ok(Member::new(mtype, member_id, role))
}

fn tags_param(tags: &Tags) -> Option<Vec<String>> {
    if tags.is_empty() {
        None
    } else {
        Some(
            tags.iter()
                .flat_map(|(k, v)| [k.to_owned(), v.to_owned()])
                .collect(),
        )
    }
}

fn tags_from_column(column: Option<Vec<String>>) -> Tags {
    let mut tags = Tags::new();
    if let Some(items) = column {
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            tags.insert(key, value);
        }
    }
    tags
}

/// Appends the tags column of a COPY line: `\N` for no tags, otherwise
/// the text-array literal with COPY-level escaping.
fn push_tags_column(buf: &mut String, tags: &Tags) {
    if tags.is_empty() {
        buf.push_str("\\N");
    } else {
        append_text_array(
            buf,
            tags.iter().flat_map(|(k, v)| [k, v]),
            EscapeMode::CopyLine,
        );
    }
}

fn node_line(buf: &mut String, repr: CoordRepr, id: OsmId, location: Coord<f64>, tags: &Tags) {
    use std::fmt::Write;

    buf.clear();
    match repr {
        CoordRepr::Fixed { scale } => {
            let _ = write!(
                buf,
                "{id}\t{}\t{}\t",
                to_fixed(location.y, scale),
                to_fixed(location.x, scale)
            );
        }
        CoordRepr::Double => {
            let _ = write!(buf, "{id}\t{:.10}\t{:.10}\t", location.y, location.x);
        }
    }
    push_tags_column(buf, tags);
    buf.push('\n');
}

fn way_line(buf: &mut String, id: OsmId, nodes: &[OsmId], tags: &Tags) {
    use std::fmt::Write;

    buf.clear();
    let _ = write!(buf, "{id}\t");
    append_id_array(buf, nodes);
    buf.push('\t');
    push_tags_column(buf, tags);
    buf.push('\n');
}

fn rel_line(buf: &mut String, id: OsmId, partitioned: &PartitionedMembers, tags: &Tags) {
    use std::fmt::Write;

    buf.clear();
    let _ = write!(buf, "{id}\t{}\t{}\t", partitioned.way_off, partitioned.rel_off);
    append_id_array(buf, &partitioned.parts);
    buf.push('\t');
    if partitioned.member_pairs.is_empty() {
        buf.push_str("\\N");
    } else {
        append_text_array(
            buf,
            partitioned
                .member_pairs
                .iter()
                .flat_map(|(key, role)| [key.as_str(), role.as_str()]),
            EscapeMode::CopyLine,
        );
    }
    buf.push('\t');
    push_tags_column(buf, tags);
    buf.push('\n');
}
