//! End-to-end scenarios against a live PostgreSQL server.
//!
//! These tests are ignored by default; run them with
//!
//! ```text
//! STRATUM_TEST_CONNINFO="host=localhost user=osm dbname=osm_test" \
//!     cargo test -p stratum-pgsql -- --ignored
//! ```
//!
//! Each test uses its own table prefix so runs do not interfere.

use geo::Coord;
use stratum_core::{Member, MemberType, NullOutput, Tags};
use stratum_pgsql::{MiddleOptions, PgMiddle};

fn conninfo() -> String {
    std::env::var("STRATUM_TEST_CONNINFO")
        .expect("set STRATUM_TEST_CONNINFO to run live middle tests")
}

fn options(prefix: &str) -> MiddleOptions {
    MiddleOptions {
        conninfo: conninfo(),
        prefix: prefix.to_owned(),
        cache_mib: 16,
        ..MiddleOptions::default()
    }
}

fn coord(x: f64, y: f64) -> Coord<f64> {
    Coord { x, y }
}

/// Reopens the tables of a prior run in append mode, with the RAM cache
/// cold, so reads are served by the backend rather than by memory.
fn reopen_append(prefix: &str) -> PgMiddle {
    let opts = MiddleOptions {
        append: true,
        ..options(prefix)
    };
    PgMiddle::start(opts).expect("reopen middle in append mode")
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn two_node_way_round_trips() {
    let mut middle = PgMiddle::start(options("stratum_t_roundtrip")).expect("start middle");

    middle.node_set(1, coord(20.0, 10.0), &Tags::new()).unwrap();
    middle
        .node_set(2, coord(20.5, 10.5), &Tags::from([("highway", "residential")]))
        .unwrap();
    middle
        .way_set(100, &[1, 2], &Tags::from([("name", "A")]))
        .unwrap();
    middle.commit().unwrap();

    let (tags, coords) = middle.way_get(100).unwrap().expect("way 100 exists");
    assert_eq!(tags, Tags::from([("name", "A")]));
    assert_eq!(coords, vec![coord(20.0, 10.0), coord(20.5, 10.5)]);

    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn reads_observe_rows_streamed_before_them() {
    let mut middle = PgMiddle::start(options("stratum_t_flush")).expect("start middle");

    // No commit: the read itself must flush the copy streams it uses and
    // then see everything streamed so far on those connections.
    middle.node_set(1, coord(2.0, 1.0), &Tags::new()).unwrap();
    middle.node_set(2, coord(4.0, 3.0), &Tags::new()).unwrap();
    middle.way_set(9, &[1, 2], &Tags::new()).unwrap();

    let (_, coords) = middle.way_get(9).unwrap().expect("streamed way visible");
    assert_eq!(coords, vec![coord(2.0, 1.0), coord(4.0, 3.0)]);

    middle.commit().unwrap();
    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn way_survives_a_cold_cache() {
    let prefix = "stratum_t_cold";
    {
        let mut middle = PgMiddle::start(options(prefix)).expect("start middle");
        middle.node_set(1, coord(-1.25, 52.5), &Tags::new()).unwrap();
        middle.node_set(2, coord(-1.5, 52.25), &Tags::new()).unwrap();
        middle.way_set(7, &[2, 1], &Tags::new()).unwrap();
        middle.commit().unwrap();
        middle.stop().unwrap();
    }

    let mut middle = reopen_append(prefix);
    let (_, coords) = middle.way_get(7).unwrap().expect("way 7 exists");
    // Way order preserved, nothing served from the (cold) RAM cache.
    assert_eq!(coords, vec![coord(-1.5, 52.25), coord(-1.25, 52.5)]);
    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn missing_way_nodes_are_elided_in_order() {
    let mut middle = PgMiddle::start(options("stratum_t_elide")).expect("start middle");
    middle.node_set(1, coord(1.0, 1.0), &Tags::new()).unwrap();
    middle.node_set(3, coord(3.0, 3.0), &Tags::new()).unwrap();
    // Node 2 is never set.
    middle.way_set(50, &[1, 2, 3], &Tags::new()).unwrap();
    middle.commit().unwrap();

    let (_, coords) = middle.way_get(50).unwrap().expect("way 50 exists");
    assert_eq!(coords, vec![coord(1.0, 1.0), coord(3.0, 3.0)]);
    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn node_change_reaches_the_dependent_way() {
    let prefix = "stratum_t_diff";
    {
        let mut middle = PgMiddle::start(options(prefix)).expect("start middle");
        middle.node_set(1, coord(20.0, 10.0), &Tags::new()).unwrap();
        middle.node_set(2, coord(20.5, 10.5), &Tags::new()).unwrap();
        middle
            .way_set(100, &[1, 2], &Tags::from([("name", "A")]))
            .unwrap();
        middle.commit().unwrap();
        middle.stop().unwrap();
    }

    let mut middle = reopen_append(prefix);
    // Diff drivers re-set a modified element as a delete/set pair.
    middle.node_delete(1).unwrap();
    middle.node_set(1, coord(20.1, 10.1), &Tags::new()).unwrap();
    middle.node_changed(1).unwrap();
    middle.commit().unwrap();

    let mut seen = Vec::new();
    middle
        .iterate_ways(|id, _tags, coords, exists| {
            seen.push((id, coords.len(), exists));
            Ok(())
        })
        .unwrap();
    assert_eq!(seen.len(), 1, "exactly one pending way expected");
    assert_eq!(seen[0].0, 100);
    assert_eq!(seen[0].1, 2);
    assert!(seen[0].2, "append mode sets the exists flag");

    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn relation_with_mixed_members_round_trips() {
    let members = vec![
        Member::new(MemberType::Way, 100, "outer"),
        Member::new(MemberType::Node, 1, "entrance"),
        Member::new(MemberType::Way, 200, "inner"),
    ];
    let tags = Tags::from([("type", "multipolygon")]);

    let mut middle = PgMiddle::start(options("stratum_t_rel")).expect("start middle");
    middle.relation_set(500, &members, &tags).unwrap();
    middle.commit().unwrap();

    let (got_members, got_tags) = middle.relation_get(500).unwrap().expect("relation 500");
    assert_eq!(got_members, members);
    assert_eq!(got_tags, tags);
    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn way_change_and_relation_delete_mark_dependents() {
    let prefix = "stratum_t_marks";
    {
        let mut middle = PgMiddle::start(options(prefix)).expect("start middle");
        middle.node_set(1, coord(0.0, 0.0), &Tags::new()).unwrap();
        middle.node_set(2, coord(1.0, 1.0), &Tags::new()).unwrap();
        middle.way_set(100, &[1, 2], &Tags::new()).unwrap();
        middle
            .relation_set(
                500,
                &[Member::new(MemberType::Way, 100, "outer")],
                &Tags::from([("type", "multipolygon")]),
            )
            .unwrap();
        middle.commit().unwrap();
        middle.stop().unwrap();
    }

    let mut middle = reopen_append(prefix);

    assert_eq!(middle.relations_using_way(100).unwrap(), vec![500]);
    assert!(middle.relations_using_way(999).unwrap().is_empty());

    // A changed way marks its parent relation.
    middle.way_changed(100).unwrap();
    let mut pending_rels = Vec::new();
    middle
        .iterate_relations(|id, members, _tags, _exists| {
            pending_rels.push((id, members.len()));
            Ok(())
        })
        .unwrap();
    assert_eq!(pending_rels, vec![(500, 1)]);

    // Deleting the relation marks the ways its geometry depended on.
    middle.relation_delete(500).unwrap();
    let mut pending_ways = Vec::new();
    middle
        .iterate_ways(|id, _tags, _coords, _exists| {
            pending_ways.push(id);
            Ok(())
        })
        .unwrap();
    assert_eq!(pending_ways, vec![100]);
    assert!(middle.relation_get(500).unwrap().is_none());

    middle.commit().unwrap();
    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn batched_way_fetch_rematches_input_order() {
    let mut middle = PgMiddle::start(options("stratum_t_batch")).expect("start middle");
    for id in 1..=6 {
        middle
            .node_set(id, coord(id as f64, -(id as f64)), &Tags::new())
            .unwrap();
    }
    middle.way_set(10, &[1, 2], &Tags::from([("ref", "a")])).unwrap();
    middle.way_set(20, &[3, 4], &Tags::from([("ref", "b")])).unwrap();
    middle.way_set(30, &[5, 6], &Tags::from([("ref", "c")])).unwrap();
    middle.commit().unwrap();

    // Request out of storage order, with a hole.
    let got = middle.way_get_list(&[30, 99, 10]).unwrap();
    let ids: Vec<_> = got.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids, vec![30, 10]);
    assert_eq!(got[0].1, Tags::from([("ref", "c")]));
    assert_eq!(got[1].2, vec![coord(1.0, -1.0), coord(2.0, -2.0)]);

    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn null_output_drains_cleanly() {
    let prefix = "stratum_t_null";
    {
        let mut middle = PgMiddle::start(options(prefix)).expect("start middle");
        middle.node_set(1, coord(0.0, 0.0), &Tags::new()).unwrap();
        middle.node_set(2, coord(1.0, 1.0), &Tags::new()).unwrap();
        middle.way_set(100, &[1, 2], &Tags::new()).unwrap();
        middle.commit().unwrap();
        middle.stop().unwrap();
    }

    let mut middle = reopen_append(prefix);
    middle.node_changed(1).unwrap();
    let mut sink = NullOutput;
    middle.drain_pending(&mut sink).unwrap();
    middle.analyze().unwrap();
    middle.commit().unwrap();
    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn flat_node_cache_serves_way_coordinates() {
    let dir = tempfile::tempdir().expect("temp dir");
    let flat_path = camino::Utf8PathBuf::from_path_buf(dir.path().join("nodes.bin"))
        .expect("utf-8 path");
    let prefix = "stratum_t_flat";
    let flat_options = |append: bool| MiddleOptions {
        append,
        flat_node_cache_enabled: true,
        flat_node_file: flat_path.clone(),
        ..options(prefix)
    };

    {
        let mut middle = PgMiddle::start(flat_options(false)).expect("start middle");
        middle.node_set(1, coord(20.0, 10.0), &Tags::new()).unwrap();
        middle.node_set(2, coord(20.5, 10.5), &Tags::new()).unwrap();
        middle.way_set(100, &[1, 2], &Tags::new()).unwrap();
        middle.commit().unwrap();
        middle.stop().unwrap();
    }

    // Cold RAM cache: coordinates must come back from the flat file.
    let mut middle = PgMiddle::start(flat_options(true)).expect("reopen middle");
    let (_, coords) = middle.way_get(100).unwrap().expect("way 100 exists");
    assert_eq!(coords, vec![coord(20.0, 10.0), coord(20.5, 10.5)]);

    middle.node_delete(1).unwrap();
    let (_, coords) = middle.way_get(100).unwrap().expect("way 100 exists");
    assert_eq!(coords, vec![coord(20.5, 10.5)], "deleted node is elided");

    middle.commit().unwrap();
    middle.stop().unwrap();
}

#[test]
#[ignore = "needs a live PostgreSQL server"]
fn droptemp_removes_the_tables() {
    let prefix = "stratum_t_droptemp";
    let opts = MiddleOptions {
        droptemp: true,
        ..options(prefix)
    };
    let mut middle = PgMiddle::start(opts).expect("start middle");
    middle.node_set(1, coord(0.0, 0.0), &Tags::new()).unwrap();
    middle.commit().unwrap();
    middle.stop().unwrap();

    // A fresh append-mode start against dropped tables must fail.
    let reopened = PgMiddle::start(MiddleOptions {
        append: true,
        ..options(prefix)
    });
    assert!(reopened.is_err());
}
