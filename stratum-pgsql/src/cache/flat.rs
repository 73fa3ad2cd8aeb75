//! Direct-addressed flat file of node coordinate records.
//!
//! Record `i` occupies the fixed byte range `i * record_len ..` in the
//! file, so a node's coordinates are found with one seek. Records are
//! little-endian `(lat, lon)` pairs: two `i32` fields under fixed-point
//! (8 bytes), two `f64` fields under doubles (16 bytes). A sentinel
//! record marks deleted and never-written ids: `i32::MIN`/`i32::MIN`
//! under fixed-point (far outside the valid coordinate range), NaN/NaN
//! under doubles. Extending the file pads the gap with sentinels so
//! holes read as misses rather than as coordinates at the origin.
//!
//! The file is created fresh for a full import and reopened in append
//! mode for diff updates. Access is single-writer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use geo::Coord;
use log::info;
use stratum_core::OsmId;
use thiserror::Error;

use crate::options::{from_fixed, to_fixed, CoordRepr};

/// Records fetched per read when a batched lookup touches a page.
const PAGE_RECORDS: i64 = 4096;

const FIXED_SENTINEL: i32 = i32::MIN;

/// Errors raised by the flat-file node cache.
#[derive(Debug, Error)]
pub enum FlatCacheError {
    /// An I/O operation on the cache file failed.
    #[error("flat node file {path} failed during {op}")]
    Io {
        /// Location of the cache file.
        path: Utf8PathBuf,
        /// The operation that failed.
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// The file is addressed by id, so negative ids cannot be stored.
    #[error("flat node file cannot store negative id {id}")]
    NegativeId {
        /// The offending id.
        id: OsmId,
    },
}

/// Persistent coordinate store addressed directly by node id.
pub struct FlatNodeCache {
    file: File,
    path: Utf8PathBuf,
    repr: CoordRepr,
    record_len: i64,
    /// Records currently in the file (file length / record length).
    records: i64,
}

impl FlatNodeCache {
    /// Opens the cache file.
    ///
    /// With `append = false` the file is created fresh (truncating any
    /// previous run); with `append = true` an existing file is reopened
    /// and its contents kept.
    pub fn open(path: &Utf8Path, append: bool, repr: CoordRepr) -> Result<Self, FlatCacheError> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        if !append {
            opts.truncate(true);
        }
        let file = opts.open(path).map_err(|source| FlatCacheError::Io {
            path: path.to_owned(),
            op: "open",
            source,
        })?;

        let record_len = match repr {
            CoordRepr::Fixed { .. } => 8,
            CoordRepr::Double => 16,
        };
        let len = file
            .metadata()
            .map_err(|source| FlatCacheError::Io {
                path: path.to_owned(),
                op: "stat",
                source,
            })?
            .len() as i64;
        let records = len / record_len;
        if append {
            info!("reopened flat node file {path} with {records} records");
        }

        Ok(Self {
            file,
            path: path.to_owned(),
            repr,
            record_len,
            records,
        })
    }

    fn io_err(&self, op: &'static str, source: std::io::Error) -> FlatCacheError {
        FlatCacheError::Io {
            path: self.path.clone(),
            op,
            source,
        }
    }

    /// Encodes a record into the head of a 16-byte buffer; the live
    /// length is `record_len`.
    fn encode(&self, record: Option<Coord<f64>>) -> [u8; 16] {
        let mut buf = [0u8; 16];
        match self.repr {
            CoordRepr::Fixed { scale } => {
                let (lat, lon) = match record {
                    Some(c) => (to_fixed(c.y, scale), to_fixed(c.x, scale)),
                    None => (FIXED_SENTINEL, FIXED_SENTINEL),
                };
                buf[0..4].copy_from_slice(&lat.to_le_bytes());
                buf[4..8].copy_from_slice(&lon.to_le_bytes());
            }
            CoordRepr::Double => {
                let (lat, lon) = match record {
                    Some(c) => (c.y, c.x),
                    None => (f64::NAN, f64::NAN),
                };
                buf[0..8].copy_from_slice(&lat.to_le_bytes());
                buf[8..16].copy_from_slice(&lon.to_le_bytes());
            }
        }
        buf
    }

    fn decode(&self, bytes: &[u8]) -> Option<Coord<f64>> {
        match self.repr {
            CoordRepr::Fixed { scale } => {
                let lat = i32::from_le_bytes(bytes[0..4].try_into().expect("record width"));
                let lon = i32::from_le_bytes(bytes[4..8].try_into().expect("record width"));
                if lat == FIXED_SENTINEL && lon == FIXED_SENTINEL {
                    return None;
                }
                Some(Coord {
                    x: from_fixed(lon, scale),
                    y: from_fixed(lat, scale),
                })
            }
            CoordRepr::Double => {
                let lat = f64::from_le_bytes(bytes[0..8].try_into().expect("record width"));
                let lon = f64::from_le_bytes(bytes[8..16].try_into().expect("record width"));
                if lat.is_nan() || lon.is_nan() {
                    return None;
                }
                Some(Coord { x: lon, y: lat })
            }
        }
    }

    /// Pads the file with sentinel records up to (excluding) `upto`.
    fn extend_with_sentinels(&mut self, upto: i64) -> Result<(), FlatCacheError> {
        if upto <= self.records {
            return Ok(());
        }
        let sentinel = self.encode(None);
        let sentinel = &sentinel[..self.record_len as usize];
        self.file
            .seek(SeekFrom::Start((self.records * self.record_len) as u64))
            .map_err(|e| self.io_err("seek", e))?;

        let mut remaining = upto - self.records;
        let chunk: Vec<u8> = sentinel
            .iter()
            .cycle()
            .take((PAGE_RECORDS * self.record_len) as usize)
            .copied()
            .collect();
        while remaining > 0 {
            let n = remaining.min(PAGE_RECORDS);
            self.file
                .write_all(&chunk[..(n * self.record_len) as usize])
                .map_err(|e| self.io_err("extend", e))?;
            remaining -= n;
        }
        self.records = upto;
        Ok(())
    }

    fn write_record(&mut self, id: OsmId, record: Option<Coord<f64>>) -> Result<(), FlatCacheError> {
        if id < 0 {
            return Err(FlatCacheError::NegativeId { id });
        }
        self.extend_with_sentinels(id)?;
        self.file
            .seek(SeekFrom::Start((id * self.record_len) as u64))
            .map_err(|e| self.io_err("seek", e))?;
        let bytes = self.encode(record);
        self.file
            .write_all(&bytes[..self.record_len as usize])
            .map_err(|e| self.io_err("write", e))?;
        self.records = self.records.max(id + 1);
        Ok(())
    }

    /// Stores a coordinate at its id's slot, growing the file as needed.
    pub fn set(&mut self, id: OsmId, location: Coord<f64>) -> Result<(), FlatCacheError> {
        self.write_record(id, Some(location))
    }

    /// Marks an id deleted by writing the sentinel record. Ids beyond the
    /// end of the file already read as misses and are left alone.
    pub fn delete(&mut self, id: OsmId) -> Result<(), FlatCacheError> {
        if id < 0 {
            return Err(FlatCacheError::NegativeId { id });
        }
        if id >= self.records {
            return Ok(());
        }
        self.write_record(id, None)
    }

    /// Looks up a single id; `None` for never-written, deleted or
    /// out-of-range ids.
    pub fn get(&mut self, id: OsmId) -> Result<Option<Coord<f64>>, FlatCacheError> {
        if id < 0 || id >= self.records {
            return Ok(None);
        }
        self.file
            .seek(SeekFrom::Start((id * self.record_len) as u64))
            .map_err(|e| self.io_err("seek", e))?;
        let mut buf = vec![0u8; self.record_len as usize];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| self.io_err("read", e))?;
        Ok(self.decode(&buf))
    }

    /// Batched lookup: requests are grouped by file page, each touched
    /// page is read once, and results are scattered back into input
    /// order.
    pub fn get_list(&mut self, ids: &[OsmId]) -> Result<Vec<Option<Coord<f64>>>, FlatCacheError> {
        use std::collections::BTreeMap;

        let mut results = vec![None; ids.len()];
        let mut by_page: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (pos, &id) in ids.iter().enumerate() {
            if id >= 0 && id < self.records {
                by_page.entry(id / PAGE_RECORDS).or_default().push(pos);
            }
        }

        let mut page_buf = vec![0u8; (PAGE_RECORDS * self.record_len) as usize];
        for (page, positions) in by_page {
            let first = page * PAGE_RECORDS;
            let in_page = (self.records - first).min(PAGE_RECORDS);
            let byte_len = (in_page * self.record_len) as usize;
            self.file
                .seek(SeekFrom::Start((first * self.record_len) as u64))
                .map_err(|e| self.io_err("seek", e))?;
            self.file
                .read_exact(&mut page_buf[..byte_len])
                .map_err(|e| self.io_err("read", e))?;

            for pos in positions {
                let offset = ((ids[pos] - first) * self.record_len) as usize;
                results[pos] = self.decode(&page_buf[offset..offset + self.record_len as usize]);
            }
        }
        Ok(results)
    }

    /// Records currently addressable in the file.
    #[must_use]
    pub fn len_records(&self) -> i64 {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    fn coord(x: f64, y: f64) -> Coord<f64> {
        Coord { x, y }
    }

    #[fixture]
    fn tmp() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().expect("create temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nodes.bin")).expect("utf-8 path");
        (dir, path)
    }

    #[rstest]
    fn positional_invariance_under_arbitrary_write_order(tmp: (TempDir, Utf8PathBuf)) {
        let (_dir, path) = tmp;
        let mut cache = FlatNodeCache::open(&path, false, CoordRepr::DEFAULT_FIXED).unwrap();

        for id in [900, 3, 512, 47] {
            cache.set(id, coord(id as f64 / 100.0, -(id as f64) / 100.0)).unwrap();
        }
        for id in [3, 47, 512, 900] {
            assert_eq!(
                cache.get(id).unwrap(),
                Some(coord(id as f64 / 100.0, -(id as f64) / 100.0))
            );
        }
        assert_eq!(cache.get(4).unwrap(), None, "never-set id must miss");
        assert_eq!(cache.get(5000).unwrap(), None, "beyond end must miss");
    }

    #[rstest]
    fn gaps_read_as_misses_not_origin(tmp: (TempDir, Utf8PathBuf)) {
        let (_dir, path) = tmp;
        let mut cache = FlatNodeCache::open(&path, false, CoordRepr::DEFAULT_FIXED).unwrap();
        cache.set(10_000, coord(1.0, 2.0)).unwrap();
        // Every id under the high-water mark was sentinel-filled.
        assert_eq!(cache.get(0).unwrap(), None);
        assert_eq!(cache.get(9_999).unwrap(), None);
        assert_eq!(cache.get(10_000).unwrap(), Some(coord(1.0, 2.0)));
    }

    #[rstest]
    fn delete_writes_the_sentinel(tmp: (TempDir, Utf8PathBuf)) {
        let (_dir, path) = tmp;
        let mut cache = FlatNodeCache::open(&path, false, CoordRepr::DEFAULT_FIXED).unwrap();
        cache.set(5, coord(1.5, 2.5)).unwrap();
        cache.delete(5).unwrap();
        assert_eq!(cache.get(5).unwrap(), None);
        // Deleting past the end is a no-op, not an extension.
        cache.delete(1_000_000).unwrap();
        assert_eq!(cache.len_records(), 6);
    }

    #[rstest]
    fn batched_lookup_scatters_into_input_order(tmp: (TempDir, Utf8PathBuf)) {
        let (_dir, path) = tmp;
        let mut cache = FlatNodeCache::open(&path, false, CoordRepr::DEFAULT_FIXED).unwrap();
        // Span several pages so the grouping path is exercised.
        for id in [1, 4_097, 9_000, 12_345] {
            cache.set(id, coord(id as f64 / 1000.0, 0.5)).unwrap();
        }

        let ids = [12_345, 2, 1, 9_000, -8, 4_097];
        let got = cache.get_list(&ids).unwrap();
        assert_eq!(got[0], Some(coord(12.345, 0.5)));
        assert_eq!(got[1], None);
        assert_eq!(got[2], Some(coord(0.001, 0.5)));
        assert_eq!(got[3], Some(coord(9.0, 0.5)));
        assert_eq!(got[4], None);
        assert_eq!(got[5], Some(coord(4.097, 0.5)));
    }

    #[rstest]
    fn append_mode_keeps_prior_records(tmp: (TempDir, Utf8PathBuf)) {
        let (_dir, path) = tmp;
        {
            let mut cache = FlatNodeCache::open(&path, false, CoordRepr::DEFAULT_FIXED).unwrap();
            cache.set(7, coord(3.25, -4.5)).unwrap();
        }
        let mut reopened = FlatNodeCache::open(&path, true, CoordRepr::DEFAULT_FIXED).unwrap();
        assert_eq!(reopened.len_records(), 8);
        assert_eq!(reopened.get(7).unwrap(), Some(coord(3.25, -4.5)));

        // A fresh (non-append) open truncates instead.
        let mut fresh = FlatNodeCache::open(&path, false, CoordRepr::DEFAULT_FIXED).unwrap();
        assert_eq!(fresh.len_records(), 0);
        assert_eq!(fresh.get(7).unwrap(), None);
    }

    #[rstest]
    fn double_representation_uses_wide_records(tmp: (TempDir, Utf8PathBuf)) {
        let (_dir, path) = tmp;
        let mut cache = FlatNodeCache::open(&path, false, CoordRepr::Double).unwrap();
        let precise = coord(13.404_953_999_123, 52.520_006_599_456);
        cache.set(2, precise).unwrap();
        assert_eq!(cache.get(2).unwrap(), Some(precise));
        assert_eq!(cache.len_records(), 3);

        let len = std::fs::metadata(path.as_std_path()).unwrap().len();
        assert_eq!(len, 3 * 16);
    }

    #[rstest]
    fn negative_ids_are_rejected_for_writes(tmp: (TempDir, Utf8PathBuf)) {
        let (_dir, path) = tmp;
        let mut cache = FlatNodeCache::open(&path, false, CoordRepr::DEFAULT_FIXED).unwrap();
        assert!(matches!(
            cache.set(-1, coord(0.0, 0.0)),
            Err(FlatCacheError::NegativeId { id: -1 })
        ));
        assert_eq!(cache.get(-1).unwrap(), None);
    }
}
