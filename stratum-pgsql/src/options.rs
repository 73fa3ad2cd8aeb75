//! Runtime configuration for the middle store.

use camino::Utf8PathBuf;

/// How coordinates are represented in the tables and the flat file.
///
/// `Fixed` stores degrees as scaled 32-bit integers (`int4` columns,
/// 8-byte flat-file records); `Double` stores IEEE-754 doubles
/// (`double precision` columns, 16-byte records). One build serves both;
/// every codec, column type and record width derives from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordRepr {
    /// IEEE-754 double precision.
    Double,
    /// Fixed-point with a power-of-ten scale factor.
    Fixed {
        /// Degrees-to-integer multiplier, e.g. `10_000_000`.
        scale: i32,
    },
}

/// Converts degrees to the scaled fixed-point integer form.
#[must_use]
pub(crate) fn to_fixed(degrees: f64, scale: i32) -> i32 {
    (degrees * f64::from(scale)).round() as i32
}

/// Converts the scaled fixed-point integer form back to degrees.
#[must_use]
pub(crate) fn from_fixed(fixed: i32, scale: i32) -> f64 {
    f64::from(fixed) / f64::from(scale)
}

impl CoordRepr {
    /// The default fixed-point representation (scale 10⁷, ~1.1 cm).
    pub const DEFAULT_FIXED: Self = Self::Fixed { scale: 10_000_000 };

    /// Runs a coordinate through the storage representation, so cached
    /// values compare equal to values read back from disk or the backend.
    #[must_use]
    pub fn quantize(self, degrees: f64) -> f64 {
        match self {
            Self::Double => degrees,
            Self::Fixed { scale } => {
                if degrees.is_nan() {
                    degrees
                } else {
                    from_fixed(to_fixed(degrees, scale), scale)
                }
            }
        }
    }

    /// SQL column type for coordinate columns.
    #[must_use]
    pub(crate) fn sql_type(self) -> &'static str {
        match self {
            Self::Double => "double precision",
            Self::Fixed { .. } => "int4",
        }
    }
}

impl Default for CoordRepr {
    fn default() -> Self {
        Self::DEFAULT_FIXED
    }
}

/// Options recognised by the middle store.
///
/// All fields are plain data; the defaults suit a small local test import.
#[derive(Debug, Clone)]
pub struct MiddleOptions {
    /// libpq-style connection string, e.g. `host=localhost user=osm`.
    pub conninfo: String,
    /// Table-name prefix; tables are `<prefix>_nodes` / `_ways` / `_rels`.
    pub prefix: String,
    /// Tablespace for the three tables, if any.
    pub tablespace_data: Option<String>,
    /// Tablespace for their indexes, if any.
    pub tablespace_index: Option<String>,
    /// Create the tables UNLOGGED.
    pub unlogged: bool,
    /// Diff-update mode: tables already exist and carry data.
    pub append: bool,
    /// Drop the tables at stop time instead of building indexes.
    pub droptemp: bool,
    /// RAM node cache memory target, in MiB.
    pub cache_mib: usize,
    /// Coordinate representation shared by tables, caches and codecs.
    pub coord_repr: CoordRepr,
    /// Route node coordinates through the flat file instead of the nodes
    /// table.
    pub flat_node_cache_enabled: bool,
    /// Location of the flat node file.
    pub flat_node_file: Utf8PathBuf,
}

impl Default for MiddleOptions {
    fn default() -> Self {
        Self {
            conninfo: String::new(),
            prefix: "planet_osm".to_owned(),
            tablespace_data: None,
            tablespace_index: None,
            unlogged: false,
            append: false,
            droptemp: false,
            cache_mib: 800,
            coord_repr: CoordRepr::default(),
            flat_node_cache_enabled: false,
            flat_node_file: Utf8PathBuf::from("flat.nodes.bin"),
        }
    }
}
