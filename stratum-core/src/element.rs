//! OSM element vocabulary: identifiers, tags and relation members.
//!
//! Tags are kept as an insertion-ordered list of key/value pairs rather
//! than a hash map. The same pair representation carries relation member
//! lists through the backend, and there the order is contractual; using
//! one representation for both keeps the codec honest.

use std::fmt;

/// A 64-bit signed OSM element identifier.
///
/// Negative ids are valid; editors assign them to elements that have not
/// been uploaded yet, and imports of such data must round-trip them.
pub type OsmId = i64;

/// An insertion-ordered collection of key/value string pairs.
///
/// Duplicate keys are not rejected; [`Tags::get`] returns the first match.
///
/// # Examples
///
/// ```
/// use stratum_core::Tags;
///
/// let mut tags = Tags::new();
/// tags.insert("highway", "residential");
/// tags.insert("name", "Mill Road");
/// assert_eq!(tags.get("name"), Some("Mill Road"));
/// assert_eq!(tags.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    /// Creates an empty tag collection.
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a key/value pair, preserving insertion order.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Returns the value of the first pair whose key matches.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates the pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no pairs are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Tags {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Tags {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Tags {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// The kind of element a relation member references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

impl MemberType {
    /// Single-character code used when member lists are serialised
    /// (`n`/`w`/`r` prefixes on the member key).
    #[must_use]
    pub fn type_char(self) -> char {
        match self {
            Self::Node => 'n',
            Self::Way => 'w',
            Self::Relation => 'r',
        }
    }

    /// Inverse of [`MemberType::type_char`]; `None` for unknown codes.
    #[must_use]
    pub fn from_type_char(c: char) -> Option<Self> {
        match c {
            'n' => Some(Self::Node),
            'w' => Some(Self::Way),
            'r' => Some(Self::Relation),
            _ => None,
        }
    }
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        };
        f.write_str(name)
    }
}

/// One entry of a relation's ordered member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Kind of the referenced element.
    pub mtype: MemberType,
    /// Identifier of the referenced element.
    pub id: OsmId,
    /// Free-form role string (may be empty).
    pub role: String,
}

impl Member {
    /// Constructs a member entry.
    pub fn new(mtype: MemberType, id: OsmId, role: impl Into<String>) -> Self {
        Self {
            mtype,
            id,
            role: role.into(),
        }
    }
}
