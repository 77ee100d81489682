//! Record descriptors: one immutable entry per stored blob, holding its path,
//! its metadata map and the byte ranges of its encrypted segments.

use serde_json::Value;

use crate::index;

/// Reserved metadata key: the record's full path.
pub const PROP_ID: &str = "id";
/// Reserved metadata key: the record's leaf name.
pub const PROP_NAME: &str = "name";

/// Ordered JSON object used for the container header, the private properties
/// block and per-record metadata. Insertion order is preserved end to end.
pub type PropertyMap = serde_json::Map<String, Value>;

/// Which backing file currently holds a record's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The original container file (committed records).
    Container,
    /// The scratch file (pending additions).
    Scratch,
}

/// An immutable descriptor of one stored blob. Updates are delete + add;
/// a record is never mutated in place.
#[derive(Debug, Clone)]
pub struct Record {
    /// Absolute, slash-delimited, case-preserving path; unique within the
    /// archive when compared case-insensitively.
    pub path: String,
    /// Decrypted metadata, always containing `id` and `name`.
    pub properties: PropertyMap,
    pub origin: Origin,
    /// Byte range of the whole on-disk record (IV + metadata + data).
    pub offset: u64,
    pub length: u64,
    /// Byte range of the encrypted metadata JSON.
    pub meta_offset: u64,
    pub meta_length: u64,
    /// Byte range of the encrypted payload.
    pub data_offset: u64,
    pub data_length: u64,
}

impl Record {
    /// The record's leaf name, derived from its path.
    pub fn name(&self) -> &str {
        index::leaf_name(&self.path)
    }

    /// Case-folded path, the key used by the archive's record sets.
    pub fn comparable_path(&self) -> String {
        index::comparable(&self.path)
    }
}
