//! Byte-key utilities shared by the catalog and assignment code.
//!
//! Region names and row keys are ordered by unsigned lexicographic byte
//! comparison. Rust slice ordering already is that comparison; the named
//! helper exists so call sites read like the catalog contract they implement.

use std::cmp::Ordering;

/// Table name of the bootstrap catalog region.
pub const ROOT_TABLE_NAME: &str = "-ROOT-";

/// Table name of the meta catalog table.
pub const META_TABLE_NAME: &str = ".META.";

/// Row-key prefix that routes a catalog lookup to the root region.
pub const META_REGION_PREFIX: &[u8] = b".META.,";

/// Unsigned lexicographic comparison of two byte keys.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// True when `row` belongs to the meta table and must be resolved via root.
pub fn is_meta_table_row(row: &[u8]) -> bool {
    row.len() > META_REGION_PREFIX.len() && row.starts_with(META_REGION_PREFIX)
}

/// Build the canonical region name `<table>,<startKey>,<regionId>`.
pub fn region_name(table: &str, start_key: &[u8], region_id: u64) -> Vec<u8> {
    let mut name = Vec::with_capacity(table.len() + start_key.len() + 24);
    name.extend_from_slice(table.as_bytes());
    name.push(b',');
    name.extend_from_slice(start_key);
    name.push(b',');
    name.extend_from_slice(region_id.to_string().as_bytes());
    name
}

/// Stable short name for a region: FNV-1a over the full region name,
/// rendered in decimal. The encoded name keys the coordination-service
/// mirror node, so it must not change across process restarts or releases.
pub fn encoded_name(region_name: &[u8]) -> String {
    fnv1a32(region_name).to_string()
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
