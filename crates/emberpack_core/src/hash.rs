use xxhash_rust::xxh3::xxh3_64;

/// Content identity hash.
///
/// The hashes don't need to be incredibly fast, but they must be stable across
/// runs, machines and platforms, since they decide whether a rewrite of a file
/// actually changed anything.
pub fn hash_bytes(s: &[u8]) -> u64 {
  xxh3_64(s)
}
