use xxhash_rust::xxh3::xxh3_128;

/// Computes the two 64-bit base hashes of a byte slice as the (low, high)
/// halves of its 128-bit XXH3 digest.
pub fn hash128(data: &[u8]) -> (u64, u64) {
    let hash = xxh3_128(data);
    (hash as u64, (hash >> 64) as u64)
}

/// The i-th double-hashing probe: `(low + i * high) mod modulus`.
pub fn ith_hash(low: u64, high: u64, i: u64, modulus: u64) -> u64 {
    low.wrapping_add(i.wrapping_mul(high)) % modulus
}
