//! Digests every participant computes on its own and gets the same answer:
//! group keys from the participant set, fingerprints from a clique id.

const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over the concatenation of `parts`.
///
/// Part boundaries are not hashed, so callers that feed variable-length
/// fields must encode their lengths themselves.
pub(crate) fn fnv1a<I, S>(parts: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    parts.into_iter().fold(OFFSET_BASIS, |h, part| {
        part.as_ref()
            .iter()
            .fold(h, |h, &b| (h ^ u64::from(b)).wrapping_mul(PRIME))
    })
}

/// Fold a 64-bit digest into the 32-bit fingerprint shown in logs.
pub(crate) fn fold32(h: u64) -> u32 {
    ((h >> 32) ^ h) as u32
}
