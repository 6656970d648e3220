//! Content-addressed fingerprint of a serialised per-cohort payload

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use std::fmt;

/// Width in bytes of a [`ResponseHash`] (256 bits).
const HASH_LEN: usize = 32;

/// Blake2b-256 digest of a raw serialised payload.
///
/// Deterministic and pure: equal bytes always hash to an equal
/// `ResponseHash`, and equality is bytewise on the digest. Blake2b is used
/// in preference to SHA-2 for speed at equivalent collision resistance;
/// 256 bits makes a collision over any realistic subscription lifetime
/// negligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseHash([u8; HASH_LEN]);

impl ResponseHash {
    /// Hashes `bytes` with Blake2b-256.
    #[must_use]
    pub fn hash(bytes: &[u8]) -> Self {
        let mut hasher = Blake2bVar::new(HASH_LEN).expect("blake2b output size 32 is valid");
        hasher.update(bytes);
        let mut out = [0u8; HASH_LEN];
        hasher
            .finalize_variable(&mut out)
            .expect("blake2b finalize should succeed with a correctly sized buffer");
        ResponseHash(out)
    }

    /// Lowercase hex digest, used for diagnostics only.
    #[must_use]
    pub fn to_hex(&self) -> String {
        use fmt::Write;
        let mut s = String::with_capacity(HASH_LEN * 2);
        for byte in self.0 {
            write!(s, "{byte:02x}").expect("writing to a String never fails");
        }
        s
    }
}

impl fmt::Display for ResponseHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
