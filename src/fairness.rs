//! Provably-fair crash point commitment.
//!
//! The crash point of a round is `HMAC-SHA256(key = server_seed, "crash")`
//! mapped onto a multiplier. The seed stays secret until the round crashes;
//! once revealed, anyone can recompute the crash point with [`derive_crash_point`]
//! and compare it with what the round reported.

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Public domain-separation label hashed under the seed
pub const CRASH_LABEL: &[u8] = b"crash";

/// Hex characters of the digest consumed (13 hex = 52 bits)
const DIGEST_PREFIX_HEX: usize = 13;

const TWO_POW_52: f64 = 4_503_599_627_370_496.0;
const EPSILON: f64 = 1e-9;

pub const MIN_CRASH_POINT: f64 = 1.01;
pub const MAX_CRASH_POINT: f64 = 50.0;

/// Hex digest of `HMAC-SHA256(server_seed, "crash")`
pub fn commitment_digest(server_seed: &str) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(server_seed.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts keys of any length");
    };
    mac.update(CRASH_LABEL);
    hex::encode(mac.finalize().into_bytes())
}

/// Derive the crash multiplier committed by `server_seed`.
///
/// Pure and platform independent: the same seed always yields the same
/// value in `[1.01, 50.00]`, rounded to two decimals.
pub fn derive_crash_point(server_seed: &str) -> f64 {
    let digest = commitment_digest(server_seed);
    crash_point_from_digest(&digest)
}

fn crash_point_from_digest(digest: &str) -> f64 {
    let prefix = &digest[..DIGEST_PREFIX_HEX];
    let mut r = u64::from_str_radix(prefix, 16).unwrap_or(0);
    if r == 0 {
        r = 1;
    }

    let x = r as f64 / TWO_POW_52;
    let m = 1.0 / (1.0 - x).max(EPSILON);
    let clamped = m.clamp(MIN_CRASH_POINT, MAX_CRASH_POINT);
    (clamped * 100.0).round() / 100.0
}

/// Fresh secret seed: 32 bytes from the OS CSPRNG, hex encoded
pub fn generate_server_seed() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Everything a player needs to check a revealed round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FairnessProof {
    pub server_seed: String,
    pub label: String,
    pub digest: String,
    pub digest_prefix: String,
    pub recomputed_crash_at: f64,
    pub reported_crash_at: f64,
    pub valid: bool,
}

/// Recompute the crash point from a revealed seed and compare with the
/// reported one
pub fn verify(server_seed: &str, reported_crash_at: f64) -> FairnessProof {
    let digest = commitment_digest(server_seed);
    let recomputed = crash_point_from_digest(&digest);

    FairnessProof {
        server_seed: server_seed.to_string(),
        label: String::from_utf8_lossy(CRASH_LABEL).into_owned(),
        digest_prefix: digest[..DIGEST_PREFIX_HEX].to_string(),
        digest,
        recomputed_crash_at: recomputed,
        reported_crash_at,
        valid: recomputed == reported_crash_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_crash_points() {
        assert_eq!(derive_crash_point("seed-743"), 2.00);
        assert_eq!(derive_crash_point("seed-311"), 1.50);
        assert_eq!(derive_crash_point("seed-509"), 3.00);
        assert_eq!(derive_crash_point("alpha"), 1.11);
        assert_eq!(derive_crash_point("provably-fair"), 1.63);
        assert_eq!(derive_crash_point("seed-42"), 3.01);
    }

    #[test]
    fn test_clamps_to_bounds() {
        // raw multiplier ~161x
        assert_eq!(derive_crash_point("seed-21"), MAX_CRASH_POINT);
        // raw multiplier ~1.009x
        assert_eq!(derive_crash_point("seed-203"), MIN_CRASH_POINT);
    }

    #[test]
    fn test_digest_prefix_matches_reference() {
        assert!(commitment_digest("seed-743").starts_with("7ffcf3af25c46"));
        assert!(commitment_digest("alpha").starts_with("1a0ad49efa704"));
    }

    #[test]
    fn test_zero_prefix_is_forced_to_one() {
        let digest = format!("{}{}", "0".repeat(13), "f".repeat(51));
        assert_eq!(crash_point_from_digest(&digest), MIN_CRASH_POINT);
    }

    #[test]
    fn test_deterministic_and_in_range() {
        for _ in 0..200 {
            let seed = generate_server_seed();
            let first = derive_crash_point(&seed);
            assert_eq!(first, derive_crash_point(&seed));
            assert!((MIN_CRASH_POINT..=MAX_CRASH_POINT).contains(&first));
        }
    }

    #[test]
    fn test_seeds_are_unique_hex() {
        let a = generate_server_seed();
        let b = generate_server_seed();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(hex::decode(&a).is_ok());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let proof = verify("seed-743", 2.00);
        assert!(proof.valid);
        assert_eq!(proof.digest_prefix, "7ffcf3af25c46");

        let tampered = verify("seed-743", 2.50);
        assert!(!tampered.valid);
        assert_eq!(tampered.recomputed_crash_at, 2.00);
    }
}
