//! Hashing and bucketing.
//!
//! Bucket assignment must be identical across processes, restarts and implementation languages:
//! changing it silently reshuffles every live rollout and experiment. The hash is MD5 over
//! `subject_id || salt`, and the bucket is the low-order 64 bits (big-endian bytes 8..16 of the
//! digest) modulo the requested modulus.

/// Modulus used for rollout inclusion checks.
pub const ROLLOUT_BUCKETS: u64 = 100;
/// Modulus used for variant allocation. Finer-grained than [`ROLLOUT_BUCKETS`] so that variant
/// weights can be expressed with two decimal places.
pub const VARIANT_BUCKETS: u64 = 10_000;

pub trait Sharder {
    /// Map `subject_id` and `salt` to a stable integer in `[0, modulus)`.
    fn bucket(&self, subject_id: &str, salt: &str, modulus: u64) -> u64;
}

/// The default (and only production) sharder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn bucket(&self, subject_id: &str, salt: &str, modulus: u64) -> u64 {
        let mut context = md5::Context::new();
        context.consume(subject_id.as_bytes());
        context.consume(salt.as_bytes());
        let digest = context.compute();

        let mut low = [0u8; 8];
        low.copy_from_slice(&digest[8..16]);
        // A zero modulus is a caller bug; map everything to bucket 0 instead of panicking on the
        // hot path.
        u64::from_be_bytes(low) % modulus.max(1)
    }
}

/// Bucket `subject_id` with the default sharder.
pub fn bucket(subject_id: &str, salt: &str, modulus: u64) -> u64 {
    Md5Sharder.bucket(subject_id, salt, modulus)
}

/// Salt used for the rollout inclusion bucket of `flag_key`.
pub(crate) fn rollout_salt(flag_key: &str) -> String {
    format!("{flag_key}:rollout")
}

/// Salt used for the variant allocation bucket of `flag_key`.
pub(crate) fn variant_salt(flag_key: &str) -> String {
    format!("{flag_key}:variant")
}

/// A sharder that returns preconfigured buckets. Keys are `subject_id || salt`.
#[cfg(test)]
pub(crate) struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn bucket(&self, subject_id: &str, salt: &str, modulus: u64) -> u64 {
        self.0
            .get(&format!("{subject_id}{salt}"))
            .copied()
            .unwrap_or(0)
            % modulus
    }
}
