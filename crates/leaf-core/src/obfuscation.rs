//! Patient count obfuscation.
//!
//! Counts at or below the low-cell threshold are clamped to the threshold. Larger counts are
//! shifted by a non-zero amount drawn from a generator seeded by the query signature, so the
//! same logical query always receives the same shift. Re-submitting a reordered query cannot be
//! used to average the noise away.
//!
//! The generator is ChaCha8, whose output stream is fixed across releases and platforms, so a
//! shift computed today is the shift computed after any restart or upgrade.

use crate::config::ObfuscationPolicy;
use crate::panel::Panel;
use crate::signature::canonicalize;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A patient count as reported to the federation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientCount {
    pub value: i64,
    #[serde(default)]
    pub plus_minus: i64,
    #[serde(default)]
    pub within_low_cell_threshold: bool,
}

impl PatientCount {
    /// A raw, unobfuscated count.
    pub fn raw(value: i64) -> Self {
        Self {
            value,
            plus_minus: 0,
            within_low_cell_threshold: false,
        }
    }
}

/// Apply `policy` to `count` for the query identified by `signature`.
///
/// Deterministic: the same `count`, `signature` and `policy` always give the same result.
/// The policy must have been validated (see [`ObfuscationPolicy::new`]), which guarantees the
/// noise range contains a non-zero value.
pub fn obfuscate(count: PatientCount, signature: &str, policy: &ObfuscationPolicy) -> PatientCount {
    if !policy.enabled() {
        return count;
    }

    let masking = policy.low_cell_masking();
    if masking.enabled && count.value <= masking.threshold {
        return PatientCount {
            value: masking.threshold,
            plus_minus: masking.threshold,
            within_low_cell_threshold: true,
        };
    }

    let noise = policy.noise();
    if !noise.enabled {
        return count;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(u64::from(signature_seed(signature)));
    let shift = loop {
        let candidate = rng.gen_range(noise.lower_bound..noise.upper_bound);
        if candidate != 0 {
            break candidate;
        }
    };

    PatientCount {
        value: count.value.saturating_add(i64::from(shift)),
        plus_minus: noise.plus_minus(),
        within_low_cell_threshold: false,
    }
}

/// Canonicalise `panels` and obfuscate `count` with the resulting signature.
pub fn obfuscate_query(count: PatientCount, panels: &[Panel], policy: &ObfuscationPolicy) -> PatientCount {
    obfuscate(count, &canonicalize(panels), policy)
}

/// First four digest bytes of the signature, little-endian.
///
/// SHA-256 is used only as a stable digest here; nothing depends on its cryptographic strength.
fn signature_seed(signature: &str) -> u32 {
    let digest = Sha256::digest(signature.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
