//! Single-use discount code generation. Codes are advisory: the store's
//! uniqueness constraint is what actually rules out duplicates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use recovery_core::types::CustomerSegment;
use std::sync::{Mutex, PoisonError};

/// Uppercase alphanumerics without the easily confused 0/O and 1/I.
const SUFFIX_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub struct CodeGenerator {
    prefix: String,
    suffix_len: usize,
    rng: Mutex<StdRng>,
}

impl CodeGenerator {
    pub fn new(prefix: &str, suffix_len: usize) -> Self {
        Self::with_rng(prefix, suffix_len, StdRng::from_entropy())
    }

    /// Reproducible codes, for comparing runs.
    pub fn with_seed(prefix: &str, suffix_len: usize, seed: u64) -> Self {
        Self::with_rng(prefix, suffix_len, StdRng::seed_from_u64(seed))
    }

    fn with_rng(prefix: &str, suffix_len: usize, rng: StdRng) -> Self {
        Self {
            prefix: prefix.trim().to_uppercase(),
            suffix_len: suffix_len.max(1),
            rng: Mutex::new(rng),
        }
    }

    /// `PREFIX-SEGMENT-SUFFIX`, e.g. `COMEBACK-BACK-7KQ2MX`.
    pub fn generate(&self, segment: CustomerSegment) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let suffix: String = (0..self.suffix_len)
            .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect();
        if self.prefix.is_empty() {
            format!("{}-{}", segment.code_fragment(), suffix)
        } else {
            format!("{}-{}-{}", self.prefix, segment.code_fragment(), suffix)
        }
    }
}
