//! Process-wide segment size estimation.
//!
//! Releases are posted with near-identical encoded segment sizes, so one
//! decoded-size probe predicts the layout of every sibling file. The
//! estimator keeps a small shared table of `(encoded, decoded)` pairs with a
//! fuzzy lookup: probing a 400,000-byte segment lets a 401,500-byte segment
//! of the next file skip its probe entirely.

use parking_lot::Mutex;

/// Lookup window: stored encoded sizes within this absolute distance match.
const FUZZ_WINDOW: u64 = 4096;

/// Shared encoded-to-decoded size memory. Lives for the process.
#[derive(Debug, Default)]
pub struct SizeEstimator {
    entries: Mutex<Vec<(u64, u64)>>,
}

impl SizeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded size for a segment of `encoded` bytes, if a close enough
    /// probe has been recorded.
    pub fn get(&self, encoded: u64) -> Option<u64> {
        self.entries
            .lock()
            .iter()
            .find(|(stored, _)| stored.abs_diff(encoded) < FUZZ_WINDOW)
            .map(|&(_, decoded)| decoded)
    }

    /// Record a probe result. A no-op when a fuzzy match already exists, so
    /// repeated probes of sibling files cannot grow the table.
    pub fn set(&self, encoded: u64, decoded: u64) {
        let mut entries = self.entries.lock();
        if entries
            .iter()
            .any(|(stored, _)| stored.abs_diff(encoded) < FUZZ_WINDOW)
        {
            return;
        }
        entries.push((encoded, decoded));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn fuzzy_lookup_within_window() {
        let estimator = SizeEstimator::new();
        estimator.set(400_000, 384_000);

        assert_eq!(estimator.get(400_000), Some(384_000));
        assert_eq!(estimator.get(401_500), Some(384_000));
        assert_eq!(estimator.get(400_000 + FUZZ_WINDOW - 1), Some(384_000));
        assert_eq!(estimator.get(400_000 + FUZZ_WINDOW), None);
        assert_eq!(estimator.get(300_000), None);
    }

    #[test]
    fn set_is_idempotent_within_window() {
        let estimator = SizeEstimator::new();
        estimator.set(400_000, 384_000);
        estimator.set(400_000, 999_999);
        estimator.set(402_000, 111_111);

        assert_eq!(estimator.len(), 1);
        assert_eq!(estimator.get(400_000), Some(384_000));
    }

    #[test]
    fn distant_entries_coexist() {
        let estimator = SizeEstimator::new();
        estimator.set(400_000, 384_000);
        estimator.set(800_000, 768_000);

        assert_eq!(estimator.len(), 2);
        assert_eq!(estimator.get(800_100), Some(768_000));
    }

    proptest! {
        #[test]
        fn lookup_matches_iff_within_window(stored in 0u64..1 << 40, probe in 0u64..1 << 40) {
            let estimator = SizeEstimator::new();
            estimator.set(stored, 12345);
            let hit = estimator.get(probe).is_some();
            prop_assert_eq!(hit, stored.abs_diff(probe) < FUZZ_WINDOW);
        }

        #[test]
        fn repeated_sets_never_grow_table(encoded in 0u64..1 << 40, jitter in 0u64..FUZZ_WINDOW) {
            let estimator = SizeEstimator::new();
            estimator.set(encoded, 1);
            estimator.set(encoded.saturating_add(jitter), 2);
            prop_assert_eq!(estimator.len(), 1);
        }
    }
}
