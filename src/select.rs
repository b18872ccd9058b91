//! Final gate between a transformed buffer and the original.
//!
//! The threshold is always supplied by the caller.

/// True if a candidate of `candidate_len` bytes is small enough to replace
/// an original of `original_len` bytes.
pub fn accepts(original_len: usize, candidate_len: usize, threshold: f64) -> bool {
    (candidate_len as f64) < original_len as f64 * threshold
}

/// Returns `candidate` if it is below `threshold` times the size of
/// `original`, otherwise `original`.
pub fn select<'a>(original: &'a [u8], candidate: &'a [u8], threshold: f64) -> &'a [u8] {
    if accepts(original.len(), candidate.len(), threshold) {
        candidate
    } else {
        original
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn boundary_is_exclusive() {
        assert!(!accepts(100, 95, 0.95));
        assert!(accepts(100, 94, 0.95));
        assert!(!accepts(0, 0, 0.95));
    }

    #[test]
    fn picks_candidate_only_when_small_enough() {
        let original = vec![1u8; 100];
        let small = vec![2u8; 50];
        let close = vec![3u8; 97];
        assert_eq!(select(&original, &small, 0.95), &small[..]);
        assert_eq!(select(&original, &close, 0.95), &original[..]);
    }

    proptest! {
        #[test]
        fn selecting_self_is_identity(data in prop::collection::vec(any::<u8>(), 0..256), t in 0.01f64..=1.0) {
            prop_assert_eq!(select(&data, &data, t), &data[..]);
        }

        #[test]
        fn never_returns_larger_than_original(
            original in prop::collection::vec(any::<u8>(), 0..128),
            candidate in prop::collection::vec(any::<u8>(), 0..256),
            t in 0.01f64..=1.0,
        ) {
            prop_assert!(select(&original, &candidate, t).len() <= original.len());
        }
    }
}
