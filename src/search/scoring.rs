//! Relevance of a matched stack of phrases.
//!
//! Relevance combines three factors, each in `0..=1`:
//! - coverage: share of query tokens consumed by matched phrases
//! - word order: penalty for segments that are neither ascending nor
//!   descending in index order
//! - phrase relevance: the weakest matched posting (synonyms are weaker)

/// Penalty per out-of-order segment.
const ORDER_PENALTY: f64 = 0.7;

/// Share of `total` query tokens that were matched.
pub fn coverage(matched: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    matched.min(total) as f64 / total as f64
}

/// Minimum number of segments out of place, given the index position of each
/// matched segment in query order.
///
/// A query may list places fine-to-coarse (`main st, springfield, illinois`) or
/// coarse-to-fine (`illinois springfield main st`); whichever reading needs
/// fewer swaps is used. The result is capped at `len - 1`.
pub fn order_inversions(positions: &[usize]) -> usize {
    let mut ascending = 0;
    let mut descending = 0;
    for (i, a) in positions.iter().enumerate() {
        for b in &positions[i + 1..] {
            if a > b {
                ascending += 1;
            } else if a < b {
                descending += 1;
            }
        }
    }
    ascending
        .min(descending)
        .min(positions.len().saturating_sub(1))
}

/// `(n - 0.7k) / n` for `n` segments with `k` inversions; 1 for a single segment.
pub fn order_factor(positions: &[usize]) -> f64 {
    let n = positions.len();
    if n <= 1 {
        return 1.0;
    }
    let k = order_inversions(positions) as f64;
    let n = n as f64;
    (n - ORDER_PENALTY * k) / n
}

/// Relevance of a stack.
///
/// `positions` are the index positions of the matched segments in query order;
/// `min_relev` is the weakest posting relevance among them.
pub fn relevance(matched_tokens: usize, total_tokens: usize, positions: &[usize], min_relev: f64) -> f64 {
    coverage(matched_tokens, total_tokens) * order_factor(positions) * min_relev
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;
    use rstest::rstest;

    #[rstest]
    #[case(&[2, 1], 0)]
    #[case(&[1, 2], 0)]
    #[case(&[3, 1, 2], 1)]
    #[case(&[1, 3, 2], 1)]
    #[case(&[0, 1, 2, 3], 0)]
    #[case(&[3, 2, 1, 0], 0)]
    #[case(&[2, 0, 3, 1], 3)]
    #[case(&[4], 0)]
    fn test_order_inversions(#[case] positions: &[usize], #[case] expected: usize) {
        check!(order_inversions(positions) == expected);
    }

    #[test]
    fn test_mixed_order_relevance() {
        // address, region, place
        check!(relevance(7, 7, &[3, 1, 2], 1.0) == 0.7666666666666666);
    }

    #[rstest]
    #[case(&[2, 1])]
    #[case(&[1, 2])]
    #[case(&[0, 1, 2, 3])]
    fn test_monotonic_order_is_full_relevance(#[case] positions: &[usize]) {
        check!(relevance(4, 4, positions, 1.0) == 1.0);
    }

    #[test]
    fn test_coverage_and_relev() {
        check!(coverage(0, 0) == 0.0);
        check!(coverage(3, 4) == 0.75);
        check!(relevance(2, 4, &[1], 0.8) == 0.4);
    }
}
