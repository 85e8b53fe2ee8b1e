//! Trend and failure-frequency computations shared by both stores.
//!
//! Stores scan newest-first (descending insertion id); the helpers here turn
//! such scans into the shapes callers expect.

use std::collections::HashMap;

use crate::storage::types::FailureStat;

/// Upper bound applied to every window or page size.
pub const MAX_LIMIT: u32 = 10_000;

/// Clamp a caller-supplied limit into `0..=MAX_LIMIT`.
pub fn clamp_limit(limit: u32) -> u32 {
    limit.min(MAX_LIMIT)
}

/// Reverse a newest-first scan into chronological (oldest-first) order.
pub fn chronological<T>(mut newest_first: Vec<T>) -> Vec<T> {
    newest_first.reverse();
    newest_first
}

/// Count failure occurrences per `nodeid` and rank them.
///
/// Sorted by descending count; ties are broken by `nodeid` so the output is
/// deterministic.
pub fn rank_failures<I, S>(nodeids: I) -> Vec<FailureStat>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut counter: HashMap<String, u64> = HashMap::new();
    for nodeid in nodeids {
        *counter.entry(nodeid.into()).or_default() += 1;
    }

    let mut stats: Vec<FailureStat> = counter
        .into_iter()
        .map(|(nodeid, fail_count)| FailureStat { nodeid, fail_count })
        .collect();
    stats.sort_by(|a, b| {
        b.fail_count
            .cmp(&a.fail_count)
            .then_with(|| a.nodeid.cmp(&b.nodeid))
    });
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chronological_reverses_scan() {
        assert_eq!(chronological(vec!["C", "B", "A"]), vec!["A", "B", "C"]);
        assert!(chronological(Vec::<u8>::new()).is_empty());
    }

    #[test]
    fn test_rank_failures_orders_by_count() {
        let stats = rank_failures(["b", "a", "x", "x", "a", "x"]);
        assert_eq!(
            stats,
            vec![
                FailureStat { nodeid: "x".into(), fail_count: 3 },
                FailureStat { nodeid: "a".into(), fail_count: 2 },
                FailureStat { nodeid: "b".into(), fail_count: 1 },
            ]
        );
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(5), 5);
        assert_eq!(clamp_limit(u32::MAX), MAX_LIMIT);
    }
}
