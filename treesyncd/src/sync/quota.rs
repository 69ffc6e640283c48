use thiserror::Error;
use treesync_core::{ResourceStats, FOLDER_KIND};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error(
        "quota exceeded: {current} resources with a change of {delta} would reach {result}, limit is {limit}"
    )]
    Exceeded {
        current: u64,
        delta: i64,
        result: i64,
        limit: u64,
    },
}

/// Pre-flight check, run once before changes are applied and never re-checked
/// mid-run. Enforced only while the store reports an active quota-exceeded
/// signal; a limit of zero means unlimited. Folder-kind counts are structural
/// and stay out of the arithmetic.
pub fn check_quota(net_change: i64, stats: &ResourceStats, limit: u64) -> Result<(), QuotaError> {
    if !stats.quota_exceeded || limit == 0 {
        return Ok(());
    }
    let current: u64 = stats
        .items
        .iter()
        .filter(|item| item.kind != FOLDER_KIND)
        .map(|item| item.count)
        .sum();
    let result = current as i64 + net_change;
    if result > limit as i64 {
        return Err(QuotaError::Exceeded {
            current,
            delta: net_change,
            result,
            limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use treesync_core::{ResourceCount, FOLDER_GROUP};

    fn stats(quota_exceeded: bool, counts: &[(&str, &str, u64)]) -> ResourceStats {
        ResourceStats {
            quota_exceeded,
            items: counts
                .iter()
                .map(|(group, kind, count)| ResourceCount {
                    group: (*group).to_string(),
                    kind: (*kind).to_string(),
                    count: *count,
                })
                .collect(),
        }
    }

    #[test]
    fn allows_reaching_the_limit_exactly() {
        let stats = stats(true, &[("default", "report", 90)]);
        assert_eq!(check_quota(10, &stats, 100), Ok(()));
    }

    #[test]
    fn rejects_crossing_the_limit_and_names_the_numbers() {
        let stats = stats(true, &[("default", "report", 90)]);
        let err = check_quota(11, &stats, 100).unwrap_err();
        let message = err.to_string();
        for needle in ["90", "11", "101", "100"] {
            assert!(message.contains(needle), "missing {needle} in {message}");
        }
    }

    #[test]
    fn folder_counts_are_excluded() {
        let stats = stats(
            true,
            &[("default", "report", 90), (FOLDER_GROUP, "folder", 50)],
        );
        assert_eq!(check_quota(10, &stats, 100), Ok(()));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let stats = stats(true, &[("default", "report", 1_000)]);
        assert_eq!(check_quota(500, &stats, 0), Ok(()));
    }

    #[test]
    fn inactive_signal_skips_enforcement() {
        let stats = stats(false, &[("default", "report", 1_000)]);
        assert_eq!(check_quota(500, &stats, 100), Ok(()));
    }

    #[test]
    fn deletions_relieve_pressure() {
        let stats = stats(true, &[("default", "report", 120)]);
        assert_eq!(check_quota(-30, &stats, 100), Ok(()));
    }
}
