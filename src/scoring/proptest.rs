//! Property-based tests for the CIAR scorer.
//!
//! - scores are non-negative and bounded by `1 + max_recency_boost`
//! - scores never increase with age (other inputs fixed)
//! - scores never increase with time since last access (other inputs fixed)
//! - identical inputs give identical outputs

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    use crate::scoring::CiarScorer;

    fn factor() -> impl Strategy<Value = f64> {
        prop_oneof![Just(0.0), Just(1.0), 0.0f64..=1.0f64]
    }

    // Up to ~3 years, in seconds
    fn span() -> impl Strategy<Value = i64> {
        0i64..100_000_000i64
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    proptest! {
        /// Score is non-negative and bounded.
        #[test]
        fn score_is_bounded(
            c in factor(),
            i in factor(),
            k in factor(),
            age in span(),
            since in proptest::option::of(span()),
        ) {
            let scorer = CiarScorer::default();
            let now = now();
            let created = now - Duration::seconds(age);
            let accessed = since.map(|s| now - Duration::seconds(s));

            let score = scorer.score(c, i, k, created, accessed, now).unwrap();
            prop_assert!(score.value >= 0.0, "score {} should be >= 0", score.value);
            prop_assert!(
                score.value <= scorer.max_score() + 1e-12,
                "score {} exceeds bound {}",
                score.value,
                scorer.max_score()
            );
        }

        /// Older items never score higher.
        #[test]
        fn score_non_increasing_in_age(
            c in factor(),
            i in factor(),
            k in factor(),
            age in span(),
            extra in span(),
            since in proptest::option::of(span()),
        ) {
            let scorer = CiarScorer::default();
            let now = now();
            let accessed = since.map(|s| now - Duration::seconds(s));

            let younger = scorer
                .score(c, i, k, now - Duration::seconds(age), accessed, now)
                .unwrap();
            let older = scorer
                .score(c, i, k, now - Duration::seconds(age + extra), accessed, now)
                .unwrap();
            prop_assert!(
                older.value <= younger.value + 1e-12,
                "older {} > younger {}",
                older.value,
                younger.value
            );
        }

        /// Items read longer ago never score higher.
        #[test]
        fn score_non_increasing_in_time_since_access(
            c in factor(),
            i in factor(),
            k in factor(),
            age in span(),
            since in span(),
            extra in span(),
        ) {
            let scorer = CiarScorer::default();
            let now = now();
            let created = now - Duration::seconds(age);

            let recent = scorer
                .score(c, i, k, created, Some(now - Duration::seconds(since)), now)
                .unwrap();
            let stale = scorer
                .score(c, i, k, created, Some(now - Duration::seconds(since + extra)), now)
                .unwrap();
            prop_assert!(
                stale.value <= recent.value + 1e-12,
                "stale {} > recent {}",
                stale.value,
                recent.value
            );
        }

        /// Same inputs, same output.
        #[test]
        fn score_is_deterministic(
            c in factor(),
            i in factor(),
            k in factor(),
            age in span(),
        ) {
            let scorer = CiarScorer::default();
            let now = now();
            let created = now - Duration::seconds(age);
            let a = scorer.score(c, i, k, created, None, now).unwrap();
            let b = scorer.score(c, i, k, created, None, now).unwrap();
            prop_assert_eq!(a, b);
        }

        /// Factors outside [0, 1] are always rejected.
        #[test]
        fn out_of_range_factor_is_rejected(bad in prop_oneof![-10.0f64..-0.001, 1.001f64..10.0]) {
            let scorer = CiarScorer::default();
            let now = now();
            prop_assert!(scorer.score(bad, 0.5, 0.5, now, None, now).is_err());
            prop_assert!(scorer.score(0.5, bad, 0.5, now, None, now).is_err());
            prop_assert!(scorer.score(0.5, 0.5, bad, now, None, now).is_err());
        }
    }
}
