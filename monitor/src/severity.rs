//! Threshold classification

use crate::model::{Level, ThresholdSet};

/// Highest tier whose floor `value` meets, or `None` when no floor is met.
pub fn classify(value: u64, thresholds: &ThresholdSet) -> Option<Level> {
    let meets = |floor: Option<u64>| floor.map_or(false, |floor| value >= floor);

    if meets(thresholds.critical) {
        Some(Level::Critical)
    } else if meets(thresholds.warning) {
        Some(Level::Warning)
    } else if meets(thresholds.info) {
        Some(Level::Info)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classify_warning_and_critical_only() {
        let set = ThresholdSet::new(None, Some(500), Some(2000));
        assert_eq!(classify(2500, &set), Some(Level::Critical));
        assert_eq!(classify(600, &set), Some(Level::Warning));
        assert_eq!(classify(100, &set), None);
    }

    #[test]
    fn test_floors_are_inclusive() {
        let set = ThresholdSet::new(Some(100), Some(500), Some(2000));
        assert_eq!(classify(100, &set), Some(Level::Info));
        assert_eq!(classify(500, &set), Some(Level::Warning));
        assert_eq!(classify(2000, &set), Some(Level::Critical));
        assert_eq!(classify(99, &set), None);
    }

    #[test]
    fn test_empty_set_never_matches() {
        assert_eq!(classify(u64::MAX, &ThresholdSet::default()), None);
    }

    proptest! {
        #[test]
        fn classification_is_monotonic(a in 0u64..50_000, b in 0u64..50_000) {
            let set = ThresholdSet::new(Some(1000), Some(3000), Some(10000));
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(classify(lo, &set) <= classify(hi, &set));
        }
    }
}
