//! One-to-one descriptor matching against the enrolled identity.

use crate::types::{Descriptor, EnrolledIdentity};

/// Euclidean distance below which two descriptors are the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of comparing one live descriptor with the enrollment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub is_match: bool,
    /// Euclidean distance to the enrolled descriptor; infinite when nothing is enrolled.
    pub distance: f32,
}

impl MatchResult {
    pub const NO_ENROLLMENT: MatchResult = MatchResult {
        is_match: false,
        distance: f32::INFINITY,
    };
}

/// Strategy for comparing a live descriptor against the (optional) enrollment.
pub trait Matcher {
    fn compare(&self, probe: &Descriptor, enrolled: Option<&EnrolledIdentity>) -> MatchResult;
}

/// Strict `distance < threshold` matcher.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, enrolled: Option<&EnrolledIdentity>) -> MatchResult {
        let Some(identity) = enrolled else {
            return MatchResult::NO_ENROLLMENT;
        };

        let distance = probe.euclidean_distance(&identity.descriptor);
        MatchResult {
            is_match: distance < self.threshold,
            distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DESCRIPTOR_DIM;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn descriptor_with(first: f32) -> Descriptor {
        let mut values = vec![0.0; DESCRIPTOR_DIM];
        values[0] = first;
        Descriptor::new(values).unwrap()
    }

    fn enrolled() -> EnrolledIdentity {
        EnrolledIdentity::new("reference", descriptor_with(0.0))
    }

    #[rstest]
    #[case(0.0, true)]
    #[case(0.59, true)]
    #[case(0.61, false)]
    #[case(1.4, false)]
    fn test_threshold_boundary(#[case] offset: f32, #[case] expected: bool) {
        let identity = enrolled();
        let result = EuclideanMatcher::default().compare(&descriptor_with(offset), Some(&identity));
        assert_eq!(result.is_match, expected, "distance {offset}");
        assert_relative_eq!(result.distance, offset);
    }

    #[test]
    fn test_no_enrollment_never_matches() {
        let matcher = EuclideanMatcher::default();
        for offset in [0.0, 0.3, 5.0] {
            let result = matcher.compare(&descriptor_with(offset), None);
            assert!(!result.is_match);
            assert!(result.distance.is_infinite());
        }
    }

    #[test]
    fn test_custom_threshold() {
        let identity = enrolled();
        let strict = EuclideanMatcher::new(0.4);
        assert!(!strict.compare(&descriptor_with(0.5), Some(&identity)).is_match);
        assert!(strict.compare(&descriptor_with(0.3), Some(&identity)).is_match);
    }
}
