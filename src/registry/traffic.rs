//! Traffic policy — weighted primary split plus independent shadow fan-out

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, ServeError};

/// Tolerance on the sum of weights
pub const WEIGHT_EPSILON: f64 = 1e-6;

/// Per-endpoint traffic policy
///
/// Both maps are ordered by backend tag so selection is a pure function of
/// the random draw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficPolicy {
    /// backend tag → weight; sums to 1.0 whenever non-empty
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    /// backend tag → proportion of requests duplicated to it
    #[serde(default)]
    pub shadow: BTreeMap<String, f64>,
}

impl TrafficPolicy {
    /// Build a policy from primary weights, validating the distribution
    pub fn new(weights: BTreeMap<String, f64>) -> Result<Self> {
        validate_weights(&weights)?;
        Ok(Self {
            weights,
            shadow: BTreeMap::new(),
        })
    }

    /// A policy sending all traffic to one backend
    pub fn single(backend: impl Into<String>) -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(backend.into(), 1.0);
        Self {
            weights,
            shadow: BTreeMap::new(),
        }
    }

    /// Replace the primary weights; shadows are left untouched
    pub fn set_weights(&mut self, weights: BTreeMap<String, f64>) -> Result<()> {
        validate_weights(&weights)?;
        self.weights = weights;
        Ok(())
    }

    /// Set or clear (proportion 0) a shadow entry
    pub fn set_shadow(&mut self, backend: &str, proportion: f64) -> Result<()> {
        validate_proportion(proportion)?;
        if self.carries_primary(backend) {
            return Err(ServeError::Conflict(format!(
                "backend '{}' already receives primary traffic for this endpoint",
                backend
            )));
        }
        if proportion == 0.0 {
            self.shadow.remove(backend);
        } else {
            self.shadow.insert(backend.to_string(), proportion);
        }
        Ok(())
    }

    /// Whether a backend receives a non-zero share of primary traffic
    pub fn carries_primary(&self, backend: &str) -> bool {
        self.weights.get(backend).is_some_and(|w| *w > 0.0)
    }

    /// Whether the policy mentions a backend in either map
    pub fn references(&self, backend: &str) -> bool {
        self.weights.contains_key(backend) || self.shadow.contains_key(backend)
    }

    /// Every backend tag mentioned by the policy
    pub fn backends(&self) -> impl Iterator<Item = &String> {
        self.weights.keys().chain(self.shadow.keys())
    }

    /// Select the primary backend for a draw in `[0, 1)`.
    ///
    /// Walks the cumulative distribution in tag order. A draw that lands past
    /// the accumulated total (float rounding) goes to the last positive weight.
    pub fn select(&self, draw: f64) -> Option<&str> {
        let mut cumulative = 0.0;
        let mut last_positive = None;
        for (tag, weight) in &self.weights {
            if *weight <= 0.0 {
                continue;
            }
            cumulative += weight;
            last_positive = Some(tag.as_str());
            if draw < cumulative {
                return last_positive;
            }
        }
        last_positive
    }

    /// Shadow targets chosen for one request, one independent draw per entry
    pub fn select_shadows<F>(&self, mut draw: F) -> Vec<&str>
    where
        F: FnMut() -> f64,
    {
        self.shadow
            .iter()
            .filter(|(_, proportion)| draw() < **proportion)
            .map(|(tag, _)| tag.as_str())
            .collect()
    }
}

/// Check a primary weight map: finite, non-negative, summing to 1.0 ± ε
pub fn validate_weights(weights: &BTreeMap<String, f64>) -> Result<()> {
    if weights.is_empty() {
        return Err(ServeError::Validation(
            "traffic weights must name at least one backend".to_string(),
        ));
    }
    for (tag, weight) in weights {
        if !weight.is_finite() || *weight < 0.0 {
            return Err(ServeError::Validation(format!(
                "weight for backend '{}' must be a non-negative number, got {}",
                tag, weight
            )));
        }
    }
    let total: f64 = weights.values().sum();
    if (total - 1.0).abs() > WEIGHT_EPSILON {
        return Err(ServeError::Validation(format!(
            "traffic weights must sum to 1, currently they sum to {}",
            total
        )));
    }
    Ok(())
}

fn validate_proportion(proportion: f64) -> Result<()> {
    if !proportion.is_finite() || !(0.0..=1.0).contains(&proportion) {
        return Err(ServeError::Validation(format!(
            "shadow proportion must be a number from 0 to 1, got {}",
            proportion
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_single_backend_always_selected() {
        let policy = TrafficPolicy::single("v1");
        for draw in [0.0, 0.3, 0.999_999] {
            assert_eq!(policy.select(draw), Some("v1"));
        }
    }

    #[test]
    fn test_70_30_split_is_deterministic() {
        let policy = TrafficPolicy::new(weights(&[("A", 0.7), ("B", 0.3)])).unwrap();
        for i in 0..1000 {
            let draw = i as f64 / 1000.0;
            let expected = if draw < 0.7 { "A" } else { "B" };
            assert_eq!(policy.select(draw), Some(expected), "draw {}", draw);
        }
    }

    #[test]
    fn test_order_is_lexicographic_not_insertion() {
        let policy = TrafficPolicy::new(weights(&[("zeta", 0.5), ("alpha", 0.5)])).unwrap();
        assert_eq!(policy.select(0.1), Some("alpha"));
        assert_eq!(policy.select(0.6), Some("zeta"));
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let policy =
            TrafficPolicy::new(weights(&[("a", 0.0), ("b", 1.0), ("c", 0.0)])).unwrap();
        for i in 0..100 {
            assert_eq!(policy.select(i as f64 / 100.0), Some("b"));
        }
    }

    #[test]
    fn test_rounding_overflow_goes_to_last_positive() {
        let policy = TrafficPolicy {
            weights: weights(&[("a", 0.5), ("b", 0.4999999), ("c", 0.0)]),
            shadow: BTreeMap::new(),
        };
        assert_eq!(policy.select(0.99999999), Some("b"));
    }

    #[test]
    fn test_empty_policy_selects_nothing() {
        assert_eq!(TrafficPolicy::default().select(0.5), None);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let err = TrafficPolicy::new(weights(&[("a", 0.5), ("b", 0.6)])).unwrap_err();
        assert!(err.to_string().contains("sum to 1"));
        assert!(TrafficPolicy::new(weights(&[("a", 0.1), ("b", 0.2), ("c", 0.7)])).is_ok());
    }

    #[test]
    fn test_weights_reject_negative_and_nan() {
        assert!(TrafficPolicy::new(weights(&[("a", 1.5), ("b", -0.5)])).is_err());
        assert!(TrafficPolicy::new(weights(&[("a", f64::NAN)])).is_err());
        assert!(TrafficPolicy::new(BTreeMap::new()).is_err());
    }

    #[test]
    fn test_set_weights_keeps_shadow() {
        let mut policy = TrafficPolicy::single("a");
        policy.set_shadow("s", 0.2).unwrap();
        policy.set_weights(weights(&[("a", 0.5), ("b", 0.5)])).unwrap();
        assert_eq!(policy.shadow.get("s"), Some(&0.2));
    }

    #[test]
    fn test_failed_set_weights_leaves_policy() {
        let mut policy = TrafficPolicy::single("a");
        assert!(policy.set_weights(weights(&[("b", 0.3)])).is_err());
        assert_eq!(policy, TrafficPolicy::single("a"));
    }

    #[test]
    fn test_shadow_zero_removes_entry() {
        let mut policy = TrafficPolicy::single("a");
        policy.set_shadow("s", 0.5).unwrap();
        assert!(policy.references("s"));
        policy.set_shadow("s", 0.0).unwrap();
        assert!(!policy.references("s"));
        assert!(policy.select_shadows(|| 0.0).is_empty());
    }

    #[test]
    fn test_shadow_conflicts_with_primary() {
        let mut policy = TrafficPolicy::single("a");
        let err = policy.set_shadow("a", 0.5).unwrap_err();
        assert!(matches!(err, ServeError::Conflict(_)));
    }

    #[test]
    fn test_shadow_proportion_range() {
        let mut policy = TrafficPolicy::single("a");
        assert!(policy.set_shadow("s", 1.5).is_err());
        assert!(policy.set_shadow("s", -0.1).is_err());
        assert!(policy.set_shadow("s", 1.0).is_ok());
    }

    #[test]
    fn test_select_shadows_independent_draws() {
        let mut policy = TrafficPolicy::single("a");
        policy.set_shadow("s1", 0.5).unwrap();
        policy.set_shadow("s2", 0.5).unwrap();

        let mut draws = vec![0.4, 0.6].into_iter();
        let chosen = policy.select_shadows(|| draws.next().unwrap());
        assert_eq!(chosen, vec!["s1"]);
    }

    #[test]
    fn test_backends_lists_both_maps() {
        let mut policy = TrafficPolicy::single("a");
        policy.set_shadow("s", 0.1).unwrap();
        let all: Vec<_> = policy.backends().cloned().collect();
        assert_eq!(all, vec!["a".to_string(), "s".to_string()]);
    }
}
