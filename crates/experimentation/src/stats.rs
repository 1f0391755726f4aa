//! Normal CDF and the two-proportion z-test used to call A/B winners.

use serde::{Deserialize, Serialize};

/// Abramowitz-Stegun 7.1.26 coefficients.
const A1: f64 = 0.254829592;
const A2: f64 = -0.284496736;
const A3: f64 = 1.421413741;
const A4: f64 = -1.453152027;
const A5: f64 = 1.061405429;
const P: f64 = 0.3275911;

/// Standard normal CDF, accurate to about 1.5e-7.
pub fn normal_cdf(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    0.5 * (1.0 + sign * y)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ZTest {
    pub z: f64,
    /// `normal_cdf(z)`; zero for degenerate inputs.
    pub confidence: f64,
}

/// Compare two observed rates. Degenerate inputs (an empty sample, a pooled
/// proportion of 0 or 1, a zero standard error) give a zero result.
pub fn two_proportion_z_test(p1: f64, n1: u64, p2: f64, n2: u64) -> ZTest {
    if n1 == 0 || n2 == 0 || !p1.is_finite() || !p2.is_finite() {
        return ZTest::default();
    }
    let (n1, n2) = (n1 as f64, n2 as f64);
    let pooled = (p1 * n1 + p2 * n2) / (n1 + n2);
    if pooled <= 0.0 || pooled >= 1.0 {
        return ZTest::default();
    }
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if !se.is_finite() || se <= 0.0 {
        return ZTest::default();
    }
    let z = (p1 - p2).abs() / se;
    ZTest {
        z,
        confidence: normal_cdf(z),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cdf_reference_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-8);
        assert!((normal_cdf(1.0) - 0.8413447361676363).abs() < 1e-12);
        assert!((normal_cdf(-1.0) - 0.15865526383236372).abs() < 1e-12);
        assert!((normal_cdf(1.959964) - 0.975).abs() < 1e-6);
    }

    #[test]
    fn test_hand_computed_conversion_test() {
        // 120/1000 vs 80/1000: pooled 0.1, SE 0.0134164...
        let result = two_proportion_z_test(120.0 / 1000.0, 1000, 80.0 / 1000.0, 1000);
        assert!((result.z - 2.9814239699997187).abs() < 1e-9);
        assert!((result.confidence - 0.9985653744987693).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_inputs_are_zero() {
        assert_eq!(two_proportion_z_test(0.1, 0, 0.2, 100), ZTest::default());
        assert_eq!(two_proportion_z_test(0.0, 100, 0.0, 100), ZTest::default());
        assert_eq!(two_proportion_z_test(1.0, 100, 1.0, 100), ZTest::default());
        assert_eq!(two_proportion_z_test(f64::NAN, 100, 0.2, 100), ZTest::default());
        assert_eq!(normal_cdf(f64::NAN), 0.0);
    }

    #[test]
    fn test_equal_rates() {
        let result = two_proportion_z_test(0.3, 500, 0.3, 500);
        assert_eq!(result.z, 0.0);
        assert!((result.confidence - 0.5).abs() < 1e-8);
    }

    proptest! {
        #[test]
        fn property_cdf_monotone_for_non_negative_z(a in 0.0f64..8.0, b in 0.0f64..8.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(normal_cdf(lo) <= normal_cdf(hi));
            prop_assert!(normal_cdf(hi) <= 1.0);
        }
    }
}
