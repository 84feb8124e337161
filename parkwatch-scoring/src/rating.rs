//! S-curve and linear rating functions

use crate::{RatingError, RatingResult};

/// Score for a reading inside the optimal range
pub const MAX_RATING: f64 = 5.0;

/// Logistic-decay rating
///
/// `slope_above` applies when `value` exceeds `optimal.1`, `slope_below`
/// when it falls short of `optimal.0`.
pub fn s_curve_rating(
    value: f64,
    optimal: (f64, f64),
    slope_above: f64,
    slope_below: f64,
) -> RatingResult<f64> {
    finite(value, "value")?;
    check_range(optimal)?;
    check_slope(slope_above)?;
    check_slope(slope_below)?;

    let (lo, hi) = optimal;
    let (slope, distance) = if value > hi {
        (slope_above, value - hi)
    } else if value < lo {
        (slope_below, lo - value)
    } else {
        return Ok(MAX_RATING);
    };

    Ok(MAX_RATING * 2.0 / (1.0 + libm::exp(slope * distance)))
}

/// Piecewise-linear rating, 0 at the edges of `full`
pub fn linear_rating(value: f64, optimal: (f64, f64), full: (f64, f64)) -> RatingResult<f64> {
    finite(value, "value")?;
    check_range(optimal)?;
    check_range(full)?;

    if optimal.0 < full.0 || optimal.1 > full.1 {
        return Err(RatingError::NotContained {
            optimal_lo: optimal.0,
            optimal_hi: optimal.1,
            full_lo: full.0,
            full_hi: full.1,
        });
    }

    let rating = if value < optimal.0 {
        if value <= full.0 {
            0.0
        } else {
            MAX_RATING * (value - full.0) / (optimal.0 - full.0)
        }
    } else if value > optimal.1 {
        if value >= full.1 {
            0.0
        } else {
            MAX_RATING * (full.1 - value) / (full.1 - optimal.1)
        }
    } else {
        MAX_RATING
    };

    Ok(rating.clamp(0.0, MAX_RATING))
}

fn finite(value: f64, what: &'static str) -> RatingResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RatingError::NonFinite(what))
    }
}

fn check_range((lo, hi): (f64, f64)) -> RatingResult<()> {
    finite(lo, "range bound")?;
    finite(hi, "range bound")?;
    if lo > hi {
        return Err(RatingError::InvertedRange { lo, hi });
    }
    Ok(())
}

fn check_slope(slope: f64) -> RatingResult<()> {
    if !slope.is_finite() || slope < 0.0 {
        return Err(RatingError::InvalidSlope(slope));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s_curve_inside_range() {
        assert_eq!(s_curve_rating(22.0, (20.0, 25.0), 0.5, 0.5), Ok(5.0));
        assert_eq!(s_curve_rating(20.0, (20.0, 25.0), 0.5, 0.5), Ok(5.0));
        assert_eq!(s_curve_rating(25.0, (20.0, 25.0), 0.5, 0.5), Ok(5.0));
    }

    #[test]
    fn s_curve_decays_above() {
        let at_30 = s_curve_rating(30.0, (20.0, 25.0), 0.5, 0.5).unwrap();
        let at_35 = s_curve_rating(35.0, (20.0, 25.0), 0.5, 0.5).unwrap();
        let at_40 = s_curve_rating(40.0, (20.0, 25.0), 0.5, 0.5).unwrap();

        assert!(at_30 < 5.0);
        assert!(at_35 < at_30);
        assert!(at_40 < at_35);
        assert!(at_40 > 0.0);

        // 5 · 2 / (1 + e^2.5)
        assert!((at_30 - 0.7586).abs() < 1e-3);
    }

    #[test]
    fn s_curve_uses_side_specific_slope() {
        let cold = s_curve_rating(15.0, (20.0, 25.0), 0.1, 1.0).unwrap();
        let warm = s_curve_rating(30.0, (20.0, 25.0), 0.1, 1.0).unwrap();
        assert!(warm > cold);
    }

    #[test]
    fn s_curve_zero_slope_is_flat() {
        assert_eq!(s_curve_rating(100.0, (20.0, 25.0), 0.0, 0.0), Ok(5.0));
    }

    #[test]
    fn s_curve_rejects_bad_config() {
        assert_eq!(
            s_curve_rating(22.0, (25.0, 20.0), 0.5, 0.5),
            Err(RatingError::InvertedRange { lo: 25.0, hi: 20.0 })
        );
        assert_eq!(
            s_curve_rating(22.0, (20.0, 25.0), -0.5, 0.5),
            Err(RatingError::InvalidSlope(-0.5))
        );
        assert!(s_curve_rating(f64::NAN, (20.0, 25.0), 0.5, 0.5).is_err());
    }

    #[test]
    fn linear_inside_and_edges() {
        for value in [20.0, 22.5, 25.0] {
            assert_eq!(linear_rating(value, (20.0, 25.0), (0.0, 30.0)), Ok(5.0));
        }
        assert_eq!(linear_rating(0.0, (20.0, 25.0), (0.0, 30.0)), Ok(0.0));
        assert_eq!(linear_rating(30.0, (20.0, 25.0), (0.0, 30.0)), Ok(0.0));
        assert_eq!(linear_rating(-10.0, (20.0, 25.0), (0.0, 30.0)), Ok(0.0));
        assert_eq!(linear_rating(45.0, (20.0, 25.0), (0.0, 30.0)), Ok(0.0));
    }

    #[test]
    fn linear_interpolates() {
        assert_eq!(linear_rating(10.0, (20.0, 25.0), (0.0, 30.0)), Ok(2.5));
        assert_eq!(linear_rating(27.5, (20.0, 25.0), (0.0, 30.0)), Ok(2.5));
    }

    #[test]
    fn linear_optimal_touching_full() {
        assert_eq!(linear_rating(-1.0, (0.0, 25.0), (0.0, 30.0)), Ok(0.0));
        assert_eq!(linear_rating(0.0, (0.0, 25.0), (0.0, 30.0)), Ok(5.0));
    }

    #[test]
    fn linear_rejects_bad_config() {
        assert!(matches!(
            linear_rating(10.0, (20.0, 35.0), (0.0, 30.0)),
            Err(RatingError::NotContained { .. })
        ));
        assert!(matches!(
            linear_rating(10.0, (25.0, 20.0), (0.0, 30.0)),
            Err(RatingError::InvertedRange { .. })
        ));
        assert!(matches!(
            linear_rating(10.0, (20.0, 25.0), (30.0, 0.0)),
            Err(RatingError::InvertedRange { .. })
        ));
    }
}
