//! Named rating configurations
//!
//! A [`RatingProfile`] bundles the ranges and slopes for one metric so they
//! can live in configuration instead of at call sites:
//!
//! ```toml
//! [ratings.temperature]
//! curve = "s_curve"
//! optimal = [20.0, 25.0]
//! slope_above = 0.5
//! slope_below = 0.8
//!
//! [ratings.lux]
//! curve = "linear"
//! optimal = [300.0, 500.0]
//! full = [0.0, 1000.0]
//! ```

use serde::{Deserialize, Serialize};

use crate::rating::{linear_rating, s_curve_rating};
use crate::{RatingError, RatingResult};

/// Which curve a profile rates with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Curve {
    #[default]
    SCurve,
    Linear,
}

/// Ranges and slopes for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingProfile {
    #[serde(default)]
    pub curve: Curve,
    pub optimal: (f64, f64),
    #[serde(default)]
    pub full: Option<(f64, f64)>,
    #[serde(default = "default_slope")]
    pub slope_above: f64,
    #[serde(default = "default_slope")]
    pub slope_below: f64,
}

fn default_slope() -> f64 {
    0.5
}

impl RatingProfile {
    /// S-curve profile with symmetric slope
    pub fn s_curve(optimal: (f64, f64), slope: f64) -> Self {
        Self {
            curve: Curve::SCurve,
            optimal,
            full: None,
            slope_above: slope,
            slope_below: slope,
        }
    }

    /// Linear profile
    pub fn linear(optimal: (f64, f64), full: (f64, f64)) -> Self {
        Self {
            curve: Curve::Linear,
            optimal,
            full: Some(full),
            slope_above: default_slope(),
            slope_below: default_slope(),
        }
    }

    /// Set side-specific slopes
    pub fn with_slopes(mut self, above: f64, below: f64) -> Self {
        self.slope_above = above;
        self.slope_below = below;
        self
    }

    /// Rate a reading with the configured curve
    pub fn rate(&self, value: f64) -> RatingResult<f64> {
        match self.curve {
            Curve::SCurve => s_curve_rating(value, self.optimal, self.slope_above, self.slope_below),
            Curve::Linear => {
                let full = self.full.ok_or(RatingError::MissingFullRange)?;
                linear_rating(value, self.optimal, full)
            }
        }
    }

    /// Check the configuration without rating anything
    pub fn validate(&self) -> RatingResult<()> {
        let midpoint = (self.optimal.0 + self.optimal.1) / 2.0;
        self.rate(midpoint).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_dispatches_to_curve() {
        let temp = RatingProfile::s_curve((20.0, 25.0), 0.5);
        assert_eq!(temp.rate(22.0), Ok(5.0));
        assert!(temp.rate(30.0).unwrap() < 1.0);

        let lux = RatingProfile::linear((300.0, 500.0), (0.0, 1000.0));
        assert_eq!(lux.rate(150.0), Ok(2.5));
    }

    #[test]
    fn linear_without_full_range() {
        let mut profile = RatingProfile::s_curve((1.0, 2.0), 0.5);
        profile.curve = Curve::Linear;
        assert_eq!(profile.validate(), Err(RatingError::MissingFullRange));
    }

    #[test]
    fn validate_catches_inverted_range() {
        let profile = RatingProfile::s_curve((25.0, 20.0), 0.5);
        assert!(matches!(
            profile.validate(),
            Err(RatingError::InvertedRange { .. })
        ));
    }

    #[test]
    fn deserialize_from_json() {
        let profile: RatingProfile = serde_json::from_str(
            r#"{"curve":"linear","optimal":[300.0,500.0],"full":[0.0,1000.0]}"#,
        )
        .unwrap();
        assert_eq!(profile, RatingProfile::linear((300.0, 500.0), (0.0, 1000.0)));

        let profile: RatingProfile =
            serde_json::from_str(r#"{"optimal":[20.0,25.0],"slope_above":0.2}"#).unwrap();
        assert_eq!(profile.curve, Curve::SCurve);
        assert_eq!(profile.slope_above, 0.2);
        assert_eq!(profile.slope_below, 0.5);
    }
}
