//! Rating Normalization for Sensor Readings
//!
//! ## Overview
//!
//! Parking spots are ranked partly on environmental comfort: temperature,
//! humidity, CO2, light. Each raw reading is mapped to a score in `0.0..=5.0`
//! so readings with different units can be averaged or compared.
//!
//! ## Curves
//!
//! ### S-Curve (logistic decay)
//!
//! Full marks inside the optimal range; outside it the score follows a
//! logistic decay on the distance past the nearer bound:
//! ```text
//! rating = 5 · 2 / (1 + e^(slope · distance))
//! ```
//! At the boundary `distance = 0` and the rating is exactly 5. Separate slopes
//! for each side let "a bit too warm" be forgiven more than "a bit too cold".
//!
//! ### Linear
//!
//! Full marks inside the optimal range, falling linearly to 0 at the edges of
//! the full range, and clamped at 0 beyond it:
//! ```text
//!   5 ┤      ┌────┐
//!     │     ╱      ╲
//!   0 ┼────┘        └────
//!     full.lo  opt   full.hi
//! ```
//!
//! ## Errors
//!
//! Both curves are pure functions. A bad configuration (inverted range,
//! optimal range sticking out of the full range, negative slope) is reported
//! as a [`RatingError`], never a panic.
//!
//! ## Example
//!
//! ```rust
//! use parkwatch_scoring::{linear_rating, s_curve_rating};
//!
//! let comfort = s_curve_rating(22.0, (20.0, 25.0), 0.5, 0.8)?;
//! assert_eq!(comfort, 5.0);
//!
//! let light = linear_rating(10.0, (20.0, 25.0), (0.0, 30.0))?;
//! assert_eq!(light, 2.5);
//! # Ok::<(), parkwatch_scoring::RatingError>(())
//! ```

#![deny(unsafe_code)]

pub mod profile;
pub mod rating;

pub use profile::{Curve, RatingProfile};
pub use rating::{linear_rating, s_curve_rating, MAX_RATING};

use thiserror::Error;

/// Result type for rating operations
pub type RatingResult<T> = Result<T, RatingError>;

/// Range-configuration errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RatingError {
    #[error("Range [{lo}, {hi}] is inverted")]
    InvertedRange { lo: f64, hi: f64 },

    #[error("Optimal range [{optimal_lo}, {optimal_hi}] is not contained in full range [{full_lo}, {full_hi}]")]
    NotContained {
        optimal_lo: f64,
        optimal_hi: f64,
        full_lo: f64,
        full_hi: f64,
    },

    #[error("Slope must be finite and non-negative, got {0}")]
    InvalidSlope(f64),

    #[error("Non-finite input: {0}")]
    NonFinite(&'static str),

    #[error("Linear curve requires a full range")]
    MissingFullRange,
}
