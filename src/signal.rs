//! Oversold-recovery entry signal
//!
//! Fires when the oscillator closes back above the oversold threshold after
//! having been strictly below it within the recent lookback.

use crate::error::TradingError;
use crate::types::OscillatorSeries;

/// Minimum readings: current, previous and at least two priors
pub const MIN_READINGS: usize = 4;

/// Readings before `previous` that may show the dip
pub const PRIOR_WINDOW: usize = 3;

/// Decide whether to enter on the latest reading.
///
/// With `current` the last reading and `previous` the one before it, the
/// signal holds when `current >= threshold`, `previous <= threshold`, and at
/// least one of the up-to-three readings before `previous` is strictly below
/// the threshold.
pub fn should_buy(series: &OscillatorSeries, threshold: f64) -> Result<bool, TradingError> {
    let readings = series.readings();
    if readings.len() < MIN_READINGS {
        return Err(TradingError::InsufficientData {
            required: MIN_READINGS,
            available: readings.len(),
        });
    }

    let n = readings.len();
    let current = readings[n - 1];
    let previous = readings[n - 2];
    let priors = &readings[(n - 2).saturating_sub(PRIOR_WINDOW)..n - 2];

    Ok(current >= threshold && previous <= threshold && priors.iter().any(|&p| p < threshold))
}
