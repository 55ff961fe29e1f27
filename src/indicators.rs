//! Technical indicators
//!
//! RSI over candle closes, backed by the `ta` crate.

use ta::indicators::RelativeStrengthIndex;
use ta::Next;

use crate::types::OscillatorSeries;

/// Calculate Wilder's RSI using the ta crate.
///
/// Wilder smooths gains and losses with alpha = 1/period. The ta crate's RSI
/// uses a standard EMA with alpha = 2/(n+1), so it is built with
/// n = 2*period - 1 to get the same smoothing. The first `period` closes only
/// warm the averages up and yield `None`.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(2 * period - 1) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let rsi_val = indicator.next(value);
            if i >= period {
                Some(rsi_val)
            } else {
                None
            }
        })
        .collect()
}

/// RSI readings for a close series, oldest first, warm-up dropped
pub fn rsi_series(closes: &[f64], period: usize) -> OscillatorSeries {
    OscillatorSeries::new(rsi(closes, period).into_iter().flatten().collect())
}
