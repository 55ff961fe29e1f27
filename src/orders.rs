//! Entry and exit order sizing
//!
//! Pure arithmetic on `Money`: prices and sizes are snapped to the product's
//! increments and checked against its minimum order size.

use tracing::debug;

use crate::config::ExitTier;
use crate::error::TradingError;
use crate::types::{Money, OrderParams, ProductIncrements};

const HUNDRED: i64 = 100;

/// Size the entry BUY for a fixed quote spend.
///
/// The limit price is the reference price floored to the price increment and
/// the size is `spend / price` floored to the base increment.
pub fn size_entry_order(
    quote_spend: Money,
    reference_price: Money,
    increments: &ProductIncrements,
) -> Result<OrderParams, TradingError> {
    let price = reference_price.floor_to(increments.price_increment);
    if !price.is_positive() {
        return Err(TradingError::OrderTooSmall(format!(
            "reference price {} floors to {}",
            reference_price, price
        )));
    }

    let size = (quote_spend / price).floor_to(increments.base_increment);
    if size.is_zero() || size < increments.min_order_size {
        return Err(TradingError::OrderTooSmall(format!(
            "entry size {} below minimum {}",
            size, increments.min_order_size
        )));
    }

    Ok(OrderParams { price, size })
}

/// Size one exit order per tier.
///
/// Prices round up so rounding never eats into the target profit. Sizes round
/// down, except the last tier which takes whatever the earlier tiers left, so
/// the sizes always add up to exactly `fill_size`.
pub fn size_exit_orders(
    fill_price: Money,
    fill_size: Money,
    tiers: &[ExitTier],
    increments: &ProductIncrements,
) -> Result<Vec<OrderParams>, TradingError> {
    if tiers.is_empty() {
        return Err(TradingError::Config("no exit tiers".to_string()));
    }

    let mut orders = Vec::with_capacity(tiers.len());
    let mut allocated = Money::ZERO;
    let last = tiers.len() - 1;

    for (i, tier) in tiers.iter().enumerate() {
        let price = tier_price(fill_price, tier.profit_pct, increments.price_increment);
        let size = if i == last {
            fill_size - allocated
        } else {
            (fill_size * tier.portion).floor_to(increments.base_increment)
        };

        if !size.is_positive() || size < increments.min_order_size {
            return Err(TradingError::OrderTooSmall(format!(
                "tier {} size {} below minimum {}",
                i, size, increments.min_order_size
            )));
        }

        allocated += size;
        orders.push(OrderParams { price, size });
    }

    Ok(orders)
}

/// Drop non-last tiers whose floored size would be under the minimum and fold
/// their portion into the last tier.
///
/// The last tier sells whatever the kept tiers leave. When that remainder is
/// itself under the minimum, the last tier is folded back into the tier before
/// it, which keeps its own profit target.
pub fn merge_undersized_tiers(
    fill_size: Money,
    tiers: &[ExitTier],
    increments: &ProductIncrements,
) -> Vec<ExitTier> {
    let Some((last, rest)) = tiers.split_last() else {
        return Vec::new();
    };

    let floored = |tier: &ExitTier| (fill_size * tier.portion).floor_to(increments.base_increment);
    let too_small = |size: Money| !size.is_positive() || size < increments.min_order_size;

    let mut kept = Vec::with_capacity(tiers.len());
    let mut folded = Money::ZERO;
    let mut allocated = Money::ZERO;
    for (i, tier) in rest.iter().enumerate() {
        let size = floored(tier);
        if too_small(size) {
            debug!(
                "tier {} size {} below minimum {}, folding into last tier",
                i, size, increments.min_order_size
            );
            folded += tier.portion;
        } else {
            allocated += size;
            kept.push(*tier);
        }
    }

    let mut last = ExitTier::new(last.profit_pct, last.portion + folded);
    while too_small(fill_size - allocated) {
        let Some(prev) = kept.pop() else {
            break;
        };
        debug!(
            "last tier remainder {} below minimum {}, folding into the {}% tier",
            fill_size - allocated,
            increments.min_order_size,
            prev.profit_pct
        );
        allocated -= floored(&prev);
        last = ExitTier::new(prev.profit_pct, prev.portion + last.portion);
    }
    kept.push(last);
    kept
}

fn tier_price(fill_price: Money, profit_pct: Money, increment: Money) -> Money {
    let factor = Money::ONE + profit_pct / Money::from_i64(HUNDRED);
    (fill_price * factor).ceil_to(increment)
}
