//! Coinbase Advanced Trade request and response shapes
//!
//! Coinbase sends every number as a string, so wire structs keep `String`
//! fields and convert to [`Money`] through the helpers at the bottom.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::exchange::{ExchangeError, ExchangeResult};
use crate::types::{Candle, Money, OrderStatus, Side};

// =============================================================================
// Products and candles
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProductResponse {
    pub product_id: String,
    #[serde(default)]
    pub price: String,
    pub base_increment: String,
    pub quote_increment: String,
    #[serde(default)]
    pub price_increment: Option<String>,
    pub base_min_size: String,
}

impl ProductResponse {
    /// Tick size for limit prices
    pub fn price_tick(&self) -> &str {
        match self.price_increment.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => &self.quote_increment,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandlesResponse {
    #[serde(default)]
    pub candles: Vec<WireCandle>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireCandle {
    /// Unix seconds, as a string
    pub start: String,
    pub low: String,
    pub high: String,
    pub open: String,
    pub close: String,
    pub volume: String,
}

impl WireCandle {
    pub fn to_candle(&self) -> ExchangeResult<Candle> {
        let secs: i64 = self
            .start
            .parse()
            .map_err(|_| ExchangeError::Parse(format!("candle start '{}'", self.start)))?;
        let start = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| ExchangeError::Parse(format!("candle start '{}' out of range", secs)))?;
        Ok(Candle {
            start,
            open: parse_f64("open", &self.open)?,
            high: parse_f64("high", &self.high)?,
            low: parse_f64("low", &self.low)?,
            close: parse_f64("close", &self.close)?,
            volume: parse_f64("volume", &self.volume)?,
        })
    }
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderBody {
    pub client_order_id: String,
    pub product_id: String,
    pub side: Side,
    pub order_configuration: OrderConfiguration,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderConfiguration {
    pub limit_limit_gtc: LimitGtc,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitGtc {
    pub base_size: String,
    pub limit_price: String,
    pub post_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderResponse {
    pub success: bool,
    #[serde(default)]
    pub success_response: Option<CreateOrderSuccess>,
    #[serde(default)]
    pub error_response: Option<CreateOrderFailure>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl CreateOrderResponse {
    /// Best available explanation for a refused order
    pub fn rejection_reason(&self) -> String {
        if let Some(err) = &self.error_response {
            for candidate in [&err.message, &err.preview_failure_reason, &err.error, &err.error_details] {
                if !candidate.is_empty() {
                    return candidate.clone();
                }
            }
        }
        self.failure_reason
            .clone()
            .unwrap_or_else(|| "unspecified failure".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderSuccess {
    pub order_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateOrderFailure {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_details: String,
    #[serde(default)]
    pub preview_failure_reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalOrderResponse {
    pub order: WireOrder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListOrdersResponse {
    #[serde(default)]
    pub orders: Vec<WireOrder>,
    #[serde(default)]
    pub has_next: bool,
    #[serde(default)]
    pub cursor: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireOrder {
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: String,
    pub product_id: String,
    pub side: String,
    pub status: String,
    #[serde(default)]
    pub filled_size: Option<String>,
    #[serde(default)]
    pub average_filled_price: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub order_configuration: Option<serde_json::Value>,
}

impl WireOrder {
    pub fn status(&self) -> OrderStatus {
        map_order_status(&self.status)
    }

    pub fn side(&self) -> ExchangeResult<Side> {
        match self.side.as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(ExchangeError::Parse(format!("order side '{}'", other))),
        }
    }

    pub fn filled_size(&self) -> ExchangeResult<Option<Money>> {
        parse_opt_money("filled_size", self.filled_size.as_deref())
    }

    pub fn average_filled_price(&self) -> ExchangeResult<Option<Money>> {
        parse_opt_money("average_filled_price", self.average_filled_price.as_deref())
    }

    /// (limit_price, base_size) from a limit GTC configuration
    pub fn limit_terms(&self) -> ExchangeResult<(Money, Money)> {
        let limit = self
            .order_configuration
            .as_ref()
            .and_then(|c| c.get("limit_limit_gtc"))
            .ok_or_else(|| {
                ExchangeError::Parse(format!("order {} is not a limit GTC order", self.order_id))
            })?;
        let field = |name: &str| parse_money(name, limit.get(name).and_then(|v| v.as_str()).unwrap_or(""));

        let price = field("limit_price")?;
        let size = field("base_size")?;
        if !price.is_positive() || !size.is_positive() {
            return Err(ExchangeError::Parse(format!(
                "order {} limit terms {} @ {}",
                self.order_id, size, price
            )));
        }
        Ok((price, size))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchCancelBody {
    pub order_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchCancelResponse {
    #[serde(default)]
    pub results: Vec<CancelResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelResult {
    pub success: bool,
    #[serde(default)]
    pub failure_reason: String,
    #[serde(default)]
    pub order_id: String,
}

// =============================================================================
// Conversions
// =============================================================================

/// Coinbase order status strings onto the bot's lifecycle
pub fn map_order_status(status: &str) -> OrderStatus {
    match status {
        "OPEN" | "CANCEL_QUEUED" => OrderStatus::Open,
        "FILLED" => OrderStatus::Filled,
        "CANCELLED" => OrderStatus::Cancelled,
        "EXPIRED" => OrderStatus::Expired,
        "FAILED" => OrderStatus::Rejected,
        // PENDING, QUEUED, UNKNOWN_ORDER_STATUS: not settled yet
        _ => OrderStatus::Pending,
    }
}

pub fn parse_money(field: &str, value: &str) -> ExchangeResult<Money> {
    value
        .parse::<Money>()
        .map_err(|_| ExchangeError::Parse(format!("{} '{}'", field, value)))
}

/// Empty strings and missing fields are `None`
pub fn parse_opt_money(field: &str, value: Option<&str>) -> ExchangeResult<Option<Money>> {
    match value {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => parse_money(field, v).map(Some),
    }
}

fn parse_f64(field: &str, value: &str) -> ExchangeResult<f64> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::Parse(format!("{} '{}'", field, value)))
}
