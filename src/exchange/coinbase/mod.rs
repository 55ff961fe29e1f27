//! Coinbase Advanced Trade gateway
//!
//! Implements [`ExchangeGateway`] on the v3 brokerage REST API:
//!
//! - `GET  /products/{id}` for price and increments
//! - `GET  /products/{id}/candles` for the RSI input
//! - `POST /orders` with `limit_limit_gtc` configuration
//! - `GET  /orders/historical/{id}` and `/orders/historical/batch`
//! - `POST /orders/batch_cancel`
//!
//! # Configuration
//!
//! ```no_run
//! use std::time::Duration;
//! use rsi_tier_bot::exchange::coinbase::{ClientConfig, CoinbaseGateway, Credentials};
//!
//! let config = ClientConfig::default()
//!     .with_max_retries(5)
//!     .with_timeout(Duration::from_secs(60));
//! let gateway = CoinbaseGateway::new(Credentials::new("key", "secret"), config).unwrap();
//! ```

pub mod auth;
pub mod client;
pub mod types;

pub use auth::Credentials;
pub use client::{ClientConfig, CoinbaseClient, RetryPolicy, API_BASE_URL};

use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, warn};

use self::types::*;
use crate::config::Granularity;
use crate::exchange::{
    ExchangeError, ExchangeGateway, ExchangeResult, OpenOrder, OrderRequest, OrderStatusReport,
};
use crate::indicators::rsi_series;
use crate::state::CLIENT_ID_PREFIX;
use crate::types::{Money, OrderStatus, OscillatorSeries, ProductId, ProductIncrements};

/// Candles requested per RSI calculation; the endpoint caps a request at 350
pub const CANDLE_LOOKBACK: i64 = 300;

/// Pages walked when searching order history for a client order id
const MAX_HISTORY_PAGES: usize = 10;

const HISTORY_PAGE_SIZE: &str = "250";

pub struct CoinbaseGateway {
    client: CoinbaseClient,
    granularity: HashMap<ProductId, Granularity>,
}

impl CoinbaseGateway {
    pub fn new(credentials: Credentials, config: ClientConfig) -> ExchangeResult<Self> {
        Ok(Self {
            client: CoinbaseClient::new(credentials, config)?,
            granularity: HashMap::new(),
        })
    }

    /// Candle width for one product; unset products use fifteen minutes
    pub fn with_granularity(mut self, product_id: ProductId, granularity: Granularity) -> Self {
        self.granularity.insert(product_id, granularity);
        self
    }

    fn granularity_for(&self, product_id: &ProductId) -> Granularity {
        self.granularity.get(product_id).copied().unwrap_or_default()
    }

    fn product(&self, product_id: &ProductId) -> ExchangeResult<ProductResponse> {
        self.client
            .get(&format!("/products/{}", product_id), &[])
    }

    fn closes(&self, product_id: &ProductId) -> ExchangeResult<Vec<f64>> {
        let granularity = self.granularity_for(product_id);
        let end = Utc::now().timestamp();
        let start = end - granularity.seconds() * CANDLE_LOOKBACK;
        let resp: CandlesResponse = self.client.get(
            &format!("/products/{}/candles", product_id),
            &[
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("granularity", granularity.as_str().to_string()),
            ],
        )?;

        let mut candles = resp
            .candles
            .iter()
            .map(WireCandle::to_candle)
            .collect::<ExchangeResult<Vec<_>>>()?;
        // Coinbase returns newest first
        candles.sort_by_key(|c| c.start);
        debug!("[{}] Fetched {} {} candles", product_id, candles.len(), granularity.as_str());
        Ok(candles.into_iter().map(|c| c.close).collect())
    }

    /// Walk order history for a product, newest first, until `visit` returns a value
    fn scan_history<T>(
        &self,
        product_id: &ProductId,
        status_filter: Option<&str>,
        mut visit: impl FnMut(&WireOrder) -> Option<T>,
    ) -> ExchangeResult<Option<T>> {
        let mut cursor = String::new();
        for _ in 0..MAX_HISTORY_PAGES {
            let mut query = vec![
                ("product_ids", product_id.to_string()),
                ("limit", HISTORY_PAGE_SIZE.to_string()),
            ];
            if let Some(status) = status_filter {
                query.push(("order_status", status.to_string()));
            }
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }

            let page: ListOrdersResponse = self.client.get("/orders/historical/batch", &query)?;
            if let Some(found) = page.orders.iter().find_map(&mut visit) {
                return Ok(Some(found));
            }
            if !page.has_next || page.cursor.is_empty() {
                break;
            }
            cursor = page.cursor;
        }
        Ok(None)
    }
}

fn is_not_found(err: &ExchangeError) -> bool {
    match err {
        ExchangeError::Api { status, message } => {
            *status == 404 || (*status == 400 && message.contains("NOT_FOUND"))
        }
        _ => false,
    }
}

impl ExchangeGateway for CoinbaseGateway {
    fn get_oscillator_history(&self, product_id: &ProductId, period: usize) -> ExchangeResult<OscillatorSeries> {
        let closes = self.closes(product_id)?;
        Ok(rsi_series(&closes, period))
    }

    fn get_reference_price(&self, product_id: &ProductId) -> ExchangeResult<Money> {
        let product = self.product(product_id)?;
        parse_money("price", &product.price)
    }

    fn get_product_increments(&self, product_id: &ProductId) -> ExchangeResult<ProductIncrements> {
        let product = self.product(product_id)?;
        Ok(ProductIncrements {
            price_increment: parse_money("price_increment", product.price_tick())?,
            base_increment: parse_money("base_increment", &product.base_increment)?,
            min_order_size: parse_money("base_min_size", &product.base_min_size)?,
        })
    }

    fn place_limit_order(&self, request: &OrderRequest) -> ExchangeResult<String> {
        let body = CreateOrderBody {
            client_order_id: request.client_order_id.clone(),
            product_id: request.product_id.to_string(),
            side: request.side,
            order_configuration: OrderConfiguration {
                limit_limit_gtc: LimitGtc {
                    base_size: request.size.to_exchange_string(),
                    limit_price: request.price.to_exchange_string(),
                    post_only: false,
                },
            },
        };

        let resp: CreateOrderResponse = self.client.post("/orders", &body, RetryPolicy::Once)?;
        match (resp.success, resp.success_response.as_ref()) {
            (true, Some(ok)) => Ok(ok.order_id.clone()),
            _ => Err(ExchangeError::Rejected(resp.rejection_reason())),
        }
    }

    fn get_order_status(&self, order_id: &str) -> ExchangeResult<OrderStatusReport> {
        let resp: HistoricalOrderResponse = self
            .client
            .get(&format!("/orders/historical/{}", order_id), &[])
            .map_err(|e| {
                if is_not_found(&e) {
                    ExchangeError::UnknownOrder(order_id.to_string())
                } else {
                    e
                }
            })?;

        let order = resp.order;
        let mut report = OrderStatusReport::new(order.status());
        if let (Some(size), Some(price)) = (order.filled_size()?, order.average_filled_price()?) {
            if size.is_positive() {
                report = report.with_fill(price, size);
            }
        }
        Ok(report)
    }

    fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
        let body = BatchCancelBody {
            order_ids: vec![order_id.to_string()],
        };
        let resp: BatchCancelResponse =
            self.client
                .post("/orders/batch_cancel", &body, RetryPolicy::Idempotent)?;

        match resp.results.into_iter().find(|r| r.order_id == order_id || r.order_id.is_empty()) {
            Some(r) if r.success => Ok(()),
            Some(r) if r.failure_reason == "UNKNOWN_CANCEL_ORDER" => {
                Err(ExchangeError::UnknownOrder(order_id.to_string()))
            }
            Some(r) => Err(ExchangeError::Rejected(r.failure_reason)),
            None => Err(ExchangeError::Parse(format!("no cancel result for {}", order_id))),
        }
    }

    fn find_order_by_client_id(&self, product_id: &ProductId, client_order_id: &str) -> ExchangeResult<Option<String>> {
        self.scan_history(product_id, None, |o| {
            (o.client_order_id == client_order_id).then(|| o.order_id.clone())
        })
    }

    fn list_open_orders(&self, product_id: &ProductId) -> ExchangeResult<Vec<OpenOrder>> {
        let mut open = Vec::new();
        let mut parse_error = None;
        self.scan_history::<()>(product_id, Some("OPEN"), |o| match open_order_from(o) {
            Ok(Some(order)) => {
                open.push(order);
                None
            }
            Ok(None) => None,
            Err(e) => {
                parse_error = Some(e);
                Some(())
            }
        })?;

        match parse_error {
            Some(e) => Err(e),
            None => Ok(open),
        }
    }
}

/// Resting limit order from a history row.
///
/// Rows that are not open are skipped. Unreadable terms are an error for our
/// own orders and skipped with a warning for anything placed by hand.
fn open_order_from(o: &WireOrder) -> ExchangeResult<Option<OpenOrder>> {
    if o.status() != OrderStatus::Open {
        return Ok(None);
    }
    let terms = o.side().and_then(|side| o.limit_terms().map(|(price, size)| (side, price, size)));
    let (side, price, size) = match terms {
        Ok(t) => t,
        Err(e) if !o.client_order_id.starts_with(CLIENT_ID_PREFIX) => {
            warn!("Ignoring foreign order {}: {}", o.order_id, e);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    Ok(Some(OpenOrder {
        order_id: o.order_id.clone(),
        client_order_id: o.client_order_id.clone(),
        product_id: ProductId::new(&o.product_id),
        side,
        price,
        size,
        created_at: o.created_time,
    }))
}
