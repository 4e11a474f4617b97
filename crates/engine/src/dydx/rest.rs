use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use common::{
    Balance, Candle, Error, MarketData, OrderGateway, OrderOutcome, OrderSide, Position, Result,
};

const BASE_URL: &str = "https://api.dydx.exchange";
const QUOTE_CURRENCY: &str = "USD";
/// Poll interval while waiting for a submitted order to reach a terminal state.
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Worst-case price bound on market orders, relative to the index price.
/// The exchange requires an explicit bound; fills happen at the book.
const MARKET_ORDER_PRICE_BUFFER: f64 = 0.02;

/// REST client for dYdX. Serves both trait seams: public candle retrieval
/// (`MarketData`) and signed order placement / account queries
/// (`OrderGateway`).
pub struct DydxClient {
    api_key: String,
    api_secret: String,
    passphrase: String,
    http: Client,
    order_timeout: Duration,
}

impl DydxClient {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        passphrase: impl Into<String>,
        order_timeout: Duration,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: passphrase.into(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
            order_timeout,
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let payload = format!("{timestamp}{method}{path}{body}");
        // The secret is issued url-safe base64 encoded; a raw secret is
        // accepted as-is.
        let key = URL_SAFE
            .decode(&self.api_secret)
            .unwrap_or_else(|_| self.api_secret.as_bytes().to_vec());
        let mut mac =
            HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<String> {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let body_str = body.unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str);
        let url = format!("{BASE_URL}{path}");

        let mut request = self
            .http
            .request(method, &url)
            .header("DYDX-SIGNATURE", signature)
            .header("DYDX-API-KEY", &self.api_key)
            .header("DYDX-TIMESTAMP", &timestamp)
            .header("DYDX-PASSPHRASE", &self.passphrase);
        if !body_str.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_str);
        }

        let response = request.send().await.map_err(|e| Error::Http(e.to_string()))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {text}")));
        }
        Ok(text)
    }

    async fn public_get(&self, path: &str) -> Result<String> {
        let url = format!("{BASE_URL}{path}");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {text}")));
        }
        Ok(text)
    }

    async fn fetch_account(&self) -> Result<AccountDto> {
        let body = self.signed_request(Method::GET, "/v3/accounts", None).await?;
        let response: AccountsResponse = serde_json::from_str(&body)?;
        response
            .accounts
            .into_iter()
            .next()
            .ok_or_else(|| Error::Exchange("no account returned".into()))
    }

    async fn market_info(&self, symbol: &str) -> Result<MarketDto> {
        let body = self
            .public_get(&format!("/v3/markets?market={symbol}"))
            .await?;
        let response: MarketsResponse = serde_json::from_str(&body)?;
        response
            .markets
            .into_iter()
            .find(|(name, _)| name == symbol)
            .map(|(_, market)| market)
            .ok_or_else(|| Error::Exchange(format!("market {symbol} not listed")))
    }

    /// Poll the order until it is terminal or the bounded wait elapses.
    async fn await_terminal(&self, order_id: &str) -> Result<OrderOutcome> {
        let deadline = tokio::time::Instant::now() + self.order_timeout;
        loop {
            let body = self
                .signed_request(Method::GET, &format!("/v3/orders/{order_id}"), None)
                .await?;
            let response: OrderResponse = serde_json::from_str(&body)?;
            let order = response.order;

            match order.status.as_str() {
                "FILLED" => {
                    return Ok(OrderOutcome::Filled {
                        price: parse_f64("price", &order.price)?,
                        quantity: parse_f64("size", &order.size)?,
                    });
                }
                "CANCELED" => {
                    return Ok(OrderOutcome::Rejected {
                        reason: order.cancel_reason.unwrap_or_else(|| "canceled".into()),
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(order_id = %order_id, status = %order.status, "Order not terminal within timeout");
                return Ok(OrderOutcome::Pending);
            }
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl MarketData for DydxClient {
    async fn latest_candles(&self, symbol: &str, count: usize) -> Result<Vec<Candle>> {
        let path = format!("/v3/candles/{symbol}?resolution=1HOUR&limit={count}");
        let body = self.public_get(&path).await?;
        let response: CandlesResponse = serde_json::from_str(&body)?;

        // The exchange returns newest first; the engine wants oldest first.
        let mut candles = response
            .candles
            .into_iter()
            .map(|dto| dto.into_candle(symbol))
            .collect::<Result<Vec<_>>>()?;
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }
}

#[async_trait]
impl OrderGateway for DydxClient {
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<OrderOutcome> {
        let market = self.market_info(symbol).await?;
        let index_price = parse_f64("indexPrice", &market.index_price)?;
        let bound = match side {
            OrderSide::Buy => index_price * (1.0 + MARKET_ORDER_PRICE_BUFFER),
            OrderSide::Sell => index_price * (1.0 - MARKET_ORDER_PRICE_BUFFER),
        };
        let price = format_price(bound, &market.tick_size)?;

        let client_id = uuid::Uuid::new_v4().to_string();
        let expiration = (Utc::now() + chrono::Duration::minutes(5))
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();
        let request = serde_json::json!({
            "market": symbol,
            "side": side.to_string(),
            "type": "MARKET",
            "size": format_quantity(quantity),
            "price": price,
            // Opens take what the book offers; closes must fill whole.
            "timeInForce": match side {
                OrderSide::Buy => "IOC",
                OrderSide::Sell => "FOK",
            },
            "limitFee": "0.1",
            "postOnly": false,
            "clientId": client_id,
            "expiration": expiration,
        });

        debug!(symbol = %symbol, side = %side, qty = quantity, "Submitting market order");
        let body = self
            .signed_request(Method::POST, "/v3/orders", Some(request.to_string()))
            .await?;
        let response: OrderResponse = serde_json::from_str(&body)?;

        self.await_terminal(&response.order.id).await
    }

    async fn account_balance(&self) -> Result<Balance> {
        let account = self.fetch_account().await?;
        Ok(Balance {
            available: parse_f64("quoteBalance", &account.quote_balance)?,
            currency: QUOTE_CURRENCY.to_string(),
        })
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        let account = self.fetch_account().await?;
        account
            .open_positions
            .into_iter()
            .map(|(symbol, dto)| {
                Ok(Position {
                    size: parse_f64("size", &dto.size)?.abs(),
                    entry_price: match &dto.entry_price {
                        Some(price) => parse_f64("entryPrice", price)?,
                        None => 0.0,
                    },
                    opened_at: dto
                        .created_at
                        .as_deref()
                        .and_then(|t| t.parse::<DateTime<Utc>>().ok())
                        .unwrap_or_else(Utc::now),
                    symbol,
                })
            })
            .collect()
    }
}

/// Render a quantity the exchange accepts: plain decimal, no float noise,
/// no trailing zeros.
fn format_quantity(quantity: f64) -> String {
    let rendered = format!("{quantity:.8}");
    rendered
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Quantize a price to the market's tick size and render it with the tick's
/// decimal width.
fn format_price(price: f64, tick_size: &str) -> Result<String> {
    let tick = parse_f64("tickSize", tick_size)?;
    if tick <= 0.0 {
        return Err(Error::DataIntegrity(format!("unusable tick size '{tick_size}'")));
    }
    let quantized = (price / tick).round() * tick;
    let decimals = tick_size
        .split('.')
        .nth(1)
        .map(|fraction| fraction.len())
        .unwrap_or(0);
    Ok(format!("{quantized:.decimals$}"))
}

fn parse_f64(field: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| Error::DataIntegrity(format!("bad {field} value '{value}'")))
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CandlesResponse {
    candles: Vec<CandleDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandleDto {
    started_at: String,
    open: String,
    high: String,
    low: String,
    close: String,
    base_token_volume: String,
}

impl CandleDto {
    fn into_candle(self, symbol: &str) -> Result<Candle> {
        Ok(Candle {
            symbol: symbol.to_string(),
            open_time: self.started_at.parse::<DateTime<Utc>>().map_err(|e| {
                Error::DataIntegrity(format!("bad candle time '{}': {e}", self.started_at))
            })?,
            open: parse_f64("open", &self.open)?,
            high: parse_f64("high", &self.high)?,
            low: parse_f64("low", &self.low)?,
            close: parse_f64("close", &self.close)?,
            volume: parse_f64("baseTokenVolume", &self.base_token_volume)?,
        })
    }
}

#[derive(Deserialize)]
struct AccountsResponse {
    accounts: Vec<AccountDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountDto {
    quote_balance: String,
    #[serde(default)]
    open_positions: HashMap<String, PositionDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionDto {
    size: String,
    entry_price: Option<String>,
    created_at: Option<String>,
}

#[derive(Deserialize)]
struct MarketsResponse {
    markets: HashMap<String, MarketDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketDto {
    index_price: String,
    tick_size: String,
}

#[derive(Deserialize)]
struct OrderResponse {
    order: OrderDto,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderDto {
    id: String,
    status: String,
    price: String,
    size: String,
    cancel_reason: Option<String>,
}
