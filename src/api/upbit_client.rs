//! Upbit REST client for KRW spot markets.
//!
//! Handles:
//! - Public quotation endpoints (ticker, minute candles)
//! - JWT bearer authentication for exchange endpoints (HS256, SHA512 query hash)
//! - Market order placement, order status lookup and cancellation
//! - Account balances

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::{Client, Method, RequestBuilder, Response};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::{debug, warn};

use super::exchange::ExchangeClient;
use super::types::{Balance, Candle, OrderKind, OrderResult, OrderSide, OrderState, OrderStatus};
use crate::error::ExchangeError;
use crate::session::Credentials;

/// Upbit API base URL
pub const UPBIT_URL: &str = "https://api.upbit.com";

/// Upbit REST client.
pub struct UpbitClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

/// JWT claims expected by the exchange.
#[derive(Debug, Serialize)]
struct AuthClaims<'a> {
    access_key: &'a str,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    trade_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct CandleResponse {
    opening_price: f64,
    high_price: f64,
    low_price: f64,
    trade_price: f64,
    candle_acc_trade_volume: f64,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    uuid: String,
    side: OrderSide,
    ord_type: OrderKind,
    state: OrderState,
    market: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    executed_volume: Decimal,
    #[serde(default)]
    paid_fee: Decimal,
    #[serde(default)]
    trades: Vec<OrderTrade>,
}

#[derive(Debug, Deserialize)]
struct OrderTrade {
    volume: Decimal,
    funds: Decimal,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    currency: String,
    balance: Decimal,
    locked: Decimal,
    avg_buy_price: Decimal,
}

impl OrderResponse {
    fn average_price(&self) -> Decimal {
        let volume: Decimal = self.trades.iter().map(|t| t.volume).sum();
        if volume.is_zero() {
            return Decimal::ZERO;
        }
        let funds: Decimal = self.trades.iter().map(|t| t.funds).sum();
        funds / volume
    }
}

impl UpbitClient {
    /// Create a client. Public endpoints work without credentials.
    pub fn new(credentials: Option<Credentials>) -> Result<Self, ExchangeError> {
        Self::with_base_url(UPBIT_URL, credentials)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Result<Self, ExchangeError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            credentials,
        })
    }

    /// Build the `Authorization` header value for a request with the given query string.
    fn bearer_token(&self, query: Option<&str>) -> Result<String, ExchangeError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::Auth("API credentials not configured".into()))?;

        let (query_hash, query_hash_alg) = match query {
            Some(q) if !q.is_empty() => {
                let digest = Sha512::digest(q.as_bytes());
                (Some(hex::encode(digest)), Some("SHA512"))
            }
            _ => (None, None),
        };

        let claims = AuthClaims {
            access_key: &creds.access_key,
            nonce: uuid::Uuid::new_v4().to_string(),
            query_hash,
            query_hash_alg,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(creds.secret_key.as_bytes()),
        )
        .map_err(|e| ExchangeError::Auth(e.to_string()))?;

        Ok(format!("Bearer {}", token))
    }

    fn authed(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<RequestBuilder, ExchangeError> {
        let query_string = encode_query(query);
        let url = format!("{}{}", self.base_url, path);
        let token = self.bearer_token(Some(&query_string))?;

        let builder = self.http.request(method.clone(), &url).header("Authorization", token);
        let builder = if method == Method::POST {
            let body: serde_json::Map<String, serde_json::Value> = query
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                .collect();
            builder.json(&body)
        } else {
            builder.query(query)
        };
        Ok(builder)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: Response,
        what: &str,
    ) -> Result<T, ExchangeError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "{} request failed", what);
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        resp.json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(format!("{}: {}", what, e)))
    }

    fn to_result(order: OrderResponse) -> OrderResult {
        OrderResult {
            order_id: order.uuid,
            market: order.market,
            side: order.side,
            kind: order.ord_type,
            state: order.state,
            created_at: order.created_at,
        }
    }
}

/// Encode parameters in the exact order they are hashed and sent.
fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl ExchangeClient for UpbitClient {
    async fn get_ticker(&self, market: &str) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/v1/ticker", self.base_url);
        let resp = self.http.get(&url).query(&[("markets", market)]).send().await?;
        let tickers: Vec<TickerResponse> = Self::read_json(resp, "ticker").await?;

        tickers
            .first()
            .map(|t| t.trade_price)
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("empty ticker for {}", market)))
    }

    async fn get_candles(
        &self,
        market: &str,
        unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!("{}/v1/candles/minutes/{}", self.base_url, unit);
        let resp = self
            .http
            .get(&url)
            .query(&[("market", market.to_string()), ("count", count.to_string())])
            .send()
            .await?;
        let raw: Vec<CandleResponse> = Self::read_json(resp, "candles").await?;

        // The exchange returns newest first.
        let candles: Vec<Candle> = raw
            .into_iter()
            .rev()
            .map(|c| Candle {
                open: c.opening_price,
                high: c.high_price,
                low: c.low_price,
                close: c.trade_price,
                volume: c.candle_acc_trade_volume,
                timestamp: c.timestamp,
            })
            .collect();

        debug!(market = %market, unit, count = candles.len(), "Fetched candles");
        Ok(candles)
    }

    async fn place_market_buy(
        &self,
        market: &str,
        krw_amount: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        let params = [
            ("market", market.to_string()),
            ("side", "bid".to_string()),
            ("price", krw_amount.round_dp(0).normalize().to_string()),
            ("ord_type", "price".to_string()),
        ];
        let resp = self.authed(Method::POST, "/v1/orders", &params)?.send().await?;
        let order: OrderResponse = Self::read_json(resp, "buy order").await?;
        Ok(Self::to_result(order))
    }

    async fn place_market_sell(
        &self,
        market: &str,
        volume: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        let params = [
            ("market", market.to_string()),
            ("side", "ask".to_string()),
            ("volume", volume.normalize().to_string()),
            ("ord_type", "market".to_string()),
        ];
        let resp = self.authed(Method::POST, "/v1/orders", &params)?.send().await?;
        let order: OrderResponse = Self::read_json(resp, "sell order").await?;
        Ok(Self::to_result(order))
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderStatus, ExchangeError> {
        let params = [("uuid", order_id.to_string())];
        let resp = self.authed(Method::GET, "/v1/order", &params)?.send().await?;
        let order: OrderResponse = Self::read_json(resp, "order status").await?;

        Ok(OrderStatus {
            avg_price: order.average_price(),
            order_id: order.uuid,
            market: order.market,
            side: order.side,
            state: order.state,
            executed_volume: order.executed_volume,
            paid_fee: order.paid_fee,
            updated_at: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError> {
        let params = [("uuid", order_id.to_string())];
        let resp = self.authed(Method::DELETE, "/v1/order", &params)?.send().await?;
        if resp.status().is_success() {
            return Ok(true);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            // Already filled or cancelled.
            debug!(order_id = %order_id, status = %status, "Cancel not applied");
            return Ok(false);
        }
        Err(ExchangeError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_accounts(&self) -> Result<Vec<Balance>, ExchangeError> {
        let resp = self.authed(Method::GET, "/v1/accounts", &[])?.send().await?;
        let accounts: Vec<AccountResponse> = Self::read_json(resp, "accounts").await?;

        Ok(accounts
            .into_iter()
            .map(|a| Balance {
                currency: a.currency,
                balance: a.balance,
                locked: a.locked,
                avg_buy_price: a.avg_buy_price,
            })
            .collect())
    }
}
