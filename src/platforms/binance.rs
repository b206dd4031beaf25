//! Binance spot REST integration.
//!
//! Market data endpoints are public. Account and order endpoints are
//! signed: HMAC-SHA256 over the query string, hex-encoded into
//! `signature`, with the key in the `X-MBX-APIKEY` header.
//!
//! API docs: https://developers.binance.com/docs/binance-spot-api-docs/rest-api
//! Base URL: https://api.binance.com

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Exchange, ExchangeError};
use crate::config::{AppConfig, ExchangeConfig};
use crate::types::{Bar, Fill, PriceSeries, Stats24h};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const PLATFORM_NAME: &str = "binance";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const RECV_WINDOW_MS: u64 = 5_000;

/// Base-asset suffixes of leveraged tokens, which are never traded.
const LEVERAGED_SUFFIXES: [&str; 4] = ["UP", "DOWN", "BULL", "BEAR"];

// ---------------------------------------------------------------------------
// API response types (Binance JSON → Rust)
// ---------------------------------------------------------------------------

/// `/api/v3/ticker/24hr`. Numeric fields arrive as strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    #[serde(default)]
    quote_volume: String,
    #[serde(default)]
    price_change_percent: String,
    #[serde(default)]
    high_price: String,
    #[serde(default)]
    low_price: String,
    #[serde(default)]
    count: u64,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    #[serde(default)]
    step_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
}

/// `/api/v3/order` with `newOrderRespType=RESULT`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(default)]
    order_id: i64,
    #[serde(default)]
    status: String,
    executed_qty: String,
    cummulative_quote_qty: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Credentials {
    api_key: String,
    secret: SecretString,
}

/// Binance spot client.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    quote_asset: String,
    credentials: Option<Credentials>,
    /// LOT_SIZE step per symbol; these change rarely enough to cache for
    /// the life of the process.
    step_sizes: Mutex<HashMap<String, Decimal>>,
}

impl BinanceClient {
    /// Build a client. Without credentials only market data works.
    pub fn new(
        cfg: &ExchangeConfig,
        credentials: Option<(String, SecretString)>,
    ) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("apex-trader/0.1")
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            quote_asset: cfg.quote_asset.clone(),
            credentials: credentials.map(|(api_key, secret)| Credentials { api_key, secret }),
            step_sizes: Mutex::new(HashMap::new()),
        })
    }

    /// Build a client with credentials read from the environment variables
    /// named in `cfg`. Missing variables leave the client unauthenticated.
    pub fn from_env(cfg: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let key = AppConfig::resolve_env(&cfg.api_key_env).ok().filter(|k| !k.is_empty());
        let secret = AppConfig::resolve_env(&cfg.api_secret_env).ok().filter(|s| !s.is_empty());
        let credentials = match (key, secret) {
            (Some(k), Some(s)) => Some((k, SecretString::new(s))),
            _ => None,
        };
        let client = Self::new(cfg, credentials)?;
        info!(
            base_url = %client.base_url,
            authenticated = client.has_credentials(),
            "Binance client ready"
        );
        Ok(client)
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    async fn get_public<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await?;
        decode(resp).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::Auth("API credentials not configured".to_string()))?;
        let query = signed_query(
            creds.secret.expose_secret(),
            params,
            Utc::now().timestamp_millis(),
        )?;
        let resp = self
            .http
            .request(method, format!("{}{}?{}", self.base_url, path, query))
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await?;
        decode(resp).await
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        let resp: OrderResponse = self.signed(Method::POST, "/api/v3/order", &params).await?;
        let fill = fill_from_order(&resp)?;
        info!(
            symbol,
            side,
            order_id = resp.order_id,
            price = fill.price,
            quantity = fill.quantity,
            "Market order filled"
        );
        Ok(fill)
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn list_ranked_symbols(&self, limit: usize) -> Result<Vec<String>, ExchangeError> {
        let tickers: Vec<Ticker24h> = self.get_public("/api/v3/ticker/24hr", &[]).await?;
        let total = tickers.len();
        let ranked = rank_symbols(tickers, &self.quote_asset, limit);
        debug!(total, kept = ranked.len(), "Ranked trading universe");
        Ok(ranked)
    }

    async fn get_price_window(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<PriceSeries, ExchangeError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .get_public(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        parse_klines(symbol, &rows)
    }

    async fn get_24h_stats(&self, symbol: &str) -> Result<Stats24h, ExchangeError> {
        let ticker: Ticker24h = self
            .get_public("/api/v3/ticker/24hr", &[("symbol", symbol.to_string())])
            .await?;
        stats_from_ticker(&ticker)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let ticker: TickerPrice = self
            .get_public("/api/v3/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        parse_num("price", &ticker.price)
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let account: AccountInfo = self.signed(Method::GET, "/api/v3/account", &[]).await?;
        match account.balances.iter().find(|b| b.asset == asset) {
            Some(b) => parse_num("free", &b.free),
            None => Ok(0.0),
        }
    }

    async fn get_quantity_step(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        if let Some(step) = self.step_sizes.lock().await.get(symbol) {
            return Ok(*step);
        }
        let info: ExchangeInfo = self
            .get_public("/api/v3/exchangeInfo", &[("symbol", symbol.to_string())])
            .await?;
        let step = parse_step(&info, symbol)?;
        self.step_sizes.lock().await.insert(symbol.to_string(), step);
        Ok(step)
    }

    async fn place_market_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError> {
        self.market_order(symbol, "BUY", quantity).await
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError> {
        self.market_order(symbol, "SELL", quantity).await
    }

    fn name(&self) -> &str {
        PLATFORM_NAME
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Hex-encoded HMAC-SHA256 of `message`.
pub fn sign(secret: &str, message: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `params` in order, then `recvWindow` and `timestamp`, then the signature
/// over everything before it.
pub fn signed_query(
    secret: &str,
    params: &[(&str, String)],
    timestamp_ms: i64,
) -> Result<String, ExchangeError> {
    let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.push(format!("recvWindow={RECV_WINDOW_MS}"));
    parts.push(format!("timestamp={timestamp_ms}"));
    let query = parts.join("&");
    let signature = sign(secret, &query)?;
    Ok(format!("{query}&signature={signature}"))
}

// ---------------------------------------------------------------------------
// Response handling
// ---------------------------------------------------------------------------

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ExchangeError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(classify_error(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|e| {
        let snippet: String = body.chars().take(200).collect();
        ExchangeError::Parse(format!("{e}: {snippet}"))
    })
}

/// Map an HTTP failure to an `ExchangeError`. Binance error bodies look
/// like `{"code": -1121, "msg": "Invalid symbol."}`.
fn classify_error(status: u16, body: &str) -> ExchangeError {
    if status == 429 || status == 418 {
        return ExchangeError::RateLimited(format!("HTTP {status}"));
    }
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => match err.code {
            -2010 if err.msg.to_lowercase().contains("insufficient") => {
                ExchangeError::InsufficientBalance
            }
            -1121 => ExchangeError::UnknownSymbol(err.msg),
            -1022 | -2014 | -2015 => ExchangeError::Auth(err.msg),
            code => ExchangeError::Api {
                code,
                message: err.msg,
            },
        },
        Err(_) if status == 401 || status == 403 => ExchangeError::Auth(format!("HTTP {status}")),
        Err(_) if status >= 500 => ExchangeError::Network(format!("HTTP {status}")),
        Err(_) => ExchangeError::Api {
            code: i64::from(status),
            message: body.chars().take(200).collect(),
        },
    }
}

fn parse_num(field: &str, raw: &str) -> Result<f64, ExchangeError> {
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::Parse(format!("{field}: not a number: {raw:?}")))
}

/// Whether `symbol` trades against `quote` and is not a leveraged token.
fn is_tradable(symbol: &str, quote: &str) -> bool {
    let Some(base) = symbol.strip_suffix(quote) else {
        return false;
    };
    !base.is_empty()
        && !LEVERAGED_SUFFIXES
            .iter()
            .any(|s| base.len() > s.len() + 2 && base.ends_with(s))
}

/// Quote-asset pairs sorted by 24h quote volume, highest first.
fn rank_symbols(tickers: Vec<Ticker24h>, quote: &str, limit: usize) -> Vec<String> {
    let mut pairs: Vec<(String, f64)> = tickers
        .into_iter()
        .filter(|t| is_tradable(&t.symbol, quote))
        .map(|t| {
            let vol = t.quote_volume.parse::<f64>().unwrap_or(0.0);
            (t.symbol, vol)
        })
        .collect();
    pairs.sort_by(|a, b| b.1.total_cmp(&a.1));
    pairs.into_iter().take(limit).map(|(s, _)| s).collect()
}

fn stats_from_ticker(t: &Ticker24h) -> Result<Stats24h, ExchangeError> {
    Ok(Stats24h {
        quote_volume: parse_num("quoteVolume", &t.quote_volume)?,
        price_change_percent: parse_num("priceChangePercent", &t.price_change_percent)?,
        high: parse_num("highPrice", &t.high_price)?,
        low: parse_num("lowPrice", &t.low_price)?,
        trade_count: t.count,
    })
}

/// Kline rows are arrays: `[openTime, open, high, low, close, volume, ...]`
/// with prices as strings.
fn parse_klines(symbol: &str, rows: &[Vec<serde_json::Value>]) -> Result<PriceSeries, ExchangeError> {
    let mut series = PriceSeries::new(symbol);
    for row in rows {
        let open_ms = row
            .first()
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| ExchangeError::Parse(format!("{symbol}: kline without open time")))?;
        let price = |idx: usize, name: &str| -> Result<f64, ExchangeError> {
            row.get(idx)
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| ExchangeError::Parse(format!("{symbol}: kline missing {name}")))
                .and_then(|raw| parse_num(name, raw))
        };
        let open_time = Utc
            .timestamp_millis_opt(open_ms)
            .single()
            .ok_or_else(|| ExchangeError::Parse(format!("{symbol}: bad open time {open_ms}")))?;
        series.push(Bar {
            open_time,
            high: price(2, "high")?,
            low: price(3, "low")?,
            close: price(4, "close")?,
        });
    }
    Ok(series)
}

fn parse_step(info: &ExchangeInfo, symbol: &str) -> Result<Decimal, ExchangeError> {
    let sym = info
        .symbols
        .iter()
        .find(|s| s.symbol == symbol)
        .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;
    let raw = sym
        .filters
        .iter()
        .find(|f| f.filter_type == "LOT_SIZE")
        .and_then(|f| f.step_size.as_deref())
        .ok_or_else(|| ExchangeError::Parse(format!("{symbol}: no LOT_SIZE filter")))?;
    Decimal::from_str(raw)
        .map(|d| d.normalize())
        .map_err(|e| ExchangeError::Parse(format!("{symbol}: stepSize {raw:?}: {e}")))
}

/// Average fill price is `cummulativeQuoteQty / executedQty`.
fn fill_from_order(resp: &OrderResponse) -> Result<Fill, ExchangeError> {
    let quantity = parse_num("executedQty", &resp.executed_qty)?;
    let quote = parse_num("cummulativeQuoteQty", &resp.cummulative_quote_qty)?;
    if quantity <= 0.0 {
        return Err(ExchangeError::Api {
            code: 0,
            message: format!("order {} not filled (status {})", resp.order_id, resp.status),
        });
    }
    Ok(Fill {
        price: quote / quantity,
        quantity,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(symbol: &str, quote_volume: &str) -> Ticker24h {
        Ticker24h {
            symbol: symbol.to_string(),
            quote_volume: quote_volume.to_string(),
            price_change_percent: "1.5".to_string(),
            high_price: "1".to_string(),
            low_price: "1".to_string(),
            count: 10,
        }
    }

    #[test]
    fn test_sign_known_vector() {
        // Example from the Binance signed-endpoint documentation.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_signed_query_layout() {
        let params = [("symbol", "BTCUSDT".to_string()), ("side", "BUY".to_string())];
        let q = signed_query("secret", &params, 1_000).unwrap();
        let (body, sig) = q.split_once("&signature=").unwrap();
        assert_eq!(body, "symbol=BTCUSDT&side=BUY&recvWindow=5000&timestamp=1000");
        assert_eq!(sig, sign("secret", body).unwrap());
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn test_tradable_filter() {
        assert!(is_tradable("BTCUSDT", "USDT"));
        assert!(is_tradable("JUPUSDT", "USDT"));
        assert!(!is_tradable("BTCUPUSDT", "USDT"));
        assert!(!is_tradable("ETHDOWNUSDT", "USDT"));
        assert!(!is_tradable("EOSBULLUSDT", "USDT"));
        assert!(!is_tradable("BNBBEARUSDT", "USDT"));
        assert!(!is_tradable("ETHBTC", "USDT"));
        assert!(!is_tradable("USDT", "USDT"));
    }

    #[test]
    fn test_rank_symbols() {
        let tickers = vec![
            ticker("ETHUSDT", "900"),
            ticker("BTCUSDT", "1500"),
            ticker("BTCUPUSDT", "5000"),
            ticker("ETHBTC", "9000"),
            ticker("SOLUSDT", "400"),
            ticker("XRPUSDT", "junk"),
        ];
        assert_eq!(
            rank_symbols(tickers, "USDT", 3),
            vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]
        );
    }

    #[test]
    fn test_parse_ticker_json() {
        let json = r#"{"symbol":"BTCUSDT","priceChange":"10","priceChangePercent":"-2.35",
            "highPrice":"64000.1","lowPrice":"61000","quoteVolume":"123456789.5","count":987654}"#;
        let t: Ticker24h = serde_json::from_str(json).unwrap();
        let stats = stats_from_ticker(&t).unwrap();
        assert_eq!(stats.price_change_percent, -2.35);
        assert_eq!(stats.quote_volume, 123_456_789.5);
        assert_eq!(stats.trade_count, 987_654);
    }

    #[test]
    fn test_parse_klines() {
        let json = r#"[
            [1700000000000,"100.0","101.5","99.5","101.0","12.3",1700000059999,"0",10,"0","0","0"],
            [1700000060000,"101.0","102.0","100.5","101.8","8.1",1700000119999,"0",7,"0","0","0"]
        ]"#;
        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(json).unwrap();
        let series = parse_klines("BTCUSDT", &rows).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.closes(), vec![101.0, 101.8]);
        assert_eq!(series.highs(), vec![101.5, 102.0]);
        assert_eq!(series.bars[0].open_time.timestamp_millis(), 1_700_000_000_000);

        let bad: Vec<Vec<serde_json::Value>> = serde_json::from_str(r#"[[1700000000000, 1, 2]]"#).unwrap();
        assert!(matches!(parse_klines("BTCUSDT", &bad), Err(ExchangeError::Parse(_))));
    }

    #[test]
    fn test_parse_step() {
        let json = r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
            {"filterType":"PRICE_FILTER","tickSize":"0.01000000"},
            {"filterType":"LOT_SIZE","minQty":"0.00001000","maxQty":"9000.00000000","stepSize":"0.00001000"}
        ]}]}"#;
        let info: ExchangeInfo = serde_json::from_str(json).unwrap();
        assert_eq!(parse_step(&info, "BTCUSDT").unwrap(), dec!(0.00001));
        assert!(matches!(parse_step(&info, "ETHUSDT"), Err(ExchangeError::UnknownSymbol(_))));
    }

    #[test]
    fn test_fill_average_price() {
        let json = r#"{"symbol":"BTCUSDT","orderId":28,"status":"FILLED",
            "executedQty":"0.50000000","cummulativeQuoteQty":"25005.00000000"}"#;
        let resp: OrderResponse = serde_json::from_str(json).unwrap();
        let fill = fill_from_order(&resp).unwrap();
        assert!((fill.price - 50_010.0).abs() < 1e-9);
        assert_eq!(fill.quantity, 0.5);

        let unfilled = OrderResponse {
            order_id: 1,
            status: "EXPIRED".into(),
            executed_qty: "0".into(),
            cummulative_quote_qty: "0".into(),
        };
        assert!(fill_from_order(&unfilled).is_err());
    }

    #[test]
    fn test_classify_error() {
        assert!(matches!(classify_error(429, ""), ExchangeError::RateLimited(_)));
        assert!(matches!(
            classify_error(400, r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#),
            ExchangeError::InsufficientBalance
        ));
        assert!(matches!(
            classify_error(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#),
            ExchangeError::UnknownSymbol(_)
        ));
        assert!(matches!(
            classify_error(401, r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(classify_error(502, "<html>"), ExchangeError::Network(_)));
        let err = classify_error(400, r#"{"code":-1013,"msg":"Filter failure: LOT_SIZE"}"#);
        assert!(matches!(err, ExchangeError::Api { code: -1013, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_signed_call_without_credentials() {
        let client = BinanceClient::new(&ExchangeConfig::default(), None).unwrap();
        assert!(!client.has_credentials());
        assert!(matches!(client.get_balance("USDT").await, Err(ExchangeError::Auth(_))));
        assert_eq!(client.name(), "binance");
    }
}
