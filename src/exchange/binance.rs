//! Binance margin integration.
//!
//! Signed REST client for the four margin endpoints the loan cycle needs.
//! Every authenticated request carries a millisecond `timestamp` and an
//! HMAC-SHA256 signature over the url-encoded parameters; freshness is
//! enforced by the exchange.
//!
//! Margin API: https://binance-docs.github.io/apidocs/spot/en/#margin-account-trade

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::exchange::MarginExchange;
use crate::types::{
    ExchangeFailure, LoanCycleError, MarginAccount, StepResult, TransferDirection,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MARGIN_ACCOUNT_PATH: &str = "/sapi/v1/margin/account";
const MARGIN_LOAN_PATH: &str = "/sapi/v1/margin/loan";
const MARGIN_REPAY_PATH: &str = "/sapi/v1/margin/repay";
const MARGIN_TRANSFER_PATH: &str = "/sapi/v1/margin/transfer";
const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const HTTP_TIMEOUT_SECS: u64 = 30;
/// Longest error body we copy into a failure message.
const MAX_ERROR_BODY: usize = 512;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    #[serde(rename = "tranId")]
    tran_id: Option<TranId>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TranId {
    Num(u64),
    Text(String),
}

impl TranId {
    fn into_string(self) -> String {
        match self {
            TranId::Num(n) => n.to_string(),
            TranId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
}

// ---------------------------------------------------------------------------
// Rate-limit gate
// ---------------------------------------------------------------------------

/// Client-wide hold-off set by a `Retry-After` hint.
///
/// Applies to the next outgoing request regardless of which step sends it.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    not_before: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the next request until `retry_after` from now.
    pub fn defer(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut guard = self.not_before.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(guard.map_or(until, |current| current.max(until)));
    }

    /// Sleep out any pending hold-off, then clear it.
    pub async fn wait(&self) {
        let until = self
            .not_before
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(until) = until {
            if until > Instant::now() {
                debug!(
                    wait_ms = (until - Instant::now()).as_millis() as u64,
                    "Honoring Retry-After before next request"
                );
                tokio::time::sleep_until(until).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Lowercase hex HMAC-SHA256 of `payload` keyed with `secret`.
pub fn sign(secret: &str, payload: &str) -> Result<String, LoanCycleError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| LoanCycleError::Signing(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Url-encoded `k=v&...&timestamp=..&signature=..` for a signed call.
pub fn signed_payload(
    secret: &str,
    params: &[(&str, String)],
    timestamp_ms: i64,
    recv_window_ms: Option<u64>,
) -> Result<String, LoanCycleError> {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect();
    if let Some(window) = recv_window_ms {
        pairs.push(format!("recvWindow={window}"));
    }
    pairs.push(format!("timestamp={timestamp_ms}"));

    let unsigned = pairs.join("&");
    let signature = sign(secret, &unsigned)?;
    Ok(format!("{unsigned}&signature={signature}"))
}

/// `Retry-After` in whole seconds, as Binance sends it.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map an HTTP status and body from loan/repay/transfer to a `StepResult`.
pub fn map_transaction_response(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> StepResult {
    if status == 200 {
        return match serde_json::from_str::<TransactionResponse>(body) {
            Ok(TransactionResponse { tran_id: Some(id) }) => StepResult::success(id.into_string()),
            _ => {
                // HTTP 200 means the exchange committed the call; resubmitting
                // would duplicate it.
                warn!(body = %truncate(body), "Success response without tranId");
                StepResult::success("unknown")
            }
        };
    }

    StepResult::Failure(map_error(status, body, retry_after))
}

fn map_error(status: u16, body: &str, retry_after: Option<Duration>) -> ExchangeFailure {
    let failure = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody {
            code: Some(code),
            msg,
        }) => ExchangeFailure::api(status, Some(code.to_string()), msg.unwrap_or_default()),
        _ => ExchangeFailure::api(status, None, truncate(body)),
    };
    match retry_after {
        Some(d) => failure.with_retry_after(d),
        None => failure,
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BinanceMarginClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: SecretString,
    recv_window_ms: Option<u64>,
    gate: RateLimitGate,
}

/// Raw HTTP exchange before interpretation.
struct RawResponse {
    status: u16,
    retry_after: Option<Duration>,
    body: String,
}

impl BinanceMarginClient {
    pub fn new(
        api_key: String,
        api_secret: SecretString,
        base_url: Option<String>,
        recv_window_ms: Option<u64>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("Failed to build Binance HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            api_secret,
            recv_window_ms,
            gate: RateLimitGate::new(),
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Self::new(
            cfg.api_key.clone(),
            SecretString::new(cfg.api_secret.expose_secret().clone()),
            Some(cfg.base_url.clone()),
            cfg.recv_window_ms,
        )
    }

    /// Send a signed request and collect status, Retry-After and body.
    ///
    /// GET parameters travel in the query string; POST parameters in a
    /// form-encoded body.
    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<RawResponse, ExchangeFailure> {
        self.gate.wait().await;

        let payload = signed_payload(
            self.api_secret.expose_secret(),
            params,
            chrono::Utc::now().timestamp_millis(),
            self.recv_window_ms,
        )
        .map_err(|e| ExchangeFailure::transport(e.to_string()))?;

        let request = if method == Method::GET {
            self.http
                .get(format!("{}{path}?{payload}", self.base_url))
        } else {
            self.http
                .request(method, format!("{}{path}", self.base_url))
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(payload)
        };

        debug!(path, "Binance API request");

        let resp = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| ExchangeFailure::transport(format!("request to {path} failed: {e}")))?;

        let status = resp.status().as_u16();
        let retry_after = if status == 429 || status == 418 {
            let hint = parse_retry_after(resp.headers());
            if let Some(d) = hint {
                warn!(status, retry_after_secs = d.as_secs(), "Rate limited by Binance");
                self.gate.defer(d);
            }
            hint
        } else {
            None
        };

        let body = resp
            .text()
            .await
            .map_err(|e| ExchangeFailure::transport(format!("reading {path} response: {e}")))?;

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }

    async fn submit(&self, path: &str, params: &[(&str, String)]) -> StepResult {
        match self.send_signed(Method::POST, path, params).await {
            Ok(raw) => map_transaction_response(raw.status, &raw.body, raw.retry_after),
            Err(failure) => StepResult::Failure(failure),
        }
    }
}

fn amount_param(amount: Decimal) -> String {
    amount.normalize().to_string()
}

#[async_trait]
impl MarginExchange for BinanceMarginClient {
    async fn margin_account(&self) -> Result<MarginAccount, ExchangeFailure> {
        let raw = self
            .send_signed(Method::GET, MARGIN_ACCOUNT_PATH, &[])
            .await?;
        if raw.status != 200 {
            return Err(map_error(raw.status, &raw.body, raw.retry_after));
        }
        let account: MarginAccount = serde_json::from_str(&raw.body).map_err(|e| {
            ExchangeFailure::api(raw.status, None, format!("unreadable margin account: {e}"))
        })?;
        info!(assets = account.user_assets.len(), "Fetched margin account");
        Ok(account)
    }

    async fn loan(&self, asset: &str, amount: Decimal) -> StepResult {
        self.submit(
            MARGIN_LOAN_PATH,
            &[("asset", asset.to_string()), ("amount", amount_param(amount))],
        )
        .await
    }

    async fn repay(&self, asset: &str, amount: Decimal) -> StepResult {
        self.submit(
            MARGIN_REPAY_PATH,
            &[("asset", asset.to_string()), ("amount", amount_param(amount))],
        )
        .await
    }

    async fn transfer(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> StepResult {
        self.submit(
            MARGIN_TRANSFER_PATH,
            &[
                ("asset", asset.to_string()),
                ("amount", amount_param(amount)),
                ("type", direction.as_param().to_string()),
            ],
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
