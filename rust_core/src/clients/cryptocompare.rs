//! CryptoCompare streaming client
//!
//! Maintains the websocket connection to the CryptoCompare streamer and
//! turns aggregate-index frames into `PriceUpdate`s. Point-in-time prices
//! come from the REST `pricemulti` endpoint.
//!
//! Protocol:
//! - outbound: `{"action":"SubAdd","subs":["5~CCCAGG~BTC~USD", ...]}`
//! - inbound:  `{"TYPE":"5","FROMSYMBOL":"BTC","PRICE":50000.0, ...}`
//!
//! Frames without a `PRICE` (volume-only updates) are ignored.

use super::exchange::Exchange;
use super::reconnect::{ReconnectConfig, ReconnectStats};
use crate::error::{CoreError, CoreResult};
use crate::types::{PriceUpdate, Ticker};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

const DEFAULT_WS_URL: &str = "wss://streamer.cryptocompare.com/v2";
const DEFAULT_API_URL: &str = "https://min-api.cryptocompare.com/data/pricemulti";
const QUOTE_CURRENCY: &str = "USD";

// Inbound TYPE codes
const TYPE_AGGREGATE_INDEX: &str = "5";
const TYPE_SUBSCRIBE_COMPLETE: &str = "16";
const TYPE_WELCOME: &str = "20";
const TYPE_ERROR: &str = "500";
const TYPE_HEARTBEAT: &str = "999";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// CryptoCompare feed configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub api_key: String,
    pub ws_url: String,
    pub api_url: String,
    pub http_timeout: Duration,
    /// Reconnect and resubscribe when the stream drops
    pub reconnect: bool,
    pub backoff: ReconnectConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            http_timeout: Duration::from_secs(10),
            reconnect: true,
            backoff: ReconnectConfig::default(),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("CRYPTOCOMPARE_API_KEY").unwrap_or_default(),
            ws_url: std::env::var("CRYPTOCOMPARE_WS_URL").unwrap_or(defaults.ws_url),
            api_url: std::env::var("CRYPTOCOMPARE_API_URL").unwrap_or(defaults.api_url),
            http_timeout: std::env::var("FEED_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            reconnect: std::env::var("FEED_RECONNECT")
                .ok()
                .and_then(|v| v.to_lowercase().parse().ok())
                .unwrap_or(defaults.reconnect),
            backoff: ReconnectConfig::from_env(),
        }
    }
}

/// Feed counters
#[derive(Debug, Default)]
pub struct FeedStats {
    pub frames_received: AtomicU64,
    pub updates_emitted: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub reconnect: ReconnectStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStatsSnapshot {
    pub frames_received: u64,
    pub updates_emitted: u64,
    pub frames_skipped: u64,
    pub successful_reconnects: u64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            updates_emitted: self.updates_emitted.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            successful_reconnects: self.reconnect.successes(),
        }
    }
}

/// Channel name requesting aggregate-index updates for a ticker in USD.
pub fn subscription_channel(ticker: &Ticker) -> String {
    format!("5~CCCAGG~{}~{}", ticker, QUOTE_CURRENCY)
}

/// One `SubAdd` control frame covering every ticker.
pub fn subscribe_frame(tickers: &[Ticker]) -> String {
    let subs: Vec<String> = tickers.iter().map(subscription_channel).collect();
    serde_json::json!({
        "action": "SubAdd",
        "subs": subs,
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(rename = "TYPE")]
    kind: String,
    #[serde(rename = "FROMSYMBOL", default)]
    from_symbol: Option<String>,
    #[serde(rename = "PRICE", default)]
    price: Option<f64>,
    #[serde(rename = "MESSAGE", default)]
    message: Option<String>,
    #[serde(rename = "PARAMETER", default)]
    parameter: Option<String>,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Price(PriceUpdate),
    /// Welcome, subscribe-complete and heartbeat frames
    Control { kind: String },
    /// Server-side error such as `INVALID_SUB`
    Error { message: String },
    Ignored,
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> CoreResult<Frame> {
    let frame: StreamFrame = serde_json::from_str(text)?;

    match frame.kind.as_str() {
        TYPE_AGGREGATE_INDEX => match (frame.from_symbol, frame.price) {
            (Some(symbol), Some(price)) => {
                if !price.is_finite() {
                    return Err(CoreError::internal(format!(
                        "non-finite price for {}",
                        symbol
                    )));
                }
                let ticker = Ticker::parse(&symbol)?;
                Ok(Frame::Price(PriceUpdate::single(ticker, price)))
            }
            _ => Ok(Frame::Ignored),
        },
        TYPE_ERROR => {
            let message = match (frame.message, frame.parameter) {
                (Some(m), Some(p)) => format!("{} ({})", m, p),
                (Some(m), None) => m,
                (None, Some(p)) => p,
                (None, None) => "unknown error".to_string(),
            };
            Ok(Frame::Error { message })
        }
        TYPE_WELCOME | TYPE_SUBSCRIBE_COMPLETE | TYPE_HEARTBEAT => {
            Ok(Frame::Control { kind: frame.kind })
        }
        _ => Ok(Frame::Ignored),
    }
}

/// Extract USD quotes from a `pricemulti` response body.
pub fn parse_price_response(body: &serde_json::Value) -> CoreResult<HashMap<Ticker, f64>> {
    if body.get("Response").and_then(|v| v.as_str()) == Some("Error") {
        let message = body
            .get("Message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        return Err(CoreError::internal(format!("CryptoCompare error: {}", message)));
    }

    let quotes = body
        .as_object()
        .ok_or_else(|| CoreError::internal("unexpected price response shape"))?;

    let mut prices = HashMap::with_capacity(quotes.len());
    for (symbol, by_currency) in quotes {
        let price = by_currency.get(QUOTE_CURRENCY).and_then(|v| v.as_f64());
        match (Ticker::parse(symbol), price) {
            (Ok(ticker), Some(price)) => {
                prices.insert(ticker, price);
            }
            _ => debug!("Skipping price entry for {:?}", symbol),
        }
    }
    Ok(prices)
}

/// Why a connection session ended
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    /// The hub dropped its receiver
    ConsumerGone,
    Disconnected(String),
}

/// CryptoCompare websocket + REST client implementing `Exchange`
pub struct CryptoCompareFeed {
    config: FeedConfig,
    http: reqwest::Client,
    /// Writer handle of the live connection; `None` while disconnected
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    /// Tickers requested so far, replayed after a reconnect
    tracked: Arc<Mutex<BTreeSet<Ticker>>>,
    stats: Arc<FeedStats>,
}

impl CryptoCompareFeed {
    pub fn new(config: FeedConfig) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent("Cryptowatch/1.0")
            .build()
            .map_err(|e| CoreError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http,
            outbound: Arc::new(Mutex::new(None)),
            tracked: Arc::new(Mutex::new(BTreeSet::new())),
            stats: Arc::new(FeedStats::default()),
        })
    }

    pub fn stats(&self) -> &Arc<FeedStats> {
        &self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    pub fn tracked_tickers(&self) -> Vec<Ticker> {
        self.tracked.lock().iter().cloned().collect()
    }

    fn stream_url(&self) -> CoreResult<Url> {
        let mut url = Url::parse(&self.config.ws_url)
            .map_err(|e| CoreError::internal(format!("invalid stream URL: {}", e)))?;
        if !self.config.api_key.is_empty() {
            url.query_pairs_mut()
                .append_pair("api_key", &self.config.api_key);
        }
        Ok(url)
    }

    /// Queue one SubAdd frame for tickers not requested before.
    fn enqueue_subscription(&self, tickers: &[Ticker]) -> CoreResult<Vec<Ticker>> {
        let outbound = self.outbound.lock();
        let writer = outbound
            .as_ref()
            .ok_or_else(|| CoreError::internal("exchange connection is not open"))?;

        let mut tracked = self.tracked.lock();
        let fresh: Vec<Ticker> = tickers
            .iter()
            .filter(|t| !tracked.contains(*t))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }

        writer
            .send(Message::Text(subscribe_frame(&fresh)))
            .map_err(|_| CoreError::internal("exchange connection closed"))?;
        tracked.extend(fresh.iter().cloned());
        Ok(fresh)
    }
}

async fn connect(url: &Url) -> CoreResult<WsStream> {
    let (ws, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| CoreError::internal(format!("websocket connect failed: {}", e)))?;
    Ok(ws)
}

#[async_trait]
impl Exchange for CryptoCompareFeed {
    fn name(&self) -> &str {
        "CryptoCompare"
    }

    async fn start(
        &self,
        cancel: CancellationToken,
        updates: mpsc::Sender<PriceUpdate>,
    ) -> CoreResult<()> {
        let url = self.stream_url()?;
        info!("Connecting to CryptoCompare stream at {}", self.config.ws_url);
        let ws = connect(&url).await?;
        info!("Connected to CryptoCompare stream");

        let (writer, writer_rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(writer);

        let session = FeedSession {
            url,
            config: self.config.clone(),
            outbound: self.outbound.clone(),
            tracked: self.tracked.clone(),
            stats: self.stats.clone(),
        };
        tokio::spawn(session.run(ws, writer_rx, cancel, updates));
        Ok(())
    }

    async fn subscribe(&self, tickers: &[Ticker]) -> CoreResult<()> {
        let fresh = self.enqueue_subscription(tickers)?;
        if !fresh.is_empty() {
            debug!("Requested CryptoCompare updates for {:?}", fresh);
        }
        Ok(())
    }

    async fn get_prices(&self, tickers: &[Ticker]) -> CoreResult<HashMap<Ticker, f64>> {
        if tickers.is_empty() {
            return Ok(HashMap::new());
        }

        let fsyms = tickers
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut request = self
            .http
            .get(&self.config.api_url)
            .query(&[("fsyms", fsyms.as_str()), ("tsyms", QUOTE_CURRENCY)]);
        if !self.config.api_key.is_empty() {
            request = request.header("authorization", format!("Apikey {}", self.config.api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::internal(format!("price request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::internal(format!(
                "CryptoCompare API error: {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::internal(format!("Failed to parse price response: {}", e)))?;

        parse_price_response(&body)
    }
}

/// State owned by the background read loop
struct FeedSession {
    url: Url,
    config: FeedConfig,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    tracked: Arc<Mutex<BTreeSet<Ticker>>>,
    stats: Arc<FeedStats>,
}

impl FeedSession {
    async fn run(
        self,
        mut ws: WsStream,
        mut writer_rx: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
        updates: mpsc::Sender<PriceUpdate>,
    ) {
        loop {
            match self.pump(ws, &mut writer_rx, &cancel, &updates).await {
                SessionEnd::Cancelled => {
                    info!("CryptoCompare stream cancelled");
                    break;
                }
                SessionEnd::ConsumerGone => {
                    info!("Price consumer dropped, closing CryptoCompare stream");
                    break;
                }
                SessionEnd::Disconnected(reason) => {
                    warn!("CryptoCompare stream disconnected: {}", reason);
                }
            }

            *self.outbound.lock() = None;

            if !self.config.reconnect {
                error!("CryptoCompare stream lost and reconnect is disabled");
                break;
            }

            match self.reconnect(&cancel).await {
                Some(next) => {
                    ws = next;
                    writer_rx = self.install_writer();
                }
                None => break,
            }
        }

        *self.outbound.lock() = None;
    }

    /// Install a fresh writer and queue the resubscription ahead of anything else.
    fn install_writer(&self) -> mpsc::UnboundedReceiver<Message> {
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let mut outbound = self.outbound.lock();
        let tracked: Vec<Ticker> = self.tracked.lock().iter().cloned().collect();
        if !tracked.is_empty() {
            info!("Resubscribing to {} tickers", tracked.len());
            let _ = writer.send(Message::Text(subscribe_frame(&tracked)));
        }
        *outbound = Some(writer);
        writer_rx
    }

    /// Retry with backoff until connected. `None` when cancelled first.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<WsStream> {
        let mut backoff = self.config.backoff.backoff();
        loop {
            let delay = backoff.next_delay();
            debug!("Reconnecting to CryptoCompare in {:?}", delay);

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            self.stats.reconnect.record_attempt();
            match connect(&self.url).await {
                Ok(ws) => {
                    let total = self.stats.reconnect.record_success();
                    info!(
                        "Reconnected to CryptoCompare stream after {} attempts (total reconnects: {})",
                        backoff.attempt(),
                        total
                    );
                    return Some(ws);
                }
                Err(e) => {
                    self.stats.reconnect.record_failure();
                    error!("Reconnect attempt {} failed: {}", backoff.attempt(), e);
                }
            }
        }
    }

    async fn pump(
        &self,
        ws: WsStream,
        writer_rx: &mut mpsc::UnboundedReceiver<Message>,
        cancel: &CancellationToken,
        updates: &mpsc::Sender<PriceUpdate>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                Some(outgoing) = writer_rx.recv() => {
                    if let Err(e) = sink.send(outgoing).await {
                        return SessionEnd::Disconnected(format!("send failed: {}", e));
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        let Some(update) = self.classify(&text) else {
                            continue;
                        };
                        tokio::select! {
                            _ = cancel.cancelled() => return SessionEnd::Cancelled,
                            sent = updates.send(update) => {
                                if sent.is_err() {
                                    return SessionEnd::ConsumerGone;
                                }
                                self.stats.updates_emitted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            return SessionEnd::Disconnected(format!("pong failed: {}", e));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Disconnected(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                    None => return SessionEnd::Disconnected("stream ended".to_string()),
                }
            }
        }
    }

    /// Log control traffic and skip bad frames; only price frames come back.
    fn classify(&self, text: &str) -> Option<PriceUpdate> {
        match parse_frame(text) {
            Ok(Frame::Price(update)) => Some(update),
            Ok(Frame::Error { message }) => {
                warn!("CryptoCompare error frame: {}", message);
                None
            }
            Ok(Frame::Control { kind }) => {
                debug!("CryptoCompare control frame TYPE={}", kind);
                None
            }
            Ok(Frame::Ignored) => None,
            Err(e) => {
                self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                warn!("Skipping malformed frame: {} ({})", e, text);
                None
            }
        }
    }
}
