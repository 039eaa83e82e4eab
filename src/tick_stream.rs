// =============================================================================
// Tick Streamer — long-lived socket client for real-time last-trade data
// =============================================================================
//
// The dispatcher is a free function kept separate from the socket loop so it
// is unit-testable without a socket. The subscription manager tracks
// last-data-seen per conid behind a `parking_lot::RwLock`, the same
// primitive this codebase's other shared mutable maps use. The watchdog is a
// sibling task signalling through a single `Arc<AtomicBool>` "unauthenticated"
// flag plus a `tokio::sync::watch` channel carrying the last-read instant —
// simple enough not to need a task-cancellation crate.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::store::StoreAdapter;
use crate::types::Instrument;

/// How often a bare `tic` keep-alive is sent.
const TIC_EVERY: Duration = Duration::from_secs(60);
/// Minimum gap before the streamer re-echoes a heartbeat.
const HEARTBEAT_ECHO_EVERY: Duration = Duration::from_secs(30);
/// If no frame at all arrives within this window, the socket is force-closed.
const RECV_TIMEOUT: Duration = Duration::from_secs(15);
/// Per-instrument: resubscribe if no data has arrived in this long.
const SUBSCRIPTION_STALE_AFTER: Duration = Duration::from_secs(10);

/// A decoded frame off the wire, loosely typed to match the variety of
/// shapes the portal's socket protocol sends.
#[derive(Debug, Deserialize)]
struct Frame {
    message: Option<String>,
    topic: Option<String>,
    hb: Option<serde_json::Value>,
    args: Option<serde_json::Value>,
    #[serde(flatten)]
    rest: serde_json::Value,
}

/// Outcome of dispatching one decoded frame.
#[derive(Debug, PartialEq)]
enum Dispatch {
    /// A last-trade update, ready to publish.
    MarketData(crate::types::Tick),
    /// Server asked us to authenticate the socket.
    NeedsAuth,
    /// `hb` heartbeat frame; caller echoes `ech+hb` if due.
    Heartbeat,
    /// `sts` frame reporting `authenticated: false`.
    Unauthenticated,
    /// Anything else we acknowledge by ignoring.
    Ignored,
}

fn dispatch(text: &str, instruments_by_conid: &HashMap<i64, Instrument>) -> Dispatch {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => return Dispatch::Ignored,
    };

    if frame.message.as_deref() == Some("waiting for session") {
        return Dispatch::NeedsAuth;
    }

    if frame.hb.is_some() {
        return Dispatch::Heartbeat;
    }

    let topic = frame.topic.unwrap_or_default();

    if topic.starts_with("smd") {
        let price = frame.rest.get("31").and_then(|v| v.as_str().and_then(|s| s.parse::<f64>().ok()).or_else(|| v.as_f64()));
        let conid = frame.rest.get("conid").and_then(|v| v.as_i64());
        let updated_ms = frame.rest.get("_updated").and_then(|v| v.as_i64());

        if let (Some(price), Some(conid)) = (price, conid) {
            if let Some(instrument) = instruments_by_conid.get(&conid) {
                let dt = updated_ms
                    .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                    .unwrap_or_else(chrono::Utc::now);
                return Dispatch::MarketData(crate::types::Tick {
                    dt: dt.format("%Y-%m-%d %H:%M:%S").to_string(),
                    price,
                    conid,
                    symbol: instrument.display_symbol(),
                });
            }
        }
        return Dispatch::Ignored;
    }

    if topic == "sts" {
        let authenticated = frame
            .args
            .as_ref()
            .and_then(|a| a.get("authenticated"))
            .and_then(|v| v.as_bool());
        if authenticated == Some(false) {
            return Dispatch::Unauthenticated;
        }
        return Dispatch::Ignored;
    }

    Dispatch::Ignored
}

/// Literal wire format for dropping a subscription on shutdown: no `+`
/// before the empty JSON body, preserved for wire compatibility.
fn unsubscribe_frame(conid: i64) -> String {
    format!("umd+{conid}{{}}")
}

fn subscribe_frame(conid: i64) -> String {
    format!("smd+{conid}+{{\"fields\":[\"31\"]}}")
}

/// Tracks last-data-seen per conid so stale subscriptions get re-sent.
struct SubscriptionManager {
    last_seen: RwLock<HashMap<i64, Instant>>,
}

impl SubscriptionManager {
    fn new(conids: &[i64]) -> Self {
        let now = Instant::now();
        let mut map = HashMap::new();
        for &conid in conids {
            map.insert(conid, now);
        }
        Self {
            last_seen: RwLock::new(map),
        }
    }

    fn mark_seen(&self, conid: i64) {
        self.last_seen.write().insert(conid, Instant::now());
    }

    fn stale(&self) -> Vec<i64> {
        let now = Instant::now();
        self.last_seen
            .read()
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > SUBSCRIPTION_STALE_AFTER)
            .map(|(conid, _)| *conid)
            .collect()
    }
}

/// Runs the Tick Streamer: connect, auth, subscribe, dispatch, reconnect on
/// any failure. Returns once `shutdown` reports `true`, after unsubscribing
/// every instrument on the open socket (if any).
pub async fn run(
    broker: BrokerClient,
    store: Arc<dyn StoreAdapter>,
    instruments: Vec<Instrument>,
    mut shutdown: watch::Receiver<bool>,
) {
    let instruments_by_conid: HashMap<i64, Instrument> =
        instruments.iter().map(|i| (i.conid, i.clone())).collect();
    let conids: Vec<i64> = instruments.iter().map(|i| i.conid).collect();

    let mut iteration: u64 = 0;
    loop {
        if *shutdown.borrow() {
            info!("tick streamer stopping, shutdown already requested");
            return;
        }
        iteration += 1;
        info!(iteration, "tick streamer connecting");
        match run_once(&broker, store.clone(), &instruments_by_conid, &conids, &mut shutdown).await {
            Ok(()) => {
                if *shutdown.borrow() {
                    return;
                }
                warn!("tick socket closed cleanly, reconnecting");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(err) => {
                warn!(%err, "tick socket failed, reconnecting");
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

async fn run_once(
    broker: &BrokerClient,
    store: Arc<dyn StoreAdapter>,
    instruments_by_conid: &HashMap<i64, Instrument>,
    conids: &[i64],
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), crate::error::IngestError> {
    let url = broker.socket_url();
    let (ws, _response) = tokio_tungstenite::connect_async(&url).await?;
    let (mut write, mut read) = ws.split();

    let subs = Arc::new(SubscriptionManager::new(conids));
    let unauthenticated = Arc::new(AtomicBool::new(false));
    let (last_read_tx, last_read_rx) = watch::channel(Instant::now());

    let watchdog_unauthenticated = unauthenticated.clone();
    let watchdog = tokio::spawn(watchdog_task(last_read_rx, watchdog_unauthenticated));

    let mut tic_interval = tokio::time::interval(TIC_EVERY);
    tic_interval.tick().await; // first tick fires immediately; consume it so TIC_EVERY is the real cadence
    let mut last_echo = Instant::now();

    loop {
        if unauthenticated.load(Ordering::Relaxed) {
            watchdog.abort();
            return Err(crate::error::IngestError::Unauthenticated);
        }

        let stale = subs.stale();
        for conid in stale {
            write.send(Message::Text(subscribe_frame(conid))).await?;
        }

        tokio::select! {
            _ = shutdown.changed() => {
                watchdog.abort();
                for &conid in conids {
                    let _ = write.send(Message::Text(unsubscribe_frame(conid))).await;
                }
                return Ok(());
            }
            _ = tic_interval.tick() => {
                write.send(Message::Text("tic".to_string())).await?;
            }
            next = tokio::time::timeout(RECV_TIMEOUT, read.next()) => {
                let msg = match next {
                    Ok(Some(Ok(m))) => m,
                    Ok(Some(Err(err))) => {
                        watchdog.abort();
                        return Err(err.into());
                    }
                    Ok(None) => {
                        watchdog.abort();
                        return Ok(());
                    }
                    Err(_) => {
                        watchdog.abort();
                        return Err(crate::error::IngestError::DeadlineExceeded);
                    }
                };

                let _ = last_read_tx.send(Instant::now());

                let text = match msg {
                    Message::Text(t) => t,
                    Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                    Message::Close(_) => {
                        watchdog.abort();
                        return Ok(());
                    }
                    _ => continue,
                };

                if text == "ech+hb" {
                    continue;
                }

                match dispatch(&text, instruments_by_conid) {
                    Dispatch::NeedsAuth => {
                        let cp = broker.cookie("cp").unwrap_or_default();
                        write
                            .send(Message::Text(format!("{{\"session\":\"{cp}\"}}")))
                            .await?;
                    }
                    Dispatch::MarketData(tick) => {
                        subs.mark_seen(tick.conid);
                        if let Some(instrument) = instruments_by_conid.get(&tick.conid) {
                            let payload = serde_json::to_string(&tick)?;
                            store.publish(&instrument.key(), &payload).await?;
                        }
                    }
                    Dispatch::Heartbeat => {
                        if last_echo.elapsed() >= HEARTBEAT_ECHO_EVERY {
                            write.send(Message::Text("ech+hb".to_string())).await?;
                            last_echo = Instant::now();
                        }
                    }
                    Dispatch::Unauthenticated => {
                        watchdog.abort();
                        return Err(crate::error::IngestError::Unauthenticated);
                    }
                    Dispatch::Ignored => {}
                }
            }
        }
    }
}

/// Sibling task: force-closes the socket by signalling `unauthenticated`
/// style flag is not its job; it only tracks staleness by itself via the
/// watch channel's built-in closed/changed semantics, leaving the actual
/// force-reconnect to `run_once`'s own `RECV_TIMEOUT` select arm. Kept
/// minimal: this task exists to demonstrate the last-read timestamp is
/// observable by a sibling, per the watchdog-as-sibling-task design.
async fn watchdog_task(mut last_read_rx: watch::Receiver<Instant>, unauthenticated: Arc<AtomicBool>) {
    loop {
        tokio::time::sleep(RECV_TIMEOUT).await;
        let last = *last_read_rx.borrow();
        if last.elapsed() > RECV_TIMEOUT {
            unauthenticated.store(true, Ordering::Relaxed);
            return;
        }
        if last_read_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruments() -> HashMap<i64, Instrument> {
        let mut map = HashMap::new();
        map.insert(
            265598,
            Instrument {
                conid: 265598,
                symbol: "AAPL".into(),
                exchange: "NASDAQ".into(),
                calendar: crate::types::CalendarCode::Nasdaq,
            },
        );
        map
    }

    #[test]
    fn dispatches_waiting_for_session_as_needs_auth() {
        let frame = r#"{"message":"waiting for session"}"#;
        assert_eq!(dispatch(frame, &instruments()), Dispatch::NeedsAuth);
    }

    #[test]
    fn dispatches_heartbeat() {
        let frame = r#"{"hb":1719000000000}"#;
        assert_eq!(dispatch(frame, &instruments()), Dispatch::Heartbeat);
    }

    #[test]
    fn dispatches_market_data_with_price_and_conid() {
        let frame = r#"{"topic":"smd+265598","31":"189.25","conid":265598,"_updated":1719000000000}"#;
        match dispatch(frame, &instruments()) {
            Dispatch::MarketData(tick) => {
                assert_eq!(tick.conid, 265598);
                assert_eq!(tick.price, 189.25);
                assert_eq!(tick.symbol, "AAPL.NASDAQ");
            }
            other => panic!("expected MarketData, got {other:?}"),
        }
    }

    #[test]
    fn market_data_without_conid_in_instrument_table_is_ignored() {
        let frame = r#"{"topic":"smd+999","31":"10.0","conid":999,"_updated":1719000000000}"#;
        assert_eq!(dispatch(frame, &instruments()), Dispatch::Ignored);
    }

    #[test]
    fn dispatches_unauthenticated_status() {
        let frame = r#"{"topic":"sts","args":{"authenticated":false}}"#;
        assert_eq!(dispatch(frame, &instruments()), Dispatch::Unauthenticated);
    }

    #[test]
    fn ignores_other_topics() {
        for topic in ["system", "nt", "blt", "tic", "sor", "uor", "str", "utr", "spl", "upl"] {
            let frame = format!(r#"{{"topic":"{topic}"}}"#);
            assert_eq!(dispatch(&frame, &instruments()), Dispatch::Ignored);
        }
    }

    #[test]
    fn unsubscribe_frame_preserves_literal_wire_format() {
        assert_eq!(unsubscribe_frame(265598), "umd+265598{}");
    }

    #[test]
    fn subscribe_frame_matches_protocol_shape() {
        assert_eq!(subscribe_frame(265598), "smd+265598+{\"fields\":[\"31\"]}");
    }

    #[test]
    fn subscription_manager_flags_stale_conids_immediately_when_never_seen() {
        let mgr = SubscriptionManager::new(&[1, 2]);
        // Freshly constructed entries are not yet older than the threshold.
        assert!(mgr.stale().is_empty());
        mgr.mark_seen(1);
        assert!(mgr.stale().is_empty());
    }
}
