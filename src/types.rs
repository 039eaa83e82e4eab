// =============================================================================
// Shared data model — instruments, bars, ticks
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::InstrumentConfig;

/// Calendar code an exchange maps onto, per the configuration contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalendarCode {
    Nasdaq,
    Nyse,
    CmeRate,
}

impl CalendarCode {
    /// Map a configured exchange name to its calendar code. Returns `None`
    /// for any exchange outside the known set.
    pub fn from_exchange(exchange: &str) -> Option<Self> {
        match exchange {
            "NASDAQ" => Some(Self::Nasdaq),
            "NYMEX" => Some(Self::Nyse),
            "NYSE" => Some(Self::Nyse),
            "ARCA" => Some(Self::Nyse),
            "GLOBEX" => Some(Self::CmeRate),
            _ => None,
        }
    }

    /// Whether this calendar's equity-style schedule includes pre/post
    /// extended sessions (NYSE and NASDAQ do; CME_Rate does not).
    pub fn has_extended_sessions(self) -> bool {
        matches!(self, Self::Nasdaq | Self::Nyse)
    }
}

/// Immutable descriptor for a tracked instrument, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub conid: i64,
    pub symbol: String,
    pub exchange: String,
    pub calendar: CalendarCode,
}

impl Instrument {
    pub fn from_config(cfg: &InstrumentConfig) -> Self {
        let calendar = CalendarCode::from_exchange(&cfg.exchange)
            .expect("exchange already validated by Config::load");
        Self {
            conid: cfg.conid,
            symbol: cfg.symbol.clone(),
            exchange: cfg.exchange.clone(),
            calendar,
        }
    }

    /// The store key / pub-sub channel suffix for this instrument's bars:
    /// `"<symbol>.<exchange>:TRADES"`.
    pub fn key(&self) -> String {
        format!("{}.{}:TRADES", self.symbol, self.exchange)
    }

    /// The pub-sub channel for this instrument's bar writes.
    pub fn bars_channel(&self) -> String {
        format!("{}.{}:BARS", self.symbol, self.exchange)
    }

    /// `"<symbol>.<exchange>"`, used as the `symbol` field embedded in
    /// published ticks and bars.
    pub fn display_symbol(&self) -> String {
        format!("{}.{}", self.symbol, self.exchange)
    }
}

/// A minute-aligned OHLCV record with provenance flags. At most one of
/// `empty`, `closed`, `error` is set on a given record; `fix`/`late` qualify
/// a numeric bar and may coexist with each other but not with the above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Bar {
    pub dt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub o: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vol: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub late: Option<i32>,
    // Transient fields that may appear on records written by other, older
    // producers. Stripped before comparison; never written by this code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnt: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rth: Option<i32>,
}

impl Bar {
    pub fn closed_at(dt: impl Into<String>) -> Self {
        Self {
            dt: dt.into(),
            closed: Some(1),
            ..Default::default()
        }
    }

    pub fn empty_at(dt: impl Into<String>) -> Self {
        Self {
            dt: dt.into(),
            empty: Some(1),
            ..Default::default()
        }
    }

    pub fn error_at(dt: impl Into<String>, code: i32) -> Self {
        Self {
            dt: dt.into(),
            error: Some(code),
            ..Default::default()
        }
    }

    /// Returns a copy of `self` with the transient/qualifying flags
    /// (`late`, `fix`, `avg`, `cnt`, `rth`) stripped, for equality comparison
    /// against an incoming bar.
    pub fn stripped(&self) -> Self {
        Self {
            late: None,
            fix: None,
            avg: None,
            cnt: None,
            rth: None,
            ..self.clone()
        }
    }

    /// Serialize to the compact separators used for the store member
    /// string: no spaces after `,`/`:`.
    pub fn to_compact_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Normalized last-trade event. Never persisted, only republished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub dt: String,
    pub price: f64,
    pub conid: i64,
    pub symbol: String,
}
