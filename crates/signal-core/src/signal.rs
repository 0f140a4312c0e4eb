use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::instrument::Instrument;

/// Signal kind as emitted by the charting platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    BaseEntry,
    Pyramid,
    Exit,
    EodMonitor,
    MarketData,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::BaseEntry => "BASE_ENTRY",
            SignalKind::Pyramid => "PYRAMID",
            SignalKind::Exit => "EXIT",
            SignalKind::EodMonitor => "EOD_MONITOR",
            SignalKind::MarketData => "MARKET_DATA",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SignalError> {
        match s {
            "BASE_ENTRY" => Ok(SignalKind::BaseEntry),
            "PYRAMID" => Ok(SignalKind::Pyramid),
            "EXIT" => Ok(SignalKind::Exit),
            "EOD_MONITOR" => Ok(SignalKind::EodMonitor),
            "MARKET_DATA" => Ok(SignalKind::MarketData),
            other => Err(SignalError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("unknown signal type: {0}")]
    UnknownKind(String),
    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),
    #[error("invalid position label: {0}")]
    InvalidPosition(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid numeric field {field}: {value}")]
    InvalidNumeric { field: &'static str, value: String },
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Immutable trading signal produced by the webhook ingress.
///
/// The timestamp is always timezone-aware; naive timestamps are rejected at
/// the ingress boundary so downstream validation only ever compares UTC
/// instants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: Instrument,
    pub kind: SignalKind,
    /// `Long_1`..`Long_6`, or `ALL` (EXIT only).
    pub position: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    /// Protective stop. Optional for EXIT / MARKET_DATA signals.
    pub stop: Option<f64>,
    pub suggested_lots: Option<i32>,
    pub atr: f64,
    /// Efficiency ratio, 0..1.
    pub er: f64,
    pub supertrend: f64,
    /// Required for EXIT signals.
    pub reason: Option<String>,
}

impl Signal {
    /// Stable fingerprint over the identifying fields, used for dedup and
    /// audit correlation. Truncated SHA-256 (16 hex chars).
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.instrument.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.position.as_bytes());
        hasher.update(b"|");
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(b"|");
        hasher.update(format!("{:.2}", self.price).as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }

    /// Fingerprint used for EOD dedup: a later bar-close signal carrying the
    /// same bar timestamp must match what the EOD tracker recorded.
    pub fn eod_fingerprint(&self) -> String {
        format!("{}:{}", self.instrument.as_str(), self.timestamp.to_rfc3339())
    }

    /// Age of the signal relative to `now`.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.timestamp).num_milliseconds() as f64 / 1000.0
    }

    /// Pyramid level implied by the position label: `Long_2` is the first
    /// add (level 0), `Long_3` the second (level 1), and so on.
    pub fn pyramid_level(&self) -> u32 {
        parse_position_number(&self.position)
            .map(|n| n.saturating_sub(2))
            .unwrap_or(0)
    }
}

/// Validate a position label: `Long_1`..`Long_6`, or `ALL` when
/// `allow_all` is set (EXIT signals).
pub fn validate_position_label(label: &str, allow_all: bool) -> Result<(), SignalError> {
    if allow_all && label.eq_ignore_ascii_case("ALL") {
        return Ok(());
    }
    match parse_position_number(label) {
        Some(n) if (1..=6).contains(&n) => Ok(()),
        _ => Err(SignalError::InvalidPosition(label.to_string())),
    }
}

fn parse_position_number(label: &str) -> Option<u32> {
    label.strip_prefix("Long_")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(kind: SignalKind) -> Signal {
        Signal {
            instrument: Instrument::BankNifty,
            kind,
            position: "Long_1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
            price: 50_000.0,
            stop: Some(49_900.0),
            suggested_lots: Some(1),
            atr: 100.0,
            er: 0.5,
            supertrend: 49_800.0,
            reason: None,
        }
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = sample(SignalKind::BaseEntry);
        let b = sample(SignalKind::BaseEntry);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }

    #[test]
    fn fingerprint_changes_with_identity_fields() {
        let a = sample(SignalKind::BaseEntry);
        let mut b = sample(SignalKind::BaseEntry);
        b.price = 50_001.0;
        assert_ne!(a.fingerprint(), b.fingerprint());

        let c = sample(SignalKind::Pyramid);
        assert_ne!(a.fingerprint(), c.fingerprint());

        let mut d = sample(SignalKind::BaseEntry);
        d.position = "Long_2".to_string();
        assert_ne!(a.fingerprint(), d.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_non_identity_fields() {
        let a = sample(SignalKind::BaseEntry);
        let mut b = sample(SignalKind::BaseEntry);
        b.atr = 250.0;
        b.er = 0.9;
        b.reason = Some("whatever".to_string());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn position_labels() {
        assert!(validate_position_label("Long_1", false).is_ok());
        assert!(validate_position_label("Long_6", false).is_ok());
        assert!(validate_position_label("Long_7", false).is_err());
        assert!(validate_position_label("Long_0", false).is_err());
        assert!(validate_position_label("Short_1", false).is_err());
        assert!(validate_position_label("ALL", false).is_err());
        assert!(validate_position_label("ALL", true).is_ok());
    }

    #[test]
    fn pyramid_levels() {
        let mut s = sample(SignalKind::Pyramid);
        s.position = "Long_2".to_string();
        assert_eq!(s.pyramid_level(), 0);
        s.position = "Long_4".to_string();
        assert_eq!(s.pyramid_level(), 2);
        s.position = "Long_1".to_string();
        assert_eq!(s.pyramid_level(), 0);
    }

    #[test]
    fn kind_round_trip() {
        for kind in [
            SignalKind::BaseEntry,
            SignalKind::Pyramid,
            SignalKind::Exit,
            SignalKind::EodMonitor,
            SignalKind::MarketData,
        ] {
            assert_eq!(SignalKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(SignalKind::parse("SHORT_ENTRY").is_err());
    }
}
