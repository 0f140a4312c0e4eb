use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::signal::SignalError;

/// Exchange segment a symbol trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exchange {
    Nfo,
    Mcx,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Nfo => "NFO",
            Exchange::Mcx => "MCX",
        }
    }
}

/// Tradeable instruments known to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Instrument {
    BankNifty,
    GoldMini,
    Copper,
    SilverMini,
}

impl Instrument {
    pub const ALL: [Instrument; 4] = [
        Instrument::BankNifty,
        Instrument::GoldMini,
        Instrument::Copper,
        Instrument::SilverMini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Instrument::BankNifty => "BANK_NIFTY",
            Instrument::GoldMini => "GOLD_MINI",
            Instrument::Copper => "COPPER",
            Instrument::SilverMini => "SILVER_MINI",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SignalError> {
        match s {
            "BANK_NIFTY" => Ok(Instrument::BankNifty),
            "GOLD_MINI" => Ok(Instrument::GoldMini),
            "COPPER" => Ok(Instrument::Copper),
            "SILVER_MINI" => Ok(Instrument::SilverMini),
            other => Err(SignalError::UnknownInstrument(other.to_string())),
        }
    }

    /// Whether entries/exits are executed as a two-leg synthetic future
    /// (short put + long call) instead of a single futures contract.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Instrument::BankNifty)
    }

    pub fn config(&self) -> &'static InstrumentConfig {
        match self {
            Instrument::BankNifty => &BANK_NIFTY,
            Instrument::GoldMini => &GOLD_MINI,
            Instrument::Copper => &COPPER,
            Instrument::SilverMini => &SILVER_MINI,
        }
    }
}

/// Static per-instrument contract parameters.
#[derive(Debug, Clone)]
pub struct InstrumentConfig {
    pub exchange: Exchange,
    /// Symbol root on the wire (e.g. `BANKNIFTY`, `GOLDM`).
    pub symbol_root: &'static str,
    pub lot_size: i32,
    /// Rupee value of one point of one lot.
    pub point_value: f64,
    pub strike_interval: i32,
    /// Days before expiry at which rollover becomes due.
    pub rollover_days: i64,
    /// Market open / close wall-clock times (IST), as (hour, minute).
    pub market_open_hm: (u32, u32),
    pub market_close_hm: (u32, u32),
    /// ATR multiple for the initial and trailing protective stop.
    pub stop_atr_multiple: f64,
}

impl InstrumentConfig {
    pub fn market_open(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.market_open_hm.0, self.market_open_hm.1, 0)
            .unwrap_or(NaiveTime::MIN)
    }

    pub fn market_close(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.market_close_hm.0, self.market_close_hm.1, 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

pub static BANK_NIFTY: InstrumentConfig = InstrumentConfig {
    exchange: Exchange::Nfo,
    symbol_root: "BANKNIFTY",
    lot_size: 35,
    point_value: 35.0,
    strike_interval: 100,
    rollover_days: 7,
    market_open_hm: (9, 15),
    market_close_hm: (15, 30),
    stop_atr_multiple: 2.0,
};

pub static GOLD_MINI: InstrumentConfig = InstrumentConfig {
    exchange: Exchange::Mcx,
    symbol_root: "GOLDM",
    lot_size: 100,
    point_value: 100.0,
    strike_interval: 100,
    rollover_days: 8,
    market_open_hm: (9, 0),
    market_close_hm: (23, 30),
    stop_atr_multiple: 2.0,
};

pub static COPPER: InstrumentConfig = InstrumentConfig {
    exchange: Exchange::Mcx,
    symbol_root: "COPPER",
    lot_size: 2500,
    point_value: 2500.0,
    strike_interval: 5,
    rollover_days: 8,
    market_open_hm: (9, 0),
    market_close_hm: (23, 30),
    stop_atr_multiple: 2.0,
};

pub static SILVER_MINI: InstrumentConfig = InstrumentConfig {
    exchange: Exchange::Mcx,
    symbol_root: "SILVERM",
    lot_size: 5,
    point_value: 5.0,
    strike_interval: 100,
    rollover_days: 8,
    market_open_hm: (9, 0),
    market_close_hm: (23, 30),
    stop_atr_multiple: 2.0,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        for inst in Instrument::ALL {
            assert_eq!(Instrument::parse(inst.as_str()).unwrap(), inst);
        }
        assert!(Instrument::parse("NIFTY").is_err());
    }

    #[test]
    fn synthetic_routing() {
        assert!(Instrument::BankNifty.is_synthetic());
        assert!(!Instrument::GoldMini.is_synthetic());
        assert_eq!(Instrument::BankNifty.config().exchange.as_str(), "NFO");
        assert_eq!(Instrument::GoldMini.config().exchange.as_str(), "MCX");
    }
}
