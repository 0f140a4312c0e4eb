//! Strike, expiry and broker-symbol arithmetic.
//!
//! Expiry tokens use the wire format `YYMONDD` (two-digit year, uppercase
//! three-letter month, two-digit day), e.g. `25DEC25`. Option symbols are
//! space-free for the primary broker: `BANKNIFTY25DEC2552000PE`; futures:
//! `GOLDM25DEC31FUT`.

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};

use crate::signal::SignalError;

/// Round a price to the nearest strike on the given interval.
pub fn atm_strike(price: f64, strike_interval: i32) -> i64 {
    let interval = strike_interval.max(1) as f64;
    ((price / interval).round() * interval) as i64
}

/// Strike selection for rollovers: nearest on `strike_interval`, bumped to
/// the nearest 1000 when within `strike_interval` of one and preferred.
pub fn rollover_strike(price: f64, strike_interval: i32, prefer_1000s: bool) -> i64 {
    let base = atm_strike(price, strike_interval);
    if prefer_1000s {
        let thousand = atm_strike(price, 1000);
        if (thousand - base).abs() <= strike_interval as i64 {
            return thousand;
        }
    }
    base
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .map(|d| d - Duration::days(1))
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 28).unwrap_or_default())
}

fn last_wednesday_of_month(year: i32, month: u32) -> NaiveDate {
    let last = last_day_of_month(year, month);
    let offset = (last.weekday().num_days_from_monday() as i64 + 7
        - Weekday::Wed.num_days_from_monday() as i64)
        % 7;
    last - Duration::days(offset)
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Monthly index-option expiry: last Wednesday of the month, rolled to next
/// month when already past it or within `rollover_days` of it.
pub fn monthly_option_expiry(today: NaiveDate, rollover_days: i64) -> NaiveDate {
    let mut expiry = last_wednesday_of_month(today.year(), today.month());
    let days_left = (expiry - today).num_days();
    if today > expiry || days_left < rollover_days {
        let (y, m) = next_month(today.year(), today.month());
        expiry = last_wednesday_of_month(y, m);
    }
    expiry
}

/// Weekly index-option expiry: the next Wednesday strictly after `today`.
pub fn weekly_option_expiry(today: NaiveDate) -> NaiveDate {
    let mut days_ahead = (Weekday::Wed.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64
        + 7)
        % 7;
    if days_ahead == 0 {
        days_ahead = 7;
    }
    today + Duration::days(days_ahead)
}

/// Metals-futures expiry: last calendar day of the month, rolled to next
/// month inside the delivery-avoidance window.
pub fn futures_expiry(today: NaiveDate, rollover_days: i64) -> NaiveDate {
    let mut expiry = last_day_of_month(today.year(), today.month());
    if (expiry - today).num_days() < rollover_days {
        let (y, m) = next_month(today.year(), today.month());
        expiry = last_day_of_month(y, m);
    }
    expiry
}

/// The option expiry one month after the given expiry date: last Wednesday
/// of the following month.
pub fn following_month_option_expiry(current: NaiveDate) -> NaiveDate {
    let (y, m) = next_month(current.year(), current.month());
    last_wednesday_of_month(y, m)
}

/// The futures expiry one month after the given expiry date: last calendar
/// day of the following month.
pub fn following_month_futures_expiry(current: NaiveDate) -> NaiveDate {
    let (y, m) = next_month(current.year(), current.month());
    last_day_of_month(y, m)
}

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// Format a date as the wire expiry token `YYMONDD`.
pub fn format_expiry(date: NaiveDate) -> String {
    format!(
        "{:02}{}{:02}",
        date.year() % 100,
        MONTHS[date.month0() as usize],
        date.day()
    )
}

/// Parse a `YYMONDD` expiry token back to a date.
pub fn parse_expiry(token: &str) -> Result<NaiveDate, SignalError> {
    if token.len() != 7 {
        return Err(SignalError::InvalidTimestamp(token.to_string()));
    }
    let yy: i32 = token[0..2]
        .parse()
        .map_err(|_| SignalError::InvalidTimestamp(token.to_string()))?;
    let mon = &token[2..5];
    let dd: u32 = token[5..7]
        .parse()
        .map_err(|_| SignalError::InvalidTimestamp(token.to_string()))?;
    let month = MONTHS
        .iter()
        .position(|m| *m == mon)
        .ok_or_else(|| SignalError::InvalidTimestamp(token.to_string()))? as u32
        + 1;
    NaiveDate::from_ymd_opt(2000 + yy, month, dd)
        .ok_or_else(|| SignalError::InvalidTimestamp(token.to_string()))
}

/// Days from `today` to an expiry token, floored at zero.
pub fn days_to_expiry(token: &str, today: NaiveDate) -> Result<i64, SignalError> {
    let expiry = parse_expiry(token)?;
    Ok((expiry - today).num_days().max(0))
}

/// Space-free option symbol for the primary broker; the alternate broker
/// format separates the tokens with spaces.
pub fn option_symbol(root: &str, expiry: &str, strike: i64, option_type: &str, spaced: bool) -> String {
    if spaced {
        format!("{root} {expiry} {strike} {option_type}")
    } else {
        format!("{root}{expiry}{strike}{option_type}")
    }
}

pub fn futures_symbol(root: &str, expiry: &str, spaced: bool) -> String {
    if spaced {
        format!("{root} {expiry} FUT")
    } else {
        format!("{root}{expiry}FUT")
    }
}

/// Whether `now` falls inside the instrument's trading session (weekdays
/// between open and close).
pub fn in_market_hours(
    date: NaiveDate,
    time: NaiveTime,
    open: NaiveTime,
    close: NaiveTime,
) -> bool {
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    time >= open && time <= close
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn atm_rounding() {
        assert_eq!(atm_strike(52_040.0, 100), 52_000);
        assert_eq!(atm_strike(52_060.0, 100), 52_100);
        assert_eq!(atm_strike(52_050.0, 100), 52_100);
    }

    #[test]
    fn rollover_strike_prefers_thousands() {
        assert_eq!(rollover_strike(52_060.0, 100, false), 52_100);
        assert_eq!(rollover_strike(52_060.0, 100, true), 52_000);
        // Too far from a 1000-multiple to snap.
        assert_eq!(rollover_strike(52_460.0, 100, true), 52_500);
    }

    #[test]
    fn monthly_expiry_last_wednesday() {
        // December 2025: last Wednesday is the 31st.
        assert_eq!(monthly_option_expiry(d(2025, 12, 1), 7), d(2025, 12, 31));
        // June 2025: last Wednesday is the 25th.
        assert_eq!(monthly_option_expiry(d(2025, 6, 2), 7), d(2025, 6, 25));
    }

    #[test]
    fn monthly_expiry_rolls_inside_window() {
        // 2025-06-25 expiry, 2025-06-20 is 5 days out (< 7): roll to July 30.
        assert_eq!(monthly_option_expiry(d(2025, 6, 20), 7), d(2025, 7, 30));
        // Exactly 7 days out stays on the current month.
        assert_eq!(monthly_option_expiry(d(2025, 6, 18), 7), d(2025, 6, 25));
        // Past expiry rolls forward.
        assert_eq!(monthly_option_expiry(d(2025, 6, 26), 7), d(2025, 7, 30));
    }

    #[test]
    fn weekly_expiry_next_wednesday() {
        assert_eq!(weekly_option_expiry(d(2025, 6, 2)), d(2025, 6, 4)); // Mon -> Wed
        assert_eq!(weekly_option_expiry(d(2025, 6, 4)), d(2025, 6, 11)); // Wed -> next Wed
        assert_eq!(weekly_option_expiry(d(2025, 6, 6)), d(2025, 6, 11)); // Fri -> next Wed
    }

    #[test]
    fn metals_expiry_month_end() {
        assert_eq!(futures_expiry(d(2025, 6, 2), 8), d(2025, 6, 30));
        // Inside the 8-day delivery window: roll to July 31.
        assert_eq!(futures_expiry(d(2025, 6, 24), 8), d(2025, 7, 31));
        // Exactly 8 days out stays.
        assert_eq!(futures_expiry(d(2025, 6, 22), 8), d(2025, 6, 30));
    }

    #[test]
    fn following_month_expiries() {
        // After the June 25 option expiry comes July 30 (last Wednesday).
        assert_eq!(following_month_option_expiry(d(2025, 6, 25)), d(2025, 7, 30));
        // After the June 30 futures expiry comes July 31.
        assert_eq!(following_month_futures_expiry(d(2025, 6, 30)), d(2025, 7, 31));
        // December wraps the year.
        assert_eq!(following_month_option_expiry(d(2025, 12, 31)), d(2026, 1, 28));
    }

    #[test]
    fn expiry_token_round_trip() {
        let token = format_expiry(d(2025, 12, 31));
        assert_eq!(token, "25DEC31");
        assert_eq!(parse_expiry(&token).unwrap(), d(2025, 12, 31));
        assert!(parse_expiry("25XXX31").is_err());
        assert!(parse_expiry("bogus").is_err());
    }

    #[test]
    fn days_to_expiry_floors_at_zero() {
        assert_eq!(days_to_expiry("25DEC31", d(2025, 12, 24)).unwrap(), 7);
        assert_eq!(days_to_expiry("25DEC31", d(2026, 1, 5)).unwrap(), 0);
    }

    #[test]
    fn symbol_formats() {
        assert_eq!(
            option_symbol("BANKNIFTY", "25DEC25", 52_000, "PE", false),
            "BANKNIFTY25DEC2552000PE"
        );
        assert_eq!(
            option_symbol("BANKNIFTY", "25DEC25", 52_000, "CE", true),
            "BANKNIFTY 25DEC25 52000 CE"
        );
        assert_eq!(futures_symbol("GOLDM", "25DEC31", false), "GOLDM25DEC31FUT");
    }

    #[test]
    fn market_hours_guard() {
        let open = NaiveTime::from_hms_opt(9, 15, 0).unwrap();
        let close = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
        let wed = d(2025, 6, 4);
        let sat = d(2025, 6, 7);
        assert!(in_market_hours(wed, NaiveTime::from_hms_opt(10, 0, 0).unwrap(), open, close));
        assert!(!in_market_hours(wed, NaiveTime::from_hms_opt(15, 31, 0).unwrap(), open, close));
        assert!(!in_market_hours(sat, NaiveTime::from_hms_opt(10, 0, 0).unwrap(), open, close));
    }
}
