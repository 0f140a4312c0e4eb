use serde::{Deserialize, Serialize};

/// Three-constraint position sizer.
///
/// A base entry takes the minimum of three candidate lot counts:
///   1. risk-based:   floor((equity_high × risk%) / (stop_distance × point_value))
///   2. margin-based: floor(available_margin / margin_per_lot)
///   3. volatility-based (optional): floor((equity × vol%) / (ATR × point_value))
///
/// Sizing uses the equity high-water mark so positions stay consistent
/// through drawdowns. Pyramid adds are additionally capped so that only
/// accumulated excess profit funds the new risk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizer {
    /// Percent of equity risked per entry (e.g. 1.5 = 1.5%).
    pub risk_percent: f64,
    /// Margin requirement per lot in account currency.
    pub margin_per_lot: f64,
    /// Optional volatility budget percent of equity.
    pub vol_percent: Option<f64>,
    /// Multiplier applied per pyramid level (level 1 gets factor^1, ...).
    pub pyramid_shrink_factor: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SizerError {
    #[error("risk_percent must be positive, got {0}")]
    InvalidRiskPercent(f64),
    #[error("margin_per_lot must be positive, got {0}")]
    InvalidMarginPerLot(f64),
    #[error("pyramid_shrink_factor must be in (0, 1], got {0}")]
    InvalidShrinkFactor(f64),
}

/// Which constraint produced the final lot count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limiter {
    Risk,
    Margin,
    Volatility,
    Profit,
    Input,
}

impl Limiter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Limiter::Risk => "risk",
            Limiter::Margin => "margin",
            Limiter::Volatility => "volatility",
            Limiter::Profit => "profit",
            Limiter::Input => "input",
        }
    }
}

/// Sizing result with the per-constraint candidates preserved for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConstraints {
    pub risk_lots: i32,
    pub margin_lots: i32,
    pub vol_lots: Option<i32>,
    pub profit_lots: Option<i32>,
    pub final_lots: i32,
    pub limiter: Limiter,
    pub risk_amount: f64,
    pub risk_per_lot: f64,
}

impl PositionSizer {
    pub fn new(
        risk_percent: f64,
        margin_per_lot: f64,
        vol_percent: Option<f64>,
        pyramid_shrink_factor: f64,
    ) -> Result<Self, SizerError> {
        if risk_percent <= 0.0 {
            return Err(SizerError::InvalidRiskPercent(risk_percent));
        }
        if margin_per_lot <= 0.0 {
            return Err(SizerError::InvalidMarginPerLot(margin_per_lot));
        }
        if pyramid_shrink_factor <= 0.0 || pyramid_shrink_factor > 1.0 {
            return Err(SizerError::InvalidShrinkFactor(pyramid_shrink_factor));
        }
        Ok(Self { risk_percent, margin_per_lot, vol_percent, pyramid_shrink_factor })
    }

    /// Size a base entry. `equity_high` is the high-water mark, `equity` the
    /// live closed equity (volatility constraint), `point_value` the rupee
    /// value of one point of one lot.
    pub fn base_entry(
        &self,
        price: f64,
        stop: f64,
        atr: f64,
        equity_high: f64,
        equity: f64,
        available_margin: f64,
        point_value: f64,
    ) -> SizingConstraints {
        let stop_distance = price - stop;
        if stop_distance <= 0.0 || equity_high <= 0.0 {
            tracing::warn!(price, stop, equity_high, "degenerate sizing inputs, zero lots");
            return SizingConstraints {
                risk_lots: 0,
                margin_lots: 0,
                vol_lots: None,
                profit_lots: None,
                final_lots: 0,
                limiter: Limiter::Risk,
                risk_amount: 0.0,
                risk_per_lot: 0.0,
            };
        }

        let risk_amount = equity_high * (self.risk_percent / 100.0);
        let risk_per_lot = stop_distance * point_value;
        let risk_lots = (risk_amount / risk_per_lot).floor().max(0.0) as i32;

        let margin_lots = (available_margin / self.margin_per_lot).floor().max(0.0) as i32;

        let vol_lots = self.vol_percent.map(|vol_pct| {
            if atr > 0.0 && point_value > 0.0 {
                ((equity * (vol_pct / 100.0)) / (atr * point_value)).floor().max(0.0) as i32
            } else {
                0
            }
        });

        let mut final_lots = risk_lots.min(margin_lots);
        if let Some(v) = vol_lots {
            final_lots = final_lots.min(v);
        }

        let limiter = if final_lots == risk_lots {
            Limiter::Risk
        } else if Some(final_lots) == vol_lots {
            Limiter::Volatility
        } else {
            Limiter::Margin
        };

        tracing::debug!(
            risk_lots,
            margin_lots,
            ?vol_lots,
            final_lots,
            limiter = limiter.as_str(),
            "base entry sized"
        );

        SizingConstraints {
            risk_lots,
            margin_lots,
            vol_lots,
            profit_lots: None,
            final_lots,
            limiter,
            risk_amount,
            risk_per_lot,
        }
    }

    /// Size a pyramid add. On top of the three base constraints, the add is
    /// capped so that its risk is funded by profit in excess of the base
    /// position's original risk, and shrunk per pyramid level.
    #[allow(clippy::too_many_arguments)]
    pub fn pyramid(
        &self,
        price: f64,
        stop: f64,
        atr: f64,
        equity_high: f64,
        equity: f64,
        available_margin: f64,
        point_value: f64,
        profit_after_base_risk: f64,
        pyramid_level: u32,
    ) -> SizingConstraints {
        let mut constraints =
            self.base_entry(price, stop, atr, equity_high, equity, available_margin, point_value);
        if constraints.final_lots == 0 {
            return constraints;
        }

        // Shrink per level before the profit cap so deep pyramids taper off.
        let shrink = self.pyramid_shrink_factor.powi(pyramid_level as i32);
        let shrunk = ((constraints.final_lots as f64) * shrink).floor() as i32;
        if shrunk < constraints.final_lots {
            constraints.final_lots = shrunk;
            constraints.limiter = Limiter::Input;
        }

        // House-money rule: only excess unrealized profit funds the add.
        let profit_lots = if constraints.risk_per_lot > 0.0 {
            (profit_after_base_risk / constraints.risk_per_lot).floor().max(0.0) as i32
        } else {
            0
        };
        constraints.profit_lots = Some(profit_lots);
        if profit_lots < constraints.final_lots {
            constraints.final_lots = profit_lots;
            constraints.limiter = Limiter::Profit;
        }

        tracing::debug!(
            final_lots = constraints.final_lots,
            profit_lots,
            pyramid_level,
            limiter = constraints.limiter.as_str(),
            "pyramid sized"
        );
        constraints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> PositionSizer {
        PositionSizer::new(1.5, 270_000.0, None, 0.5).unwrap()
    }

    #[test]
    fn constructor_validates() {
        assert!(PositionSizer::new(0.0, 270_000.0, None, 0.5).is_err());
        assert!(PositionSizer::new(1.5, 0.0, None, 0.5).is_err());
        assert!(PositionSizer::new(1.5, 270_000.0, None, 0.0).is_err());
        assert!(PositionSizer::new(1.5, 270_000.0, None, 1.5).is_err());
    }

    #[test]
    fn base_entry_takes_minimum_constraint() {
        // equity_high 5,000,000 -> risk 75,000; stop distance 100 x 35 = 3,500/lot
        // risk lots = 21; margin lots = floor(3,000,000 / 270,000) = 11
        let c = sizer().base_entry(
            50_000.0, 49_900.0, 100.0, 5_000_000.0, 5_000_000.0, 3_000_000.0, 35.0,
        );
        assert_eq!(c.risk_lots, 21);
        assert_eq!(c.margin_lots, 11);
        assert_eq!(c.final_lots, 11);
        assert_eq!(c.limiter, Limiter::Margin);
    }

    #[test]
    fn risk_limited_when_margin_is_plentiful() {
        let c = sizer().base_entry(
            50_000.0, 49_900.0, 100.0, 1_000_000.0, 1_000_000.0, 100_000_000.0, 35.0,
        );
        // risk 15,000 / 3,500 = 4 lots
        assert_eq!(c.final_lots, 4);
        assert_eq!(c.limiter, Limiter::Risk);
    }

    #[test]
    fn zero_lots_reports_risk_limiter() {
        // Tiny equity: floor to zero lots.
        let c = sizer().base_entry(
            50_000.0, 49_900.0, 100.0, 100_000.0, 100_000.0, 10_000_000.0, 35.0,
        );
        assert_eq!(c.final_lots, 0);
        assert_eq!(c.limiter, Limiter::Risk);
    }

    #[test]
    fn volatility_constraint_applies_when_configured() {
        let sizer = PositionSizer::new(10.0, 100_000.0, Some(1.0), 0.5).unwrap();
        // vol budget = 1% of 1,000,000 = 10,000; ATR 200 x 35 = 7,000 -> 1 lot
        let c = sizer.base_entry(
            50_000.0, 49_000.0, 200.0, 1_000_000.0, 1_000_000.0, 10_000_000.0, 35.0,
        );
        assert_eq!(c.vol_lots, Some(1));
        assert_eq!(c.final_lots, 1);
        assert_eq!(c.limiter, Limiter::Volatility);
    }

    #[test]
    fn degenerate_stop_gives_zero() {
        let c = sizer().base_entry(
            50_000.0, 50_000.0, 100.0, 5_000_000.0, 5_000_000.0, 3_000_000.0, 35.0,
        );
        assert_eq!(c.final_lots, 0);
    }

    #[test]
    fn pyramid_is_profit_capped() {
        // Base constraints allow 11 lots (margin). Excess profit funds 2.
        let c = sizer().pyramid(
            50_000.0,
            49_900.0,
            100.0,
            5_000_000.0,
            5_000_000.0,
            3_000_000.0,
            35.0,
            7_500.0, // excess profit: 7,500 / 3,500 = 2 lots
            0,
        );
        assert_eq!(c.profit_lots, Some(2));
        assert_eq!(c.final_lots, 2);
        assert_eq!(c.limiter, Limiter::Profit);
    }

    #[test]
    fn pyramid_shrinks_per_level() {
        // Plenty of profit so the shrink factor is the binding constraint.
        let base = sizer().pyramid(
            50_000.0, 49_900.0, 100.0, 5_000_000.0, 5_000_000.0, 3_000_000.0, 35.0,
            10_000_000.0, 0,
        );
        assert_eq!(base.final_lots, 11);

        let level1 = sizer().pyramid(
            50_000.0, 49_900.0, 100.0, 5_000_000.0, 5_000_000.0, 3_000_000.0, 35.0,
            10_000_000.0, 1,
        );
        assert_eq!(level1.final_lots, 5); // floor(11 * 0.5)
        assert_eq!(level1.limiter, Limiter::Input);

        let level2 = sizer().pyramid(
            50_000.0, 49_900.0, 100.0, 5_000_000.0, 5_000_000.0, 3_000_000.0, 35.0,
            10_000_000.0, 2,
        );
        assert_eq!(level2.final_lots, 2); // floor(11 * 0.25)
    }

    #[test]
    fn pyramid_with_no_excess_profit_blocks() {
        let c = sizer().pyramid(
            50_000.0, 49_900.0, 100.0, 5_000_000.0, 5_000_000.0, 3_000_000.0, 35.0, 0.0, 0,
        );
        assert_eq!(c.final_lots, 0);
        assert_eq!(c.limiter, Limiter::Profit);
    }
}
