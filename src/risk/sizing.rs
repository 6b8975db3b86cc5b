use crate::models::MarketRules;

/// Tolerance for float noise when flooring to a quantity step
const STEP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizingDecision {
    Size {
        qty: f64,
        /// Before step flooring
        raw_qty: f64,
        risk_quote: f64,
        notional: f64,
    },
    Rejected(SizingRejection),
}

/// Policy rejections; never retried
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizingRejection {
    InvalidPrice,
    ZeroStopDistance,
    ZeroQuantity,
    BelowMinQty { qty: f64, min_qty: f64 },
    BelowMinNotional { notional: f64, min_cost: f64 },
}

impl std::fmt::Display for SizingRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizingRejection::InvalidPrice => write!(f, "entry price must be positive"),
            SizingRejection::ZeroStopDistance => write!(f, "stop distance is zero"),
            SizingRejection::ZeroQuantity => write!(f, "position size rounds to zero"),
            SizingRejection::BelowMinQty { qty, min_qty } => {
                write!(f, "quantity {:.8} below exchange minimum {:.8}", qty, min_qty)
            }
            SizingRejection::BelowMinNotional { notional, min_cost } => {
                write!(f, "notional {:.2} below exchange minimum {:.2}", notional, min_cost)
            }
        }
    }
}

/// Truncate to a multiple of `step`; never rounds up
pub fn floor_to_step(qty: f64, step: Option<f64>) -> f64 {
    match step {
        Some(step) if step > 0.0 => {
            let steps = (qty / step + STEP_EPSILON).floor();
            // Re-round to the step's precision so 0.1 * 3 prints as 0.3
            let decimals = (-step.log10()).ceil().max(0.0) as i32;
            let scale = 10f64.powi(decimals);
            (steps * step * scale).round() / scale
        }
        _ => qty,
    }
}

/// Fixed-fractional position size
///
/// `risk_quote = equity * risk_pct / 100`, `distance = |entry - stop| / entry`,
/// `qty = risk_quote / distance / entry`, floored to the exchange step.
pub fn position_size(
    entry: f64,
    stop: f64,
    equity: f64,
    risk_pct: f64,
    rules: &MarketRules,
) -> SizingDecision {
    if entry <= 0.0 || !entry.is_finite() {
        return SizingDecision::Rejected(SizingRejection::InvalidPrice);
    }

    let risk_quote = equity * risk_pct / 100.0;
    let stop_distance_pct = (entry - stop).abs() / entry;
    if stop_distance_pct <= 0.0 {
        return SizingDecision::Rejected(SizingRejection::ZeroStopDistance);
    }

    let raw_qty = risk_quote / stop_distance_pct / entry;
    let qty = floor_to_step(raw_qty, rules.qty_step);
    if qty <= 0.0 {
        return SizingDecision::Rejected(SizingRejection::ZeroQuantity);
    }

    if let Some(min_qty) = rules.min_qty {
        if qty < min_qty {
            return SizingDecision::Rejected(SizingRejection::BelowMinQty { qty, min_qty });
        }
    }

    let notional = qty * entry;
    if let Some(min_cost) = rules.min_cost {
        if notional < min_cost {
            return SizingDecision::Rejected(SizingRejection::BelowMinNotional {
                notional,
                min_cost,
            });
        }
    }

    SizingDecision::Size {
        qty,
        raw_qty,
        risk_quote,
        notional,
    }
}
