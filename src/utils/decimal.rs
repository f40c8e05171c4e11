//! Decimal arithmetic helpers for share and price quantities.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Venue tick for both prices and share quantities.
pub const TICK: Decimal = dec!(0.01);

/// Round to tick size (e.g., 0.01 for outcome prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Floor a share quantity to the venue's two decimal places.
pub fn floor_shares(value: Decimal) -> Decimal {
    round_down_to_lot(value, TICK).normalize()
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Profit of a guaranteed $1 payout bought at `cost`, as a percentage of cost.
pub fn profit_pct(cost: Decimal) -> Decimal {
    if cost <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (Decimal::ONE - cost) / cost * dec!(100)
}
