//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Relative difference of two non-negative values against the larger one,
/// as a percentage. Zero when both are zero.
pub fn imbalance_pct(a: Decimal, b: Decimal) -> Decimal {
    let max = a.max(b);
    let min = a.min(b);
    safe_div(max - min, max) * dec!(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
        assert_eq!(round_down_to_lot(dec!(1.567), Decimal::ZERO), dec!(1.567));
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10), dec!(4)), dec!(2.5));
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_imbalance_pct() {
        assert_eq!(imbalance_pct(dec!(100), dec!(60)), dec!(40));
        assert_eq!(imbalance_pct(dec!(60), dec!(100)), dec!(40));
        assert_eq!(imbalance_pct(dec!(100), dec!(100)), Decimal::ZERO);
        assert_eq!(imbalance_pct(Decimal::ZERO, Decimal::ZERO), Decimal::ZERO);
    }
}
