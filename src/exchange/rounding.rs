//! Floor-rounding to exchange lot filters (tick size, step size).

use rust_decimal::Decimal;

/// Floors `value` down to the nearest multiple of `step` (never rounds up,
/// never rounds a multiple away from itself). `step <= 0` is a no-op guard
/// against a misconfigured `LotFilters`.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn floors_down_to_nearest_step() {
        assert_eq!(floor_to_step(dec("1.2345"), dec("0.001")), dec("1.234"));
    }

    #[test]
    fn exact_multiple_is_unchanged() {
        assert_eq!(floor_to_step(dec("1.230"), dec("0.001")), dec("1.230"));
    }

    #[test]
    fn zero_step_is_identity() {
        assert_eq!(floor_to_step(dec("1.2345"), Decimal::ZERO), dec("1.2345"));
    }

    #[test]
    fn never_rounds_up() {
        let rounded = floor_to_step(dec("99.999"), dec("0.01"));
        assert!(rounded <= dec("99.999"));
        assert_eq!(rounded, dec("99.99"));
    }
}
