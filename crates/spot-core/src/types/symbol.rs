//! Instrument metadata and integer-tick price conversion.
//!
//! The provider quotes prices as integer ticks; a symbol's `price_scale`
//! (number of decimal digits) converts them: `price = ticks / 10^scale`.

/// A tradable instrument from the provider's symbol directory.
///
/// `id` is assigned by the provider and only stable for one session; the
/// directory is discarded on disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub id: u64,
    /// Decimal digits of the tick price. `None` until loaded (lazy mode).
    pub price_scale: Option<u32>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, id: u64, price_scale: Option<u32>) -> Self {
        Self { name: name.into(), id, price_scale }
    }
}

/// Convert `ticks` to a decimal price with `digits` fractional digits.
#[inline]
pub fn scale_price(ticks: i64, digits: u32) -> f64 {
    ticks as f64 / 10f64.powi(digits as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_digit_fx() {
        assert!((scale_price(108_345, 5) - 1.08345).abs() < 1e-12);
    }

    #[test]
    fn three_digit_jpy() {
        assert!((scale_price(151_234, 3) - 151.234).abs() < 1e-9);
    }

    #[test]
    fn zero_digits() {
        assert_eq!(scale_price(42, 0), 42.0);
    }
}
