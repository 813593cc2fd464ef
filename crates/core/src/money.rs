use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Invalid amount '{0}'")]
    Invalid(String),
}

/// A monetary amount held at exactly two fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(Decimal);

impl Money {
    /// Rounds half-even to cents and pins the scale, so `12.5` displays as `12.50`.
    pub fn from_decimal(decimal: Decimal) -> Self {
        let mut d = decimal.round_dp(2);
        d.rescale(2);
        Money(d)
    }

    pub fn amount(self) -> Decimal {
        self.0
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    /// Parses a plain period-separated amount such as `1234.56`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim())
            .map(Money::from_decimal)
            .map_err(|_| MoneyError::Invalid(s.to_string()))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.2}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_two_fractional_digits() {
        let m: Money = "12.50".parse().unwrap();
        assert_eq!(m.amount().to_string(), "12.50");
        assert_eq!(m, Money::from_decimal(Decimal::new(1250, 2)));
    }

    #[test]
    fn from_decimal_pads_scale() {
        let m = Money::from_decimal(Decimal::new(125, 1));
        assert_eq!(m.amount().to_string(), "12.50");
        assert_eq!(m.to_string(), "$12.50");
    }

    #[test]
    fn rounds_extra_digits_half_even() {
        assert_eq!("2.345".parse::<Money>().unwrap().amount().to_string(), "2.34");
        assert_eq!("2.355".parse::<Money>().unwrap().amount().to_string(), "2.36");
    }

    #[test]
    fn rejects_garbage() {
        assert!("12,50".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
        assert!("99999999999999999999999999999999999".parse::<Money>().is_err());
    }

    #[test]
    fn serializes_as_decimal_string() {
        let m: Money = "7.5".parse().unwrap();
        assert_eq!(serde_json::to_string(&m).unwrap(), "\"7.50\"");
    }
}
