use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// Amounts are kept in the smallest currency unit (18 decimals, like wei) as a
// u128. Every operation that can overflow or underflow is checked and returns
// `None`, so callers have to decide what an overflow means for them.
//
// The decimal text form ("0.05") is only used at the edges: parsing user input
// and serializing snapshots. Floats are never involved, so "0.1" is exactly
// 100_000_000_000_000_000 units and not an approximation of it.

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum AmountParseError {
    #[error("Empty")]
    Empty,
    #[error("InvalidDigit")]
    InvalidDigit,
    #[error("Overflow")]
    Overflow,
    #[error("TooPrecise")]
    TooPrecise,
}

impl AmountParseError {
    pub fn to_deserializer_error<E>(&self, raw: &str) -> E
    where
        E: serde::de::Error,
    {
        let msg = match self {
            AmountParseError::Empty => "a non-empty decimal amount",
            AmountParseError::InvalidDigit => "a decimal amount",
            AmountParseError::Overflow => "an amount that fits in 128 bits of units",
            AmountParseError::TooPrecise => "at most 18 digits after decimal",
        };
        serde::de::Error::invalid_value(serde::de::Unexpected::Str(raw), &msg)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Self = Amount(0);
    pub const MAX: Self = Amount(u128::MAX);
    pub const DECIMALS: u32 = 18;

    const UNIT: u128 = 10u128.pow(Self::DECIMALS);

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn checked_mul(self, factor: u64) -> Option<Self> {
        self.0.checked_mul(u128::from(factor)).map(Amount)
    }
}

impl From<u128> for Amount {
    fn from(units: u128) -> Self {
        Amount(units)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let is_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if !is_digits(whole) || !is_digits(fraction) {
            return Err(AmountParseError::InvalidDigit);
        }

        // Trailing zeros carry no precision, "1.5000000000000000000" is fine.
        let fraction = fraction.trim_end_matches('0');
        if fraction.len() > Self::DECIMALS as usize {
            return Err(AmountParseError::TooPrecise);
        }

        // Only digits are left at this point, so a parse failure is an overflow.
        let whole_units = if whole.is_empty() {
            0
        } else {
            whole.parse::<u128>().map_err(|_| AmountParseError::Overflow)?
        };
        let fraction_units = if fraction.is_empty() {
            0
        } else {
            let digits = fraction.parse::<u128>().map_err(|_| AmountParseError::Overflow)?;
            digits * 10u128.pow(Self::DECIMALS - fraction.len() as u32)
        };

        whole_units
            .checked_mul(Self::UNIT)
            .and_then(|units| units.checked_add(fraction_units))
            .map(Amount)
            .ok_or(AmountParseError::Overflow)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let whole = self.0 / Self::UNIT;
        let fraction = self.0 % Self::UNIT;
        if fraction == 0 {
            return f.write_fmt(format_args!("{whole}"));
        }

        // Example: 50_000_000_000_000_000 => "050000000000000000" => "0.05"
        let padded = format!("{fraction:018}");
        f.write_fmt(format_args!("{whole}.{}", padded.trim_end_matches('0')))
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<Amount>()
            .map_err(|err| err.to_deserializer_error::<D::Error>(&raw))
    }
}
