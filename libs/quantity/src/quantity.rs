//! The [`Quantity`] type.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::QuantityError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;
pub const PIB: u64 = 1024 * TIB;
pub const EIB: u64 = 1024 * PIB;

/// Binary suffixes, largest first. Used for formatting.
const BINARY_UNITS: [(&str, u64); 6] = [
    ("Ei", EIB),
    ("Pi", PIB),
    ("Ti", TIB),
    ("Gi", GIB),
    ("Mi", MIB),
    ("Ki", KIB),
];

/// Longest fractional part accepted when parsing.
const MAX_FRACTION_DIGITS: usize = 20;

/// A non-negative storage quantity in bytes.
///
/// Arithmetic saturates instead of wrapping or panicking: ledger totals are
/// display values and a saturated sum is still a valid upper bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(u64);

impl Quantity {
    /// The zero quantity.
    pub const ZERO: Quantity = Quantity(0);

    /// Creates a quantity from a raw byte count.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Creates a quantity of `n` gibibytes.
    #[must_use]
    pub const fn from_gib(n: u64) -> Self {
        Self(n.saturating_mul(GIB))
    }

    /// Creates a quantity of `n` mebibytes.
    #[must_use]
    pub const fn from_mib(n: u64) -> Self {
        Self(n.saturating_mul(MIB))
    }

    /// Returns the raw byte count.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Subtracts `other`, returning `None` if the result would be negative.
    #[must_use]
    pub const fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Quantity(v)),
            None => None,
        }
    }

    /// Subtracts `other`, clamping at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }

    /// Adds `other`, clamping at `u64::MAX` bytes.
    #[must_use]
    pub const fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }

    /// Parses a quantity string such as `10Gi`, `500M` or `1048576`.
    pub fn parse(s: &str) -> Result<Self, QuantityError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }
        if s.starts_with('-') {
            return Err(QuantityError::Negative(s.to_string()));
        }

        let unsigned = s.strip_prefix('+').unwrap_or(s);
        let split = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(split);

        let multiplier =
            suffix_multiplier(suffix).ok_or_else(|| QuantityError::UnknownSuffix(suffix.to_string()))?;

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty())
            || fraction.contains('.')
            || fraction.len() > MAX_FRACTION_DIGITS
        {
            return Err(QuantityError::InvalidNumber(s.to_string()));
        }

        let whole_value: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| QuantityError::Overflow(s.to_string()))?
        };

        let mut bytes = whole_value
            .checked_mul(multiplier)
            .ok_or_else(|| QuantityError::Overflow(s.to_string()))?;

        if !fraction.is_empty() {
            let fraction_value: u128 = fraction
                .parse()
                .map_err(|_| QuantityError::InvalidNumber(s.to_string()))?;
            let scale = 10u128.pow(fraction.len() as u32);
            // Round partial bytes up, as the orchestration API does.
            let fraction_bytes = (fraction_value * multiplier).div_ceil(scale);
            bytes = bytes
                .checked_add(fraction_bytes)
                .ok_or_else(|| QuantityError::Overflow(s.to_string()))?;
        }

        u64::try_from(bytes)
            .map(Quantity)
            .map_err(|_| QuantityError::Overflow(s.to_string()))
    }
}

fn suffix_multiplier(suffix: &str) -> Option<u128> {
    let multiplier = match suffix {
        "" => 1,
        "Ki" => KIB as u128,
        "Mi" => MIB as u128,
        "Gi" => GIB as u128,
        "Ti" => TIB as u128,
        "Pi" => PIB as u128,
        "Ei" => EIB as u128,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };
    Some(multiplier)
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0");
        }
        for (suffix, unit) in BINARY_UNITS {
            if self.0 % unit == 0 {
                return write!(f, "{}{}", self.0 / unit, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        self.saturating_add(rhs)
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        *self = self.saturating_add(rhs);
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Self {
        iter.fold(Quantity::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Quantity> for Quantity {
    fn sum<I: Iterator<Item = &'a Quantity>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl Serialize for Quantity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(QuantityVisitor)
    }
}

struct QuantityVisitor;

impl Visitor<'_> for QuantityVisitor {
    type Value = Quantity;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a quantity string like \"10Gi\" or a non-negative integer")
    }

    fn visit_str<E>(self, v: &str) -> Result<Quantity, E>
    where
        E: de::Error,
    {
        Quantity::parse(v).map_err(E::custom)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Quantity, E>
    where
        E: de::Error,
    {
        Ok(Quantity(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Quantity, E>
    where
        E: de::Error,
    {
        u64::try_from(v)
            .map(Quantity)
            .map_err(|_| E::custom(QuantityError::Negative(v.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("0", 0)]
    #[case("1048576", MIB)]
    #[case("512Mi", 512 * MIB)]
    #[case("10Gi", 10 * GIB)]
    #[case("1Ti", TIB)]
    #[case("2G", 2_000_000_000)]
    #[case("500k", 500_000)]
    #[case("1.5Gi", GIB + GIB / 2)]
    #[case(" 3Mi ", 3 * MIB)]
    #[case("+4Ki", 4 * KIB)]
    fn test_parse(#[case] input: &str, #[case] bytes: u64) {
        assert_eq!(Quantity::parse(input).unwrap().bytes(), bytes);
    }

    #[test]
    fn test_parse_fraction_rounds_up() {
        // 0.1Ki = 102.4 bytes
        assert_eq!(Quantity::parse("0.1Ki").unwrap().bytes(), 103);
    }

    #[rstest]
    #[case("", QuantityError::Empty)]
    #[case("-1Gi", QuantityError::Negative("-1Gi".to_string()))]
    #[case("10Xi", QuantityError::UnknownSuffix("Xi".to_string()))]
    #[case("Gi", QuantityError::InvalidNumber("Gi".to_string()))]
    #[case("1.2.3", QuantityError::InvalidNumber("1.2.3".to_string()))]
    #[case("16Ei", QuantityError::Overflow("16Ei".to_string()))]
    fn test_parse_errors(#[case] input: &str, #[case] expected: QuantityError) {
        assert_eq!(Quantity::parse(input).unwrap_err(), expected);
    }

    #[rstest]
    #[case(0, "0")]
    #[case(10 * GIB, "10Gi")]
    #[case(9216 * MIB, "9Gi")]
    #[case(3 * MIB, "3Mi")]
    #[case(1536 * MIB, "1536Mi")]
    #[case(1000, "1000")]
    fn test_display(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(Quantity::from_bytes(bytes).to_string(), expected);
    }

    #[test]
    fn test_sub_and_sum() {
        let a = Quantity::from_gib(2);
        let b = Quantity::from_gib(3);
        assert_eq!(a.checked_sub(b), None);
        assert_eq!(a.saturating_sub(b), Quantity::ZERO);
        assert_eq!(b.checked_sub(a), Some(Quantity::from_gib(1)));

        let total: Quantity = [a, b].iter().sum();
        assert_eq!(total, Quantity::from_gib(5));
        assert_eq!(Quantity::from_bytes(u64::MAX) + a, Quantity::from_bytes(u64::MAX));
    }

    #[test]
    fn test_serde_accepts_strings_and_integers() {
        let q: Quantity = serde_json::from_str("\"5Gi\"").unwrap();
        assert_eq!(q, Quantity::from_gib(5));

        let q: Quantity = serde_json::from_str("1024").unwrap();
        assert_eq!(q, Quantity::from_bytes(KIB));

        assert!(serde_json::from_str::<Quantity>("-1").is_err());
        assert_eq!(serde_json::to_string(&Quantity::from_mib(3)).unwrap(), "\"3Mi\"");
    }

    proptest! {
        #[test]
        fn prop_display_parses_back(bytes in any::<u64>()) {
            let q = Quantity::from_bytes(bytes);
            prop_assert_eq!(Quantity::parse(&q.to_string()).unwrap(), q);
        }

        #[test]
        fn prop_sum_never_below_parts(a in any::<u32>(), b in any::<u32>()) {
            let (a, b) = (Quantity::from_bytes(a as u64), Quantity::from_bytes(b as u64));
            let total = a + b;
            prop_assert!(total >= a && total >= b);
            prop_assert_eq!(total.checked_sub(b), Some(a));
        }
    }
}
