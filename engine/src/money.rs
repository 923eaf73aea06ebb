//! Arbitrary-precision money.
//!
//! Asset quantities travel as non-negative integers in the asset's base
//! units; USD figures as integers scaled by 10^8. Both are representable far
//! beyond 256 bits, so everything is backed by a signed big integer and
//! serialized as a decimal string on the wire.

use std::{
	fmt,
	ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign},
	str::FromStr,
};

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{constants::USD_DECIMALS, errors::LedgerError};

/// Signed arbitrary-precision integer amount.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(BigInt);

impl Amount {
	pub fn zero() -> Self {
		Self(BigInt::zero())
	}

	/// Parse a decimal integer string. Accepts an optional leading minus
	/// followed by ASCII digits only; everything else is rejected.
	pub fn parse(s: &str) -> Result<Self, LedgerError> {
		let digits = s.strip_prefix('-').unwrap_or(s);
		if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
			return Err(LedgerError::InvalidInput(format!("invalid number `{s}`")));
		}
		// The characters are vetted above, so this cannot fail.
		BigInt::from_str(s)
			.map(Self)
			.map_err(|e| LedgerError::InvalidInput(format!("invalid number `{s}`: {e}")))
	}

	/// Convert a human-readable decimal (e.g. "1.5") into base units given
	/// the asset's number of decimals. The fractional part must fit in
	/// `decimals` digits; excess precision is rejected rather than silently
	/// dropped.
	pub fn from_decimal_str(s: &str, decimals: u32) -> Result<Self, LedgerError> {
		let (sign, unsigned) = match s.strip_prefix('-') {
			Some(rest) => (-1, rest),
			None => (1, s),
		};
		let (int_part, frac_part) = match unsigned.split_once('.') {
			Some((i, f)) => (i, f),
			None => (unsigned, ""),
		};
		if int_part.is_empty() && frac_part.is_empty() {
			return Err(LedgerError::InvalidInput(format!("invalid decimal `{s}`")));
		}
		if !int_part.bytes().all(|b| b.is_ascii_digit()) ||
			!frac_part.bytes().all(|b| b.is_ascii_digit())
		{
			return Err(LedgerError::InvalidInput(format!("invalid decimal `{s}`")));
		}
		if frac_part.len() > decimals as usize {
			return Err(LedgerError::InvalidInput(format!(
				"`{s}` has more than {decimals} fractional digits"
			)));
		}
		let mut value = BigInt::from_str(if int_part.is_empty() { "0" } else { int_part })
			.map_err(|e| LedgerError::InvalidInput(format!("invalid decimal `{s}`: {e}")))? *
			pow10(decimals);
		if !frac_part.is_empty() {
			let frac = BigInt::from_str(frac_part)
				.map_err(|e| LedgerError::InvalidInput(format!("invalid decimal `{s}`: {e}")))?;
			value += frac * pow10(decimals - frac_part.len() as u32);
		}
		Ok(Self(value * sign))
	}

	/// Render base units as a human-readable decimal with `decimals`
	/// fractional digits, trimming trailing zeros.
	pub fn to_decimal_string(&self, decimals: u32) -> String {
		if decimals == 0 {
			return self.0.to_string();
		}
		let scale = pow10(decimals);
		let magnitude = self.0.magnitude();
		let (int_part, frac_part) =
			(magnitude / scale.magnitude(), magnitude % scale.magnitude());
		let sign = if self.0.is_negative() { "-" } else { "" };
		let frac = frac_part.to_string();
		let frac = format!("{frac:0>width$}", width = decimals as usize);
		let frac = frac.trim_end_matches('0');
		if frac.is_empty() {
			format!("{sign}{int_part}")
		} else {
			format!("{sign}{int_part}.{frac}")
		}
	}

	/// Total USD value (10^8-scaled) of `self` base units priced at
	/// `usd_rate` USD per whole unit. Division truncates toward zero.
	pub fn usd_value(&self, usd_rate: &Amount, decimals: u32) -> Amount {
		Self(&self.0 * &usd_rate.0 / pow10(decimals))
	}

	pub fn is_zero(&self) -> bool {
		self.0.is_zero()
	}

	pub fn is_negative(&self) -> bool {
		self.0.is_negative()
	}

	pub fn is_positive(&self) -> bool {
		self.0.is_positive()
	}
}

/// 10^exp as a big integer.
pub fn pow10(exp: u32) -> BigInt {
	BigInt::from(10u32).pow(exp)
}

/// A whole-dollar figure as a 10^8-scaled `Amount`.
pub fn usd(dollars: i64) -> Amount {
	Amount(BigInt::from(dollars) * pow10(USD_DECIMALS))
}

impl fmt::Display for Amount {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<i64> for Amount {
	fn from(v: i64) -> Self {
		Self(BigInt::from(v))
	}
}

impl From<u64> for Amount {
	fn from(v: u64) -> Self {
		Self(BigInt::from(v))
	}
}

impl From<BigInt> for Amount {
	fn from(v: BigInt) -> Self {
		Self(v)
	}
}

impl FromStr for Amount {
	type Err = LedgerError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl Add for Amount {
	type Output = Amount;

	fn add(self, rhs: Amount) -> Amount {
		Amount(self.0 + rhs.0)
	}
}

impl<'a> Add<&'a Amount> for Amount {
	type Output = Amount;

	fn add(self, rhs: &'a Amount) -> Amount {
		Amount(self.0 + &rhs.0)
	}
}

impl AddAssign<&Amount> for Amount {
	fn add_assign(&mut self, rhs: &Amount) {
		self.0 += &rhs.0;
	}
}

impl Sub for Amount {
	type Output = Amount;

	fn sub(self, rhs: Amount) -> Amount {
		Amount(self.0 - rhs.0)
	}
}

impl<'a> Sub<&'a Amount> for Amount {
	type Output = Amount;

	fn sub(self, rhs: &'a Amount) -> Amount {
		Amount(self.0 - &rhs.0)
	}
}

impl SubAssign<&Amount> for Amount {
	fn sub_assign(&mut self, rhs: &Amount) {
		self.0 -= &rhs.0;
	}
}

impl Mul for Amount {
	type Output = Amount;

	fn mul(self, rhs: Amount) -> Amount {
		Amount(self.0 * rhs.0)
	}
}

impl<'a> Mul<&'a Amount> for Amount {
	type Output = Amount;

	fn mul(self, rhs: &'a Amount) -> Amount {
		Amount(self.0 * &rhs.0)
	}
}

impl Neg for Amount {
	type Output = Amount;

	fn neg(self) -> Amount {
		Amount(-self.0)
	}
}

impl Neg for &Amount {
	type Output = Amount;

	fn neg(self) -> Amount {
		Amount(-&self.0)
	}
}

impl Serialize for Amount {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0.to_string())
	}
}

impl<'de> Deserialize<'de> for Amount {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Amount::parse(&s).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_signed_integers() {
		assert_eq!(Amount::parse("0").unwrap(), Amount::zero());
		assert_eq!(Amount::parse("100000000").unwrap(), Amount::from(100_000_000i64));
		assert_eq!(Amount::parse("-42").unwrap(), Amount::from(-42i64));
	}

	#[test]
	fn rejects_non_numeric_input() {
		for bad in ["", "-", "1.5", "1e9", "0x10", " 1", "1 ", "--1"] {
			assert!(Amount::parse(bad).is_err(), "`{bad}` should be rejected");
		}
	}

	#[test]
	fn survives_values_beyond_u128() {
		let huge = "1".to_string() + &"0".repeat(38);
		let amount = Amount::parse(&huge).unwrap();
		assert_eq!(amount.to_string(), huge);
	}

	#[test]
	fn decimal_conversion_round_trips() {
		let a = Amount::from_decimal_str("1.5", 8).unwrap();
		assert_eq!(a, Amount::from(150_000_000i64));
		assert_eq!(a.to_decimal_string(8), "1.5");

		let b = Amount::from_decimal_str("-0.00000001", 8).unwrap();
		assert_eq!(b, Amount::from(-1i64));
	}

	#[test]
	fn decimal_conversion_rejects_excess_precision() {
		assert!(Amount::from_decimal_str("0.000000001", 8).is_err());
	}

	#[test]
	fn usd_value_truncates_toward_zero() {
		// 1.5 BTC at $50,000 -> $75,000.
		let amount = Amount::from(150_000_000i64);
		assert_eq!(amount.usd_value(&usd(50_000), 8), usd(75_000));

		// 1 base unit at $0.00000003/unit-scale truncates to zero.
		let dust = Amount::from(1i64);
		assert_eq!(dust.usd_value(&Amount::from(3i64), 8), Amount::zero());

		// Negative values truncate toward zero, not -inf.
		let neg = Amount::from(-1i64);
		assert_eq!(neg.usd_value(&Amount::from(3i64), 8), Amount::zero());
	}

	#[test]
	fn serde_round_trips_as_decimal_string() {
		let a = Amount::parse("123456789012345678901234567890").unwrap();
		let json = serde_json::to_string(&a).unwrap();
		assert_eq!(json, "\"123456789012345678901234567890\"");
		assert_eq!(serde_json::from_str::<Amount>(&json).unwrap(), a);
	}
}
