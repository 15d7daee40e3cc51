//! Coin amounts
//!
//! Every monetary value inside the engine is a [`Coins`] value: a signed count of
//! minor units (1/100 of a coin). Binary floating point never touches a balance.
//! Conversion to and from [`Decimal`] happens only at the service boundary and
//! rounds half-to-even at two decimal places.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Number of minor units in one coin.
pub const MINOR_UNITS_PER_COIN: i64 = 100;

/// Decimal places carried by every amount at the boundary.
pub const COIN_SCALE: u32 = 2;

/// An amount of coins stored as integer minor units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Coins(i64);

impl Coins {
    /// Zero coins
    pub const ZERO: Coins = Coins(0);

    /// Build an amount from raw minor units.
    pub const fn from_minor(minor: i64) -> Self {
        Coins(minor)
    }

    /// Build an amount from whole coins.
    pub const fn from_whole(coins: i64) -> Self {
        Coins(coins * MINOR_UNITS_PER_COIN)
    }

    /// Raw minor units.
    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Convert a decimal amount into coins.
    ///
    /// The value is rounded half-to-even at two decimal places first, so
    /// `0.125` becomes `0.12` and `0.135` becomes `0.14`.
    ///
    /// # Returns
    ///
    /// `None` if the rounded value does not fit into the minor-unit range.
    pub fn from_decimal(value: Decimal) -> Option<Self> {
        let rounded = value.round_dp_with_strategy(COIN_SCALE, RoundingStrategy::MidpointNearestEven);
        rounded
            .checked_mul(Decimal::from(MINOR_UNITS_PER_COIN))?
            .to_i64()
            .map(Coins)
    }

    /// Two-decimal representation of the amount.
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, COIN_SCALE)
    }

    /// Apply a rate (for example a discount percentage) and round the result
    /// half-to-even to the nearest minor unit.
    ///
    /// The rate must lie in `[0, 1]`, which keeps the result within the range of
    /// `self`.
    pub fn apply_rate(self, rate: Decimal) -> Coins {
        let scaled = (Decimal::from(self.0) * rate)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
        Coins(scaled.to_i64().unwrap_or(self.0))
    }

    pub fn checked_add(self, other: Coins) -> Option<Coins> {
        self.0.checked_add(other.0).map(Coins)
    }

    pub fn checked_sub(self, other: Coins) -> Option<Coins> {
        self.0.checked_sub(other.0).map(Coins)
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl Add for Coins {
    type Output = Coins;

    fn add(self, rhs: Coins) -> Coins {
        Coins(self.0 + rhs.0)
    }
}

impl AddAssign for Coins {
    fn add_assign(&mut self, rhs: Coins) {
        self.0 += rhs.0;
    }
}

impl Sub for Coins {
    type Output = Coins;

    fn sub(self, rhs: Coins) -> Coins {
        Coins(self.0 - rhs.0)
    }
}

impl SubAssign for Coins {
    fn sub_assign(&mut self, rhs: Coins) {
        self.0 -= rhs.0;
    }
}

impl Sum for Coins {
    fn sum<I: Iterator<Item = Coins>>(iter: I) -> Coins {
        iter.fold(Coins::ZERO, |acc, c| acc + c)
    }
}

impl<'a> Sum<&'a Coins> for Coins {
    fn sum<I: Iterator<Item = &'a Coins>>(iter: I) -> Coins {
        iter.copied().sum()
    }
}
