//! Payment policy
//!
//! Pure functions over a [`PaymentCheck`]: discount by merchant category, and
//! seven validation gates evaluated in order, first failure wins:
//!
//! 1. `original >= min_purchase`
//! 2. the merchant category is known
//! 3. `balance >= coins_required`
//! 4. `balance - coins_required >= min_post_payment_balance`
//! 5. `day_spent + coins_required <= daily_limit`
//! 6. `month_spent + coins_required <= monthly_limit`
//! 7. restaurants only: the local hour lies within business hours
//!
//! The coins paid equal the discount value: paying a restaurant bill of 100.00
//! costs 15.00 coins, which the merchant is credited.

use crate::types::{Coins, PolicyViolation};
use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use std::fmt;

/// Merchant categories the policy knows a discount for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MerchantCategory {
    Restaurant,
    Grocery,
}

impl MerchantCategory {
    /// Parse a registered category name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "restaurant" => Some(MerchantCategory::Restaurant),
            "grocery" => Some(MerchantCategory::Grocery),
            _ => None,
        }
    }
}

impl fmt::Display for MerchantCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MerchantCategory::Restaurant => f.write_str("restaurant"),
            MerchantCategory::Grocery => f.write_str("grocery"),
        }
    }
}

/// One validation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    MinPurchase,
    KnownCategory,
    Balance,
    MinimumReserve,
    DailyLimit,
    MonthlyLimit,
    BusinessHours,
}

impl Gate {
    /// Every gate in evaluation order.
    pub const ALL: [Gate; 7] = [
        Gate::MinPurchase,
        Gate::KnownCategory,
        Gate::Balance,
        Gate::MinimumReserve,
        Gate::DailyLimit,
        Gate::MonthlyLimit,
        Gate::BusinessHours,
    ];
}

/// Inputs of a payment evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentCheck {
    pub original: Coins,
    pub category: Option<MerchantCategory>,
    pub balance: Coins,
    pub day_spent: Coins,
    pub month_spent: Coins,
    pub now: DateTime<Utc>,
}

/// Priced payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub discount_percent: Decimal,
    pub discount_amount: Coins,
    pub coins_required: Coins,
}

/// Policy constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub restaurant_discount: Decimal,
    pub grocery_discount: Decimal,
    pub min_purchase: Coins,
    pub min_post_payment_balance: Coins,
    pub daily_limit: Coins,
    pub monthly_limit: Coins,
    pub signup_bonus: Coins,
    pub referrer_bonus: Coins,
    pub referee_bonus: Coins,
    /// First local hour restaurants accept payments
    pub restaurant_open_hour: u32,
    /// Last local hour restaurants accept payments (inclusive)
    pub restaurant_close_hour: u32,
    /// Account-local time zone for business hours and the monthly window
    pub utc_offset: FixedOffset,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            restaurant_discount: Decimal::new(15, 2),
            grocery_discount: Decimal::new(2, 2),
            min_purchase: Coins::from_whole(1),
            min_post_payment_balance: Coins::from_whole(1),
            daily_limit: Coins::from_whole(100),
            monthly_limit: Coins::from_whole(1_000),
            signup_bonus: Coins::from_whole(10),
            referrer_bonus: Coins::from_whole(5),
            referee_bonus: Coins::from_whole(10),
            restaurant_open_hour: 6,
            restaurant_close_hour: 23,
            utc_offset: Utc.fix(),
        }
    }
}

impl Policy {
    pub fn discount_rate(&self, category: MerchantCategory) -> Decimal {
        match category {
            MerchantCategory::Restaurant => self.restaurant_discount,
            MerchantCategory::Grocery => self.grocery_discount,
        }
    }

    /// Price a payment of `original` at a merchant of `category`.
    pub fn quote(&self, original: Coins, category: MerchantCategory) -> Quote {
        let discount_percent = self.discount_rate(category);
        let discount_amount = original.apply_rate(discount_percent);
        Quote {
            discount_percent,
            discount_amount,
            coins_required: discount_amount,
        }
    }

    /// Whether a merchant of `category` takes payments at `now`.
    pub fn is_open(&self, category: MerchantCategory, now: DateTime<Utc>) -> bool {
        match category {
            MerchantCategory::Grocery => true,
            MerchantCategory::Restaurant => {
                let hour = now.with_timezone(&self.utc_offset).hour();
                (self.restaurant_open_hour..=self.restaurant_close_hour).contains(&hour)
            }
        }
    }

    /// Evaluate a single gate.
    pub fn check(&self, gate: Gate, input: &PaymentCheck) -> Result<(), PolicyViolation> {
        if gate == Gate::MinPurchase {
            return if input.original >= self.min_purchase {
                Ok(())
            } else {
                Err(PolicyViolation::MinPurchase)
            };
        }

        let category = input.category.ok_or(PolicyViolation::UnknownCategory)?;
        let required = self.quote(input.original, category).coins_required;

        let passes = match gate {
            Gate::MinPurchase | Gate::KnownCategory => true,
            Gate::Balance => input.balance >= required,
            Gate::MinimumReserve => input.balance - required >= self.min_post_payment_balance,
            Gate::DailyLimit => input.day_spent + required <= self.daily_limit,
            Gate::MonthlyLimit => input.month_spent + required <= self.monthly_limit,
            Gate::BusinessHours => self.is_open(category, input.now),
        };
        if passes {
            Ok(())
        } else {
            Err(gate.violation())
        }
    }

    /// Run every gate in order and price the payment.
    pub fn evaluate(&self, input: &PaymentCheck) -> Result<Quote, PolicyViolation> {
        for gate in Gate::ALL {
            self.check(gate, input)?;
        }
        let category = input.category.ok_or(PolicyViolation::UnknownCategory)?;
        Ok(self.quote(input.original, category))
    }

    /// Start of the rolling 24h spending window ending at `now`.
    pub fn day_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(24)
    }

    /// Start of the calendar month containing `now`, in account-local time.
    pub fn month_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.utc_offset);
        self.utc_offset
            .with_ymd_and_hms(local.year(), local.month(), 1, 0, 0, 0)
            .single()
            .map(|start| start.with_timezone(&Utc))
            .unwrap_or(now)
    }
}

impl Gate {
    fn violation(self) -> PolicyViolation {
        match self {
            Gate::MinPurchase => PolicyViolation::MinPurchase,
            Gate::KnownCategory => PolicyViolation::UnknownCategory,
            Gate::Balance => PolicyViolation::InsufficientBalance,
            Gate::MinimumReserve => PolicyViolation::BelowMinimumReserve,
            Gate::DailyLimit => PolicyViolation::DailyLimitExceeded,
            Gate::MonthlyLimit => PolicyViolation::MonthlyLimitExceeded,
            Gate::BusinessHours => PolicyViolation::OutsideBusinessHours,
        }
    }
}
