//! Identifiers
//!
//! Domain identifiers (users, merchants, admins) are the ids handed to the engine by
//! the surrounding platform. Ledger identifiers are 128-bit and derived from them:
//!
//! ```text
//! AccountId  = role_code << 64 | domain_id
//! TransferId = created_at_ns << 64 | record_id      (coordinator-issued)
//!            = now_ns << 64 | random64              (free-standing)
//! ```
//!
//! Keeping the record id in the low 64 bits of a transfer id lets the reconciler
//! find the transfer belonging to a pending record without a mapping table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger id of the coin ledger. Every account and transfer belongs to it.
pub const COIN_LEDGER: u32 = 1;

macro_rules! domain_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

domain_id!(
    /// Platform id of a customer.
    UserId
);
domain_id!(
    /// Platform id of a merchant.
    MerchantId
);
domain_id!(
    /// Platform id of an administrator.
    AdminId
);
domain_id!(
    /// Record-store row id. One sequence is shared by every record table, so a
    /// record id identifies a row across coin purchases, transactions,
    /// settlements and referral rewards.
    RecordId
);

/// Role of a ledger account. The discriminant is the ledger role code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System = 0,
    Customer = 1,
    Merchant = 2,
    Admin = 3,
}

impl Role {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Role> {
        match code {
            0 => Some(Role::System),
            1 => Some(Role::Customer),
            2 => Some(Role::Merchant),
            3 => Some(Role::Admin),
            _ => None,
        }
    }
}

/// 128-bit ledger account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u128);

impl AccountId {
    /// Source of every top-up and signup/referral bonus.
    pub const SYSTEM: AccountId = AccountId(1);

    /// Sink for merchant settlements paid out off-system.
    pub const SETTLEMENT: AccountId = AccountId(2);

    /// Derive the account id for a domain id in a role. At most one account exists
    /// per `(domain_id, role)` pair because the mapping is injective.
    pub const fn derive(domain_id: u64, role: Role) -> AccountId {
        AccountId(((role as u128) << 64) | domain_id as u128)
    }

    pub fn for_user(user: UserId) -> AccountId {
        AccountId::derive(user.0, Role::Customer)
    }

    pub fn for_merchant(merchant: MerchantId) -> AccountId {
        AccountId::derive(merchant.0, Role::Merchant)
    }

    pub fn for_admin(admin: AdminId) -> AccountId {
        AccountId::derive(admin.0, Role::Admin)
    }

    pub fn role(self) -> Option<Role> {
        u16::try_from(self.0 >> 64).ok().and_then(Role::from_code)
    }

    pub fn domain_id(self) -> u64 {
        self.0 as u64
    }

    /// System accounts may run negative: they are where value enters and leaves
    /// the platform.
    pub fn is_system(self) -> bool {
        self.role() == Some(Role::System)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// 128-bit ledger transfer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u128);

impl TransferId {
    /// Transfer id for the intent row `record` created at `created_at`.
    ///
    /// The id is a pure function of the row, so retrying the ledger call for the
    /// same row always reuses the same id.
    pub fn for_record(created_at: DateTime<Utc>, record: RecordId) -> TransferId {
        TransferId(((timestamp_ns(created_at) as u128) << 64) | record.0 as u128)
    }

    /// Free-standing transfer id: `now_ns ∥ 64 random bits`.
    pub fn random(now: DateTime<Utc>) -> TransferId {
        TransferId(((timestamp_ns(now) as u128) << 64) | rand::random::<u64>() as u128)
    }

    /// Low 64 bits: the record id for coordinator-issued transfers.
    pub fn tag(self) -> u64 {
        self.0 as u64
    }

    pub fn timestamp_ns(self) -> u64 {
        (self.0 >> 64) as u64
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

fn timestamp_ns(at: DateTime<Utc>) -> u64 {
    at.timestamp_nanos_opt()
        .and_then(|ns| u64::try_from(ns).ok())
        .unwrap_or(0)
}

/// One side of a value movement, as seen by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Party {
    System,
    Settlement,
    User(UserId),
    Merchant(MerchantId),
}

impl Party {
    pub fn account_id(self) -> AccountId {
        match self {
            Party::System => AccountId::SYSTEM,
            Party::Settlement => AccountId::SETTLEMENT,
            Party::User(user) => AccountId::for_user(user),
            Party::Merchant(merchant) => AccountId::for_merchant(merchant),
        }
    }

    pub fn user(self) -> Option<UserId> {
        match self {
            Party::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn merchant(self) -> Option<MerchantId> {
        match self {
            Party::Merchant(merchant) => Some(merchant),
            _ => None,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::System => write!(f, "system"),
            Party::Settlement => write!(f, "settlement"),
            Party::User(user) => write!(f, "user {}", user),
            Party::Merchant(merchant) => write!(f, "merchant {}", merchant),
        }
    }
}
