//! In-process double-entry ledger
//!
//! # Design
//!
//! Account balances live behind a single `RwLock` so that a posting updates both
//! sides of a transfer in one critical section: a reader sees either neither or
//! both. The transfer log and its tag index are `DashMap`s, written while the
//! posting lock is held and read without it.
//!
//! Non-system accounts may never have more debits than credits. System accounts
//! (the top-up source and the settlement sink) are exempt, which is what lets
//! coins enter and leave the platform while the sum over all balances stays
//! zero.

use crate::core::traits::Ledger;
use crate::types::{AccountBalance, AccountId, LedgerError, Role, Transfer, TransferId, COIN_LEDGER};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Ledger held entirely in memory.
#[derive(Debug)]
pub struct MemoryLedger {
    /// Posted totals by account
    accounts: RwLock<HashMap<AccountId, AccountBalance>>,

    /// Append-only transfer log
    transfers: DashMap<TransferId, Transfer>,

    /// Low 64 bits of a transfer id -> transfer id
    tags: DashMap<u64, TransferId>,

    /// Cleared by [`MemoryLedger::close`]
    open: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            transfers: DashMap::new(),
            tags: DashMap::new(),
            open: AtomicBool::new(true),
        }
    }

    /// Close the ledger. Every later call fails with `Unavailable`.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Snapshot of every account ordered by id, for audits and tests.
    pub fn accounts(&self) -> Vec<AccountBalance> {
        let mut all: Vec<AccountBalance> = self.accounts.read().values().copied().collect();
        all.sort_by_key(|a| a.id);
        all
    }

    /// Snapshot of the transfer log, for audits and tests.
    pub fn transfers(&self) -> Vec<Transfer> {
        let mut all: Vec<Transfer> = self
            .transfers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|t| t.id);
        all
    }

    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(LedgerError::Unavailable("ledger is closed".to_string()))
        }
    }

    fn validate(transfer: &Transfer) -> Result<(), LedgerError> {
        if !transfer.amount.is_positive() {
            return Err(LedgerError::InvalidTransfer(format!(
                "amount must be positive, got {}",
                transfer.amount
            )));
        }
        if transfer.debit_account == transfer.credit_account {
            return Err(LedgerError::InvalidTransfer(format!(
                "debit and credit account are both {}",
                transfer.debit_account
            )));
        }
        if transfer.ledger != COIN_LEDGER {
            return Err(LedgerError::InvalidTransfer(format!(
                "unknown ledger {}",
                transfer.ledger
            )));
        }
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_account(&self, id: AccountId, role: Role) -> Result<(), LedgerError> {
        self.ensure_open()?;
        let mut accounts = self.accounts.write();
        if accounts.contains_key(&id) {
            return Err(LedgerError::AccountExists(id));
        }
        accounts.insert(id, AccountBalance::new(id, role));
        Ok(())
    }

    async fn lookup_account(&self, id: AccountId) -> Result<AccountBalance, LedgerError> {
        self.ensure_open()?;
        self.accounts
            .read()
            .get(&id)
            .copied()
            .ok_or(LedgerError::AccountMissing(id))
    }

    async fn post_transfer(&self, transfer: Transfer) -> Result<Transfer, LedgerError> {
        self.ensure_open()?;
        Self::validate(&transfer)?;

        let mut accounts = self.accounts.write();

        if let Some(existing) = self.transfers.get(&transfer.id) {
            return Err(LedgerError::TransferExists(Box::new(existing.value().clone())));
        }

        let debit = accounts
            .get(&transfer.debit_account)
            .copied()
            .ok_or(LedgerError::AccountMissing(transfer.debit_account))?;
        let credit = accounts
            .get(&transfer.credit_account)
            .copied()
            .ok_or(LedgerError::AccountMissing(transfer.credit_account))?;

        let debits_posted = debit
            .debits_posted
            .checked_add(transfer.amount)
            .ok_or_else(|| LedgerError::InvalidTransfer("debit total overflows".to_string()))?;
        let credits_posted = credit
            .credits_posted
            .checked_add(transfer.amount)
            .ok_or_else(|| LedgerError::InvalidTransfer("credit total overflows".to_string()))?;

        if !debit.id.is_system() && debits_posted > debit.credits_posted {
            return Err(LedgerError::InsufficientFunds { account: debit.id });
        }

        if let Some(account) = accounts.get_mut(&transfer.debit_account) {
            account.debits_posted = debits_posted;
        }
        if let Some(account) = accounts.get_mut(&transfer.credit_account) {
            account.credits_posted = credits_posted;
        }

        self.tags.insert(transfer.id.tag(), transfer.id);
        self.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn lookup_transfer(&self, id: TransferId) -> Result<Option<Transfer>, LedgerError> {
        self.ensure_open()?;
        Ok(self.transfers.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_transfer_by_tag(&self, tag: u64) -> Result<Option<Transfer>, LedgerError> {
        self.ensure_open()?;
        let Some(id) = self.tags.get(&tag).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        Ok(self.transfers.get(&id).map(|entry| entry.value().clone()))
    }
}
