//! Ledger adapter
//!
//! A typed facade over any [`Ledger`]: accounts are created by domain id and
//! role, balances come back as [`Coins`], and transfers are posted from a
//! [`TransferSpec`] under a caller-chosen id.
//!
//! Every call holds a permit from a bounded pool for its duration; waiting for a
//! permit is a suspension point like the call itself.

use crate::core::traits::{Clock, Ledger};
use crate::types::{
    AccountId, Coins, LedgerError, RecordId, Role, Transfer, TransferId, TransferSpec,
    COIN_LEDGER,
};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// Outcome of [`LedgerAdapter::create_account`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountCreation {
    Created,
    AlreadyExists,
}

/// Typed access to the ledger
#[derive(Clone)]
pub struct LedgerAdapter {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    pool: Arc<Semaphore>,
}

impl std::fmt::Debug for LedgerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerAdapter")
            .field("available_connections", &self.pool.available_permits())
            .finish_non_exhaustive()
    }
}

impl LedgerAdapter {
    /// # Arguments
    ///
    /// * `ledger` - the ledger client
    /// * `clock` - timestamps transfers
    /// * `max_connections` - bound on concurrent ledger calls
    pub fn new(ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>, max_connections: usize) -> Self {
        Self {
            ledger,
            clock,
            pool: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    async fn connection(&self) -> Result<SemaphorePermit<'_>, LedgerError> {
        self.pool
            .acquire()
            .await
            .map_err(|_| LedgerError::Unavailable("ledger connection pool is closed".to_string()))
    }

    /// Create the account for `domain_id` in `role`.
    ///
    /// Idempotent: an account that already exists is reported as
    /// [`AccountCreation::AlreadyExists`], not as an error.
    pub async fn create_account(
        &self,
        domain_id: u64,
        role: Role,
    ) -> Result<AccountCreation, LedgerError> {
        self.create(AccountId::derive(domain_id, role), role).await
    }

    /// Create a well-known account by id.
    pub async fn create(&self, id: AccountId, role: Role) -> Result<AccountCreation, LedgerError> {
        let _conn = self.connection().await?;
        match self.ledger.create_account(id, role).await {
            Ok(()) => {
                debug!(account = %id, ?role, "account created");
                Ok(AccountCreation::Created)
            }
            Err(LedgerError::AccountExists(_)) => Ok(AccountCreation::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    /// Current balance of an account.
    ///
    /// # Errors
    ///
    /// * `AccountMissing` - no such account
    /// * `Unavailable` - the ledger cannot be reached
    pub async fn balance(&self, id: AccountId) -> Result<Coins, LedgerError> {
        let _conn = self.connection().await?;
        Ok(self.ledger.lookup_account(id).await?.balance())
    }

    /// Post the movement `spec` under transfer id `id`.
    ///
    /// Re-posting an id that is already on the ledger with exactly the same
    /// movement succeeds and returns the stored transfer, which makes resuming an
    /// interrupted intent safe. The same id with a different movement is an
    /// `InvalidTransfer`.
    pub async fn post_transfer(
        &self,
        id: TransferId,
        spec: TransferSpec,
    ) -> Result<Transfer, LedgerError> {
        let transfer = Transfer {
            id,
            debit_account: spec.debit,
            credit_account: spec.credit,
            amount: spec.amount,
            ledger: COIN_LEDGER,
            op: spec.op,
            timestamp: self.clock.now(),
        };

        let _conn = self.connection().await?;
        match self.ledger.post_transfer(transfer).await {
            Ok(posted) => Ok(posted),
            Err(LedgerError::TransferExists(existing)) if existing.matches(&spec) => {
                debug!(transfer_id = %id, "transfer already posted, treating as success");
                Ok(*existing)
            }
            Err(LedgerError::TransferExists(existing)) => {
                warn!(
                    transfer_id = %id,
                    existing_debit = %existing.debit_account,
                    existing_credit = %existing.credit_account,
                    existing_amount = %existing.amount,
                    "transfer id reused for a different movement"
                );
                Err(LedgerError::InvalidTransfer(format!(
                    "transfer {} already posted with a different movement",
                    id
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Post a free-standing movement under a fresh random id.
    pub async fn post_standalone(&self, spec: TransferSpec) -> Result<Transfer, LedgerError> {
        self.post_transfer(TransferId::random(self.clock.now()), spec)
            .await
    }

    /// The transfer posted for a record, if any.
    pub async fn find_transfer_for(&self, record: RecordId) -> Result<Option<Transfer>, LedgerError> {
        let _conn = self.connection().await?;
        self.ledger.find_transfer_by_tag(record.0).await
    }

    pub async fn lookup_transfer(&self, id: TransferId) -> Result<Option<Transfer>, LedgerError> {
        let _conn = self.connection().await?;
        self.ledger.lookup_transfer(id).await
    }
}
