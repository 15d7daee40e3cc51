//! Engine wiring
//!
//! [`EngineBuilder`] assembles the ledger adapter, record store, directory,
//! policy, coordinator, history projector, reconciler and event bus from a
//! [`Config`]. Any collaborator can be swapped before `build()`; tests use this
//! to pin the clock or wrap the store with fault injection.

use super::PaymentService;
use crate::config::{Config, ConfigError};
use crate::core::clock::SystemClock;
use crate::core::coordinator::PaymentCoordinator;
use crate::core::events::EventBus;
use crate::core::history::HistoryProjector;
use crate::core::ledger::LedgerAdapter;
use crate::core::memory::{MemoryDirectory, MemoryLedger, MemoryRecordStore};
use crate::core::reconciler::{Inconsistency, Reconciler};
use crate::core::traits::{Clock, Directory, Ledger, RecordStore};
use crate::types::EngineError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub struct EngineBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    ledger: Option<Arc<dyn Ledger>>,
    store: Option<Arc<dyn RecordStore>>,
    directory: Option<Arc<dyn Directory>>,
    alerts: Option<mpsc::Sender<Inconsistency>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: None,
            ledger: None,
            store: None,
            directory: None,
            alerts: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Operator channel for reconciler findings.
    pub fn with_alerts(mut self, alerts: mpsc::Sender<Inconsistency>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Validate the configuration and wire every component.
    ///
    /// # Errors
    ///
    /// * `Invalid` - a config value is out of bounds, or an endpoint other than
    ///   `mem://` is configured without a client supplied for it
    pub fn build(self) -> Result<Engine, ConfigError> {
        self.config.validate()?;
        let policy = self.config.policy()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let mut memory_ledger = None;
        let ledger: Arc<dyn Ledger> = match self.ledger {
            Some(ledger) => ledger,
            None if self.config.ledger.is_in_memory() => {
                let ledger = Arc::new(MemoryLedger::new());
                memory_ledger = Some(Arc::clone(&ledger));
                ledger
            }
            None => {
                return Err(ConfigError::invalid(format!(
                    "no ledger client for endpoint {}",
                    self.config.ledger.endpoint
                )))
            }
        };

        let mut memory_store = None;
        let store: Arc<dyn RecordStore> = match self.store {
            Some(store) => store,
            None if self.config.store.is_in_memory() => {
                let store = MemoryRecordStore::new(Arc::clone(&clock), self.config.store.max_connections);
                memory_store = Some(store.clone());
                Arc::new(store)
            }
            None => {
                return Err(ConfigError::invalid(format!(
                    "no record store client for endpoint {}",
                    self.config.store.endpoint
                )))
            }
        };

        let directory: Arc<dyn Directory> = match self.directory {
            Some(directory) => directory,
            None => {
                let directory = MemoryDirectory::new();
                for user in &self.config.directory.users {
                    directory.upsert_user(user.id, user.name.clone(), user.email.clone());
                }
                for merchant in &self.config.directory.merchants {
                    directory.upsert_merchant(merchant.id, merchant.name.clone(), merchant.category.clone());
                }
                Arc::new(directory)
            }
        };

        let adapter = LedgerAdapter::new(ledger, Arc::clone(&clock), self.config.ledger.max_connections);
        let events = Arc::new(EventBus::new(self.config.events.subscriber_buffer));
        let coordinator = Arc::new(PaymentCoordinator::new(
            adapter.clone(),
            Arc::clone(&store),
            Arc::clone(&directory),
            policy,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let projector = Arc::new(HistoryProjector::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            adapter.clone(),
        ));
        let mut reconciler = Reconciler::new(
            adapter.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            self.config.reconciler(),
        );
        if let Some(alerts) = self.alerts {
            reconciler = reconciler.with_alerts(alerts);
        }
        let service = Arc::new(PaymentService::new(
            Arc::clone(&coordinator),
            Arc::clone(&projector),
            Arc::clone(&store),
        ));

        Ok(Engine {
            service,
            coordinator,
            projector,
            reconciler: Arc::new(reconciler),
            ledger: adapter,
            store,
            directory,
            events,
            memory_ledger,
            memory_store,
        })
    }
}

/// A wired engine
pub struct Engine {
    pub service: Arc<PaymentService>,
    pub coordinator: Arc<PaymentCoordinator>,
    pub projector: Arc<HistoryProjector>,
    pub reconciler: Arc<Reconciler>,
    pub ledger: LedgerAdapter,
    pub store: Arc<dyn RecordStore>,
    pub directory: Arc<dyn Directory>,
    pub events: Arc<EventBus>,
    memory_ledger: Option<Arc<MemoryLedger>>,
    memory_store: Option<MemoryRecordStore>,
}

impl Engine {
    /// Create the system accounts.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.coordinator.bootstrap().await
    }

    /// Close the in-process ledger and store. Later calls fail as unavailable.
    pub fn shutdown(&self) {
        if let Some(ledger) = &self.memory_ledger {
            ledger.close();
        }
        if let Some(store) = &self.memory_store {
            store.close();
        }
        info!("engine closed");
    }
}
