//! Relational store adapter.
//!
//! The store is the source of truth for every core entity. This module owns
//! the connection handle, schema bootstrap (tables plus the partial indices
//! the dedupe and policy invariants rely on), and transaction plumbing with
//! a per-transaction statement timeout on Postgres.

use sea_orm::{
    ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction, DbBackend, Schema,
    Statement, TransactionTrait,
};

use crate::{config::StoreConfig, errors::CoreResult};

pub mod consents;
pub mod entity;
pub mod escalations;
pub mod intents;

pub use consents::ConsentRepository;
pub use escalations::EscalationRepository;
pub use intents::IntentRepository;

/// Index DDL shared by SQLite and Postgres, including the partial unique
/// indices that back dedupe and current-policy invariants.
const INDEX_DDL: [&str; 7] = [
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_records_position \
     ON audit_records (chain_position)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_intents_tenant_dedupe \
     ON intents (tenant_id, dedupe_hash) WHERE deleted_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_intents_tenant_status \
     ON intents (tenant_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_intent_events_intent_occurred \
     ON intent_events (intent_id, occurred_at)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_consent_policies_current \
     ON consent_policies (tenant_id, consent_type) WHERE effective_to IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_escalations_status_timeout \
     ON escalations (status, timeout_at)",
    "CREATE INDEX IF NOT EXISTS idx_escalations_tenant_status \
     ON escalations (tenant_id, status)",
];

/// Shared connection handle. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
    config: StoreConfig,
}

impl Store {
    /// Connect to the given database URL (`postgres://…` or `sqlite::memory:`).
    pub async fn connect(url: &str, config: StoreConfig) -> CoreResult<Self> {
        let db = Database::connect(url).await?;
        Ok(Self { db, config })
    }

    /// Wrap an existing connection (host-managed pools).
    pub fn from_connection(db: DatabaseConnection, config: StoreConfig) -> Self {
        Self { db, config }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create tables and indices if they do not exist.
    ///
    /// Production deployments normally run managed migrations; this exists
    /// for dev bootstrap and the test suite, and is idempotent.
    pub async fn migrate(&self) -> CoreResult<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        macro_rules! create_table {
            ($entity:path) => {{
                let mut statement = schema.create_table_from_entity($entity);
                statement.if_not_exists();
                self.db.execute(backend.build(&statement)).await?;
            }};
        }

        create_table!(entity::intents::Entity);
        create_table!(entity::intent_events::Entity);
        create_table!(entity::intent_evaluations::Entity);
        create_table!(entity::escalations::Entity);
        create_table!(entity::user_consents::Entity);
        create_table!(entity::consent_policies::Entity);
        create_table!(entity::audit_records::Entity);

        for ddl in INDEX_DDL {
            self.db
                .execute(Statement::from_string(backend, ddl.to_string()))
                .await?;
        }
        Ok(())
    }

    /// Begin a transaction with the configured statement timeout.
    ///
    /// SQLite has no statement timeout; the setting is applied only on
    /// Postgres, scoped to the transaction via `SET LOCAL`.
    pub async fn begin(&self) -> CoreResult<DatabaseTransaction> {
        let txn = self.db.begin().await?;
        if self.db.get_database_backend() == DbBackend::Postgres {
            txn.execute(Statement::from_string(
                DbBackend::Postgres,
                format!(
                    "SET LOCAL statement_timeout = {}",
                    self.config.statement_timeout_ms
                ),
            ))
            .await?;
        }
        Ok(txn)
    }
}
