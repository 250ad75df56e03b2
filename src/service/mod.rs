//! Service layer: lifecycle engine, escalation engine, consent registry,
//! and the process-wide context that wires them together.
//!
//! The intent and escalation services reference each other. Both are
//! modeled as peers behind thin capability traits ([`IntentDirectory`],
//! [`EscalationLink`]) bound after construction, so neither constructor
//! depends on the other.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    audit::AuditChain,
    breaker::BreakerRegistry,
    config::CoreConfig,
    crypto::{AuditSigner, PayloadCipher},
    errors::{CoreError, CoreResult},
    kv::{KeyValueStore, LeaderElector, keys},
    queue::JobQueue,
    scheduler::Scheduler,
    state::IntentStatus,
    store::{
        ConsentRepository, EscalationRepository, IntentRepository, Store,
        escalations::Escalation, intents::Intent,
    },
    time::Clock,
};

pub mod consent;
pub mod escalation;
pub mod intent;

pub use consent::{ConsentHistoryEntry, ConsentService, ConsentValidation};
pub use escalation::{CreateEscalation, EscalationService, EscalationStats};
pub use intent::{
    EscalateRequest, IntentService, SubmissionCounts, SubmitOptions, SubmitPayload, Submission,
};

/// Inputs to a validated status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFlags {
    /// Optimistic-concurrency expectation; defaults to the current status.
    pub expected_from: Option<IntentStatus>,
    pub reason: Option<String>,
    pub permission: bool,
    pub actor: Option<String>,
}

/// Capability the intent service exposes to its peers.
#[async_trait]
pub trait IntentDirectory: Send + Sync {
    async fn find_intent(&self, id: Uuid, tenant_id: &str) -> CoreResult<Option<Intent>>;

    async fn update_intent_status(
        &self,
        id: Uuid,
        tenant_id: &str,
        to: IntentStatus,
        flags: TransitionFlags,
    ) -> CoreResult<Intent>;
}

/// Capability the escalation service exposes to its peers.
#[async_trait]
pub trait EscalationLink: Send + Sync {
    async fn create_escalation(&self, request: CreateEscalation) -> CoreResult<Escalation>;

    async fn escalation_by_intent(&self, intent_id: Uuid) -> CoreResult<Option<Escalation>>;
}

/// Cooperative cancellation context threaded through boundary operations.
///
/// Cancellation is checked between suspension points; an operation whose
/// transactional write already committed still reports success.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels the paired [`OpContext`].
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl OpContext {
    /// A context that is never cancelled (background work).
    pub fn background() -> Self {
        Self { cancel: None }
    }

    /// A cancellable context and its handle.
    pub fn cancellable() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), Self { cancel: Some(rx) })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Errors with [`CoreError::Cancelled`] once the caller has given up.
    pub fn ensure_active(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Process-wide service wiring with deterministic init and shutdown.
///
/// Nothing global is constructed at import time; the host builds exactly
/// one context, hands out its `Arc`, and calls [`CoreContext::shutdown`]
/// on the way down.
pub struct CoreContext {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    store: Store,
    kv: Arc<dyn KeyValueStore>,
    queue: Arc<dyn JobQueue>,
    breakers: BreakerRegistry,
    intents: Arc<IntentService>,
    escalations: Arc<EscalationService>,
    consents: Arc<ConsentService>,
    audit: Arc<AuditChain>,
    scheduler: std::sync::Mutex<Option<Arc<Scheduler>>>,
}

impl CoreContext {
    /// Validate the configuration and wire every service.
    pub async fn init(
        config: CoreConfig,
        store: Store,
        kv: Arc<dyn KeyValueStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        signer: AuditSigner,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;

        let cipher = match &config.encryption.key_hex {
            Some(key_hex) => Some(Arc::new(PayloadCipher::from_hex_key(key_hex)?)),
            None => None,
        };
        let breakers = BreakerRegistry::new(config.breaker.clone(), Arc::clone(&clock));

        let consents = Arc::new(ConsentService::new(
            ConsentRepository::new(store.clone(), Arc::clone(&clock)),
            &breakers,
        ));
        let intents = Arc::new(IntentService::new(
            IntentRepository::new(store.clone(), Arc::clone(&clock), cipher.clone()),
            Arc::clone(&consents),
            Arc::clone(&kv),
            Arc::clone(&queue),
            Arc::clone(&clock),
            config.clone(),
            cipher,
        ));
        let escalations = Arc::new(EscalationService::new(
            EscalationRepository::new(store.clone(), Arc::clone(&clock)),
            Arc::clone(&kv),
            Arc::clone(&clock),
            config.escalation.clone(),
            &breakers,
        ));

        escalations.bind_intents(Arc::clone(&intents) as Arc<dyn IntentDirectory>);
        intents.bind_escalations(Arc::clone(&escalations) as Arc<dyn EscalationLink>);

        let audit = Arc::new(AuditChain::new(store.clone(), signer, Arc::clone(&clock)));

        Ok(Arc::new(Self {
            config,
            clock,
            store,
            kv,
            queue,
            breakers,
            intents,
            escalations,
            consents,
            audit,
            scheduler: std::sync::Mutex::new(None),
        }))
    }

    /// Start the leader-gated scheduler for this instance.
    pub fn start_scheduler(&self) -> CoreResult<()> {
        let mut slot = self.scheduler.lock().expect("scheduler slot poisoned");
        if slot.is_some() {
            return Ok(());
        }
        let elector = Arc::new(LeaderElector::new(
            Arc::clone(&self.kv),
            Arc::clone(&self.clock),
            keys::SCHEDULER_LEADER,
            std::time::Duration::from_secs(self.config.scheduler.leader_ttl_secs),
        ));
        let scheduler = Arc::new(Scheduler::new(
            elector,
            Arc::clone(&self.clock),
            self.config.scheduler.clone(),
            Arc::clone(&self.intents),
            Arc::clone(&self.escalations),
        ));
        scheduler.start()?;
        *slot = Some(scheduler);
        Ok(())
    }

    /// Stop the scheduler and release leadership. Idempotent.
    pub async fn shutdown(&self) {
        let scheduler = self.scheduler.lock().expect("scheduler slot poisoned").take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }
        tracing::info!("core context shut down");
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn intents(&self) -> &Arc<IntentService> {
        &self.intents
    }

    pub fn escalations(&self) -> &Arc<EscalationService> {
        &self.escalations
    }

    pub fn consents(&self) -> &Arc<ConsentService> {
        &self.consents
    }

    pub fn audit(&self) -> &Arc<AuditChain> {
        &self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_context() {
        let ctx = OpContext::background();
        assert!(ctx.ensure_active().is_ok());

        let (handle, ctx) = OpContext::cancellable();
        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(
            ctx.ensure_active(),
            Err(CoreError::Cancelled)
        ));
    }
}
