//! Signed audit chain over governance decisions.
//!
//! Each record captures the inputs and outputs of one decision, hashes the
//! canonical record, links it to the previous record's hash, and signs the
//! digest with the process Ed25519 key. Verification re-derives every hash
//! and checks every signature against the public key stored *on the
//! record*, so key rotation never invalidates history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, SqlErr,
};
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    crypto::{AuditSigner, ChainHash, canonical_json_bytes, verify_signature},
    crypto::sign::SIGNATURE_ALGORITHM,
    errors::{CoreError, CoreResult},
    store::{Store, entity::audit_records, intents::ChainVerification},
    time::Clock,
};

const APPEND_RETRIES: usize = 3;

/// One signed decision record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub entity_id: String,
    pub decision: String,
    pub inputs: Value,
    pub outputs: Value,
    pub created_at: DateTime<Utc>,
    pub chain_position: i64,
    pub previous_hash: String,
    pub hash: String,
    pub signature: String,
    pub public_key: String,
    pub algorithm: String,
}

/// Append-only signed chain of governance decisions.
pub struct AuditChain {
    store: Store,
    signer: AuditSigner,
    clock: Arc<dyn Clock>,
}

impl AuditChain {
    pub fn new(store: Store, signer: AuditSigner, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            signer,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }

    fn map(model: audit_records::Model) -> AuditRecord {
        AuditRecord {
            id: model.id,
            intent_id: model.intent_id,
            entity_id: model.entity_id,
            decision: model.decision,
            inputs: model.inputs,
            outputs: model.outputs,
            created_at: model.created_at,
            chain_position: model.chain_position,
            previous_hash: model.previous_hash,
            hash: model.hash,
            signature: model.signature,
            public_key: model.public_key,
            algorithm: model.algorithm,
        }
    }

    /// Canonical digest input: everything except `hash` and `signature`.
    fn record_preimage(
        id: Uuid,
        intent_id: Uuid,
        entity_id: &str,
        decision: &str,
        inputs: &Value,
        outputs: &Value,
        created_at: DateTime<Utc>,
        chain_position: i64,
        previous_hash: &str,
    ) -> CoreResult<Vec<u8>> {
        canonical_json_bytes(&json!({
            "id": id,
            "intent_id": intent_id,
            "entity_id": entity_id,
            "decision": decision,
            "inputs": inputs,
            "outputs": outputs,
            "created_at": created_at.timestamp_millis(),
            "chain_position": chain_position,
            "previous_hash": previous_hash,
        }))
    }

    /// Append a signed record at the chain head.
    ///
    /// Concurrent appenders race on the unique `chain_position` index; the
    /// loser re-reads the head and retries.
    pub async fn append(
        &self,
        intent_id: Uuid,
        entity_id: &str,
        decision: &str,
        inputs: Value,
        outputs: Value,
    ) -> CoreResult<AuditRecord> {
        for attempt in 0..APPEND_RETRIES {
            let head = audit_records::Entity::find()
                .order_by_desc(audit_records::Column::ChainPosition)
                .one(self.store.db())
                .await?;
            let (chain_position, previous_hash) = match &head {
                Some(record) => (record.chain_position + 1, record.hash.clone()),
                None => (0, String::from(ChainHash::zero())),
            };

            let id = Uuid::new_v4();
            let created_at = self.now();
            let preimage = Self::record_preimage(
                id,
                intent_id,
                entity_id,
                decision,
                &inputs,
                &outputs,
                created_at,
                chain_position,
                &previous_hash,
            )?;
            let hash = String::from(ChainHash::compute(&preimage));
            let signature = self.signer.sign(hash.as_bytes());

            let insert = audit_records::ActiveModel {
                id: Set(id),
                intent_id: Set(intent_id),
                entity_id: Set(entity_id.to_string()),
                decision: Set(decision.to_string()),
                inputs: Set(inputs.clone()),
                outputs: Set(outputs.clone()),
                created_at: Set(created_at),
                chain_position: Set(chain_position),
                previous_hash: Set(previous_hash),
                hash: Set(hash),
                signature: Set(signature),
                public_key: Set(self.signer.public_key_hex().to_string()),
                algorithm: Set(SIGNATURE_ALGORITHM.to_string()),
            }
            .insert(self.store.db())
            .await;

            match insert {
                Ok(model) => return Ok(Self::map(model)),
                Err(err) => {
                    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                        tracing::debug!(attempt, "audit chain head moved, retrying append");
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
        Err(CoreError::Conflict(
            "audit chain head contention exhausted retries".to_string(),
        ))
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Option<AuditRecord>> {
        let row = audit_records::Entity::find_by_id(id)
            .one(self.store.db())
            .await?;
        Ok(row.map(Self::map))
    }

    /// All records for one intent, oldest first.
    pub async fn list_for_intent(&self, intent_id: Uuid) -> CoreResult<Vec<AuditRecord>> {
        let rows = audit_records::Entity::find()
            .filter(audit_records::Column::IntentId.eq(intent_id))
            .order_by_asc(audit_records::Column::ChainPosition)
            .all(self.store.db())
            .await?;
        Ok(rows.into_iter().map(Self::map).collect())
    }

    fn check_record(record: &AuditRecord, expected_previous: &str) -> CoreResult<Option<String>> {
        if record.previous_hash != expected_previous {
            return Ok(Some(format!(
                "Broken linkage at position {}",
                record.chain_position
            )));
        }
        let preimage = Self::record_preimage(
            record.id,
            record.intent_id,
            &record.entity_id,
            &record.decision,
            &record.inputs,
            &record.outputs,
            record.created_at,
            record.chain_position,
            &record.previous_hash,
        )?;
        if record.hash != ChainHash::compute(&preimage).as_str() {
            return Ok(Some(format!(
                "Hash mismatch at position {}",
                record.chain_position
            )));
        }
        if record.algorithm != SIGNATURE_ALGORITHM
            || !verify_signature(&record.public_key, record.hash.as_bytes(), &record.signature)?
        {
            return Ok(Some(format!(
                "Signature invalid at position {}",
                record.chain_position
            )));
        }
        Ok(None)
    }

    /// Verify one record: hash, linkage to its predecessor, signature.
    pub async fn verify(&self, id: Uuid) -> CoreResult<ChainVerification> {
        let Some(record) = self.get(id).await? else {
            return Err(CoreError::NotFound {
                entity: "audit record",
                id: id.to_string(),
            });
        };

        let expected_previous = if record.chain_position == 0 {
            String::from(ChainHash::zero())
        } else {
            let predecessor = audit_records::Entity::find()
                .filter(audit_records::Column::ChainPosition.eq(record.chain_position - 1))
                .one(self.store.db())
                .await?;
            match predecessor {
                Some(p) => p.hash,
                None => {
                    return Ok(ChainVerification {
                        valid: false,
                        invalid_at: Some(record.chain_position as usize),
                        error: Some(format!(
                            "Missing predecessor at position {}",
                            record.chain_position - 1
                        )),
                    });
                }
            }
        };

        match Self::check_record(&record, &expected_previous)? {
            None => Ok(ChainVerification {
                valid: true,
                invalid_at: None,
                error: None,
            }),
            Some(error) => Ok(ChainVerification {
                valid: false,
                invalid_at: Some(record.chain_position as usize),
                error: Some(error),
            }),
        }
    }

    /// Verify every record in order; reports the first break.
    pub async fn verify_chain(&self) -> CoreResult<ChainVerification> {
        let rows = audit_records::Entity::find()
            .order_by_asc(audit_records::Column::ChainPosition)
            .all(self.store.db())
            .await?;

        let mut expected_previous = String::from(ChainHash::zero());
        for (index, row) in rows.into_iter().enumerate() {
            let record = Self::map(row);
            if record.chain_position != index as i64 {
                return Ok(ChainVerification {
                    valid: false,
                    invalid_at: Some(index),
                    error: Some(format!("Gap in chain at position {index}")),
                });
            }
            if let Some(error) = Self::check_record(&record, &expected_previous)? {
                return Ok(ChainVerification {
                    valid: false,
                    invalid_at: Some(index),
                    error: Some(error),
                });
            }
            expected_previous = record.hash;
        }
        Ok(ChainVerification {
            valid: true,
            invalid_at: None,
            error: None,
        })
    }
}
