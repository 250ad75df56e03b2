//! Shared harness: SQLite in-memory store, in-process KV and queue, and a
//! manual clock so deadline behavior is driven without sleeping.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};

use intent_core::{
    config::CoreConfig,
    crypto::AuditSigner,
    kv::{KeyValueStore, MemoryKv},
    queue::{JobQueue, MemoryQueue},
    service::{CoreContext, SubmitOptions, SubmitPayload},
    store::Store,
    time::{Clock, ManualClock},
};

pub struct TestCore {
    pub ctx: Arc<CoreContext>,
    pub clock: Arc<ManualClock>,
    pub kv: Arc<MemoryKv>,
    pub queue: Arc<MemoryQueue>,
}

pub async fn boot(mutate: impl FnOnce(&mut CoreConfig)) -> TestCore {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut config = CoreConfig::default();
    config.dedupe.secret = Some("it-takes-a-village".to_string());
    mutate(&mut config);

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let kv = Arc::new(MemoryKv::new(clock.clone() as Arc<dyn Clock>));
    let queue = Arc::new(MemoryQueue::new());

    // A single pooled connection keeps the whole suite on one `:memory:` DB.
    let mut options = sea_orm::ConnectOptions::new("sqlite::memory:");
    options.max_connections(1);
    let db = sea_orm::Database::connect(options).await.expect("connect");
    let store = Store::from_connection(db, config.store.clone());
    store.migrate().await.expect("migrate");

    let (signer, _key_doc) = AuditSigner::generate().expect("signer");
    let ctx = CoreContext::init(
        config,
        store,
        kv.clone() as Arc<dyn KeyValueStore>,
        queue.clone() as Arc<dyn JobQueue>,
        clock.clone() as Arc<dyn Clock>,
        signer,
    )
    .await
    .expect("core init");

    TestCore {
        ctx,
        clock,
        kv,
        queue,
    }
}

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected JSON object"),
    }
}

/// The S1 reference payload: a notify intent with a one-field context.
pub fn notify_payload() -> SubmitPayload {
    SubmitPayload {
        entity_id: "11111111-1111-1111-1111-111111111111".to_string(),
        goal: "Send email".to_string(),
        context: object(json!({"to": "a@b"})),
        metadata: Map::new(),
        intent_type: Some("notify".to_string()),
        priority: 0,
        idempotency_key: None,
    }
}

pub fn tenant_opts(tenant_id: &str, trust_level: u8) -> SubmitOptions {
    SubmitOptions {
        tenant_id: tenant_id.to_string(),
        trust_level: Some(trust_level),
        ..SubmitOptions::default()
    }
}
