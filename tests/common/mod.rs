// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared helpers for integration and chaos tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use beacon_sync::testing::{MockDiscovery, MockWire};
use beacon_sync::{
    Document, EmergencyRequest, EmergencyType, EngineConfig, MemoryStore, RetryConfig, SyncEngine,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Everything a test needs to drive one engine.
pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub store: Arc<MemoryStore>,
    pub discovery: Arc<MockDiscovery>,
    pub wire: Arc<MockWire>,
}

/// Build an engine on mock transports with fast timers.
pub fn harness(config: EngineConfig) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let discovery = Arc::new(MockDiscovery::new());
    let wire = Arc::new(MockWire::new());
    let engine = Arc::new(
        SyncEngine::new(
            config,
            store.clone(),
            discovery.clone(),
            wire.clone(),
        )
        .with_session_retry(RetryConfig::testing()),
    );
    Harness {
        engine,
        store,
        discovery,
        wire,
    }
}

/// Mesh-only harness (gateway disabled).
pub fn mesh_harness() -> Harness {
    harness(EngineConfig::for_testing("test-device"))
}

/// Harness with the gateway session enabled.
pub fn gateway_harness() -> Harness {
    let mut config = EngineConfig::for_testing("test-device");
    config.gateway.enabled = true;
    config.gateway.host = "10.0.0.5".to_string();
    harness(config)
}

/// The gateway endpoint URL matching `gateway_harness()`.
pub fn gateway_url() -> String {
    "ws://10.0.0.5:4984/beacon".to_string()
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {}", what);
}

/// A fresh open emergency request document.
pub fn request_doc(id: &str, requested_at: i64) -> Document {
    let req = EmergencyRequest::new_open(EmergencyType::Ambulance, "stockholm", "42", requested_at);
    Document::new(id, req.into_fields())
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}
