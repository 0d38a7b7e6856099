//! Application bootstrap and dependency wiring.
//!
//! This module is the composition root — the single place where the bus,
//! registry, ASR worker, fan-out, and ingest gateway are instantiated and
//! wired together in dependency order (`§10.5`):
//!
//! 1. Message bus (in-memory or Redis Streams, per [`PubsubAdapter`])
//! 2. Call registry (same adapter family as the bus)
//! 3. ASR worker (depends on the bus; owns the vendor factory)
//! 4. Transcript fan-out (depends on the bus and registry)
//! 5. Ingest gateway / HTTP server (depends on all of the above via [`AppState`])

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::WsConnectionManager;
use crate::asr::mock_vendor::MockVendorFactory;
use crate::asr::vendor::VendorFactory;
use crate::asr::vendor_ws::VendorWebSocketFactory;
use crate::asr::AsrWorker;
use crate::bus::in_memory::InMemoryBus;
use crate::bus::redis_streams::RedisStreamsBus;
use crate::bus::MessageBus;
use crate::config::{AsrProvider, CoreConfig, PubsubAdapter};
use crate::error::{PipelineError, PipelineResult};
use crate::fanout::TranscriptFanout;
use crate::protocol_constants::{ASR_CONSUMER_GROUP, DISCOVERY_INTERVAL_MS, FANOUT_CONSUMER_GROUP, SERVICE_ID};
use crate::registry::in_memory::InMemoryCallRegistry;
use crate::registry::redis_backed::RedisCallRegistry;
use crate::registry::CallRegistry;
use crate::runtime::{TaskSpawner, TokioSpawner};

/// Container for all bootstrapped services, consumed by [`crate::api::AppState`]
/// and by the binary's own shutdown handling.
#[derive(Clone)]
pub struct BootstrappedServices {
    pub bus: Arc<dyn MessageBus>,
    pub registry: Arc<dyn CallRegistry>,
    pub asr_worker: Arc<AsrWorker>,
    pub fanout: Arc<TranscriptFanout>,
    pub ws_manager: Arc<WsConnectionManager>,
    pub config: Arc<CoreConfig>,
    pub cancel: CancellationToken,
}

impl BootstrappedServices {
    /// Signals every background task to stop and closes live ingest
    /// WebSocket connections. Does not wait for in-flight HTTP requests —
    /// the caller's `axum::serve` future already races against `cancel`.
    pub async fn shutdown(&self) {
        tracing::info!("bootstrap: beginning graceful shutdown");
        self.cancel.cancel();
        let closed = self.ws_manager.close_all();
        if closed > 0 {
            tracing::info!(closed, "bootstrap: force-closed ingest connections");
        }
    }
}

async fn build_bus(config: &CoreConfig) -> PipelineResult<Arc<dyn MessageBus>> {
    match config.pubsub_adapter {
        PubsubAdapter::InMemory => Ok(Arc::new(InMemoryBus::new(
            config.transcript_topic_trim_len,
            config.audio_topic_retention_minutes,
        ))),
        PubsubAdapter::Streams => {
            let redis_url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| PipelineError::Configuration("redis_url required for streams adapter".into()))?;
            let bus = RedisStreamsBus::connect(redis_url)
                .await
                .map_err(|e| PipelineError::Configuration(format!("failed to connect bus to redis: {e}")))?;
            Ok(Arc::new(bus))
        }
    }
}

async fn build_registry(config: &CoreConfig) -> PipelineResult<Arc<dyn CallRegistry>> {
    match config.pubsub_adapter {
        PubsubAdapter::InMemory => {
            let registry = InMemoryCallRegistry::new(config.call_ttl_secs, config.ended_call_ttl_secs);
            let spawner: Arc<dyn TaskSpawner> = Arc::new(TokioSpawner::current());
            registry.spawn_sweeper(&spawner, (config.call_ttl_secs / 4).max(1));
            Ok(Arc::new(registry))
        }
        PubsubAdapter::Streams => {
            let redis_url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| PipelineError::Configuration("redis_url required for streams adapter".into()))?;
            let registry =
                RedisCallRegistry::connect(redis_url, config.call_ttl_secs, config.ended_call_ttl_secs)
                    .await
                    .map_err(|e| PipelineError::Configuration(format!("failed to connect registry to redis: {e}")))?;
            Ok(Arc::new(registry))
        }
    }
}

fn build_vendor_factory(config: &CoreConfig) -> PipelineResult<Arc<dyn VendorFactory>> {
    match config.asr_provider {
        AsrProvider::Mock => Ok(Arc::new(MockVendorFactory::new())),
        AsrProvider::Websocket => {
            let api_key = config
                .vendor_api_key
                .clone()
                .ok_or_else(|| PipelineError::Configuration("vendor_api_key required for websocket provider".into()))?;
            let endpoint = std::env::var("ASR_VENDOR_ENDPOINT")
                .unwrap_or_else(|_| "wss://api.deepgram.com/v1/listen".to_string());
            Ok(Arc::new(VendorWebSocketFactory::new(endpoint, api_key)))
        }
    }
}

/// Bootstraps all application services with their dependencies, in the order
/// described in the module docs. Spawns the ASR worker and fan-out discovery
/// loops on the current Tokio runtime; the caller still owns starting the
/// HTTP server (`crate::api::start_server`) and driving it to completion.
pub async fn bootstrap_services(config: CoreConfig) -> PipelineResult<BootstrappedServices> {
    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let bus = build_bus(&config).await?;
    let registry = build_registry(&config).await?;
    let vendor_factory = build_vendor_factory(&config)?;

    let asr_worker = AsrWorker::new(
        Arc::clone(&bus),
        vendor_factory,
        &config,
        format!("{SERVICE_ID}-{ASR_CONSUMER_GROUP}"),
        cancel.child_token(),
    );
    tokio::spawn(Arc::clone(&asr_worker).run());

    let fanout = TranscriptFanout::new(
        Arc::clone(&bus),
        Arc::clone(&registry),
        &config,
        format!("{SERVICE_ID}-{FANOUT_CONSUMER_GROUP}"),
        cancel.child_token(),
    );
    tokio::spawn(Arc::clone(&fanout).run());
    tracing::info!(interval_ms = DISCOVERY_INTERVAL_MS, "fan-out discovery loop started");

    let ws_manager = Arc::new(WsConnectionManager::new());

    Ok(BootstrappedServices {
        bus,
        registry,
        asr_worker,
        fanout,
        ws_manager,
        config,
        cancel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstraps_with_default_config_using_in_memory_adapters_and_mock_vendor() {
        let services = bootstrap_services(CoreConfig::default()).await.unwrap();
        assert_eq!(services.registry.list_active(10).await.unwrap().len(), 0);
        services.shutdown().await;
    }

    #[tokio::test]
    async fn streams_adapter_without_redis_url_is_a_configuration_error() {
        let config = CoreConfig {
            pubsub_adapter: PubsubAdapter::Streams,
            ..Default::default()
        };
        let result = bootstrap_services(config).await;
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[tokio::test]
    async fn websocket_provider_without_api_key_is_a_configuration_error() {
        let config = CoreConfig {
            asr_provider: AsrProvider::Websocket,
            ..Default::default()
        };
        let result = bootstrap_services(config).await;
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}
