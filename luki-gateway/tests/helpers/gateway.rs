//! In-process gateway bound to an ephemeral port.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use luki_core::config::{
    ApiKeyConfig, AuthConfig, Config, DownstreamDescriptor, MemoryConfig, RateLimitConfig,
};
use luki_core::lifecycle::{LifecycleConfig, LifecycleManager};
use luki_gateway::{GatewayState, router};
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// API key holding `chat:write` and `memory:read`.
pub const CHAT_KEY: &str = "sk-chat-test";
/// API key holding only `memory:read`.
pub const READER_KEY: &str = "sk-reader-test";

/// Gateway config pointing the `agent` downstream at `agent_url`.
///
/// Retries are off and the breaker opens after `failure_threshold`
/// consecutive failures, so tests can count downstream calls exactly.
pub fn test_config(agent_url: &str, failure_threshold: u32) -> Config {
    let mut agent = DownstreamDescriptor::new(agent_url);
    agent.max_retries = 0;
    agent.failure_threshold = failure_threshold;
    agent.cooldown = Duration::from_secs(300);
    agent.timeout = Duration::from_secs(5);

    let mut downstreams = BTreeMap::new();
    downstreams.insert("agent".to_string(), agent);

    Config {
        auth: AuthConfig {
            api_keys: vec![
                ApiKeyConfig {
                    id: "chat".to_string(),
                    key: CHAT_KEY.to_string(),
                    subject: "alice".to_string(),
                    scopes: vec!["chat:write".to_string(), "memory:read".to_string()],
                },
                ApiKeyConfig {
                    id: "reader".to_string(),
                    key: READER_KEY.to_string(),
                    subject: "bob".to_string(),
                    scopes: vec!["memory:read".to_string()],
                },
            ],
            ..AuthConfig::default()
        },
        rate_limit: RateLimitConfig {
            capacity: 60,
            requests_per_minute: Some(60),
            ..RateLimitConfig::default()
        },
        downstreams,
        ..Config::default()
    }
}

/// Add a `memory` downstream at `memory_url` and enable enrichment.
pub fn with_memory(mut config: Config, memory_url: &str) -> Config {
    let mut memory = DownstreamDescriptor::new(memory_url);
    memory.max_retries = 0;
    config.downstreams.insert("memory".to_string(), memory);
    config.memory = Some(MemoryConfig {
        downstream: "memory".to_string(),
        path: "/search".to_string(),
        k: 3,
    });
    config
}

/// A running gateway and a client for it.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub lifecycle: Arc<LifecycleManager>,
    pub client: Client,
    task: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start(config: Config) -> Self {
        let config = Arc::new(config);
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::from_server_config(
            &config.server,
        )));
        let state = GatewayState::from_config(config, lifecycle.clone(), None)
            .expect("Failed to build gateway state");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind gateway");
        let addr = listener.local_addr().expect("Failed to read gateway address");
        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = lifecycle.shutdown_token();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .expect("Gateway server failed");
        });

        lifecycle.mark_config_loaded();
        lifecycle.mark_ready();

        Self {
            addr,
            lifecycle,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build client"),
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// `POST path` with a JSON body and an optional bearer key.
    pub async fn post(
        &self,
        path: &str,
        key: Option<&str>,
        body: &serde_json::Value,
    ) -> reqwest::Response {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(key) = key {
            request = request.bearer_auth(key);
        }
        request.send().await.expect("Failed to send request")
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}
