//! Shared helpers for Turbine tests
//!
//! - [`TestFabric`] starts routers on one in-process network and stops them on drop
//! - [`RecordingHandler`] keeps every message delivered to a server
//! - [`wait_for`] polls a condition instead of sleeping a fixed time

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use turbine_core::{RoutedMessage, ServerName};
use turbine_router::{LocalHandler, Router, RouterConfig};
use turbine_transport::MemoryNetwork;

/// Upper bound for anything a test waits on
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling period used by [`wait_for`] callers
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Install a tracing subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Waiting
// ============================================================================

/// Poll `check` every `interval` until it holds; false if `max_wait` runs out first
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait until `router` has a usable route to `destination`
pub async fn wait_for_route(router: &Router, destination: &ServerName, max_wait: Duration) -> bool {
    wait_for(
        || async { router.topology().route_for(destination).is_some() },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// Recording Handler
// ============================================================================

/// Local handler that keeps every message and answers with its payload
#[derive(Clone, Default)]
pub struct RecordingHandler {
    messages: Arc<Mutex<Vec<RoutedMessage>>>,
    stalled: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records messages but never answers them
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn last(&self) -> Option<RoutedMessage> {
        self.messages.lock().last().cloned()
    }
}

#[async_trait]
impl LocalHandler for RecordingHandler {
    async fn handle(&self, message: RoutedMessage) -> turbine_router::Result<Bytes> {
        let payload = message.payload.clone();
        self.messages.lock().push(message);
        if self.stalled {
            std::future::pending::<()>().await;
        }
        Ok(payload)
    }
}

// ============================================================================
// Test Fabric - routers on one in-process network
// ============================================================================

/// The `mem:` address a test server called `name` listens on
pub fn memory_address(name: &str) -> String {
    format!("mem:{}", name.trim_start_matches('/').replace('/', "."))
}

/// Routers sharing one [`MemoryNetwork`]
#[derive(Clone, Default)]
pub struct TestFabric {
    network: MemoryNetwork,
}

impl TestFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Configuration with timings short enough for tests
    pub fn config(&self, name: &str) -> RouterConfig {
        RouterConfig {
            route_wait_ms: 2_000,
            reverse_route_wait_ms: 2_000,
            ping_wait_ms: 1_000,
            ping_interval_ms: 5_000,
            reconnect_interval_ms: 100,
            tick_interval_ms: 50,
            ..RouterConfig::new(name, memory_address(name))
        }
    }

    /// Configuration for a child of the server called `parent`
    pub fn child_config(&self, name: &str, parent: &str) -> RouterConfig {
        self.config(name).with_parent(memory_address(parent))
    }

    /// Start a server with default test timings
    pub async fn spawn(&self, name: &str) -> TestRouter {
        self.spawn_with_config(self.config(name)).await
    }

    /// Start a child of `parent`, returning once it has joined
    pub async fn spawn_child(&self, name: &str, parent: &str) -> TestRouter {
        self.spawn_with_config(self.child_config(name, parent)).await
    }

    /// Bind, serve, start and tick a router on this fabric
    pub async fn spawn_with_config(&self, config: RouterConfig) -> TestRouter {
        self.spawn_with_handler(config, RecordingHandler::new()).await
    }

    /// Like [`TestFabric::spawn_with_config`] with a handler of the caller's choosing
    pub async fn spawn_with_handler(
        &self,
        config: RouterConfig,
        handler: RecordingHandler,
    ) -> TestRouter {
        let server = self.network.bind(&config.address).unwrap();
        let tick = config.tick_interval();
        let router = Router::new(
            config,
            Arc::new(self.network.connector()),
            Arc::new(handler.clone()),
        )
        .unwrap();

        let serving = router.clone();
        let serve = tokio::spawn(async move {
            let _ = serving.serve_on(server).await;
        });
        router.start().await.unwrap();
        let ticker = router.run_ticker(tick);

        TestRouter {
            router,
            handler,
            serve: Some(serve),
            ticker: Some(ticker),
        }
    }
}

// ============================================================================
// Test Router
// ============================================================================

/// A router that stops when dropped
pub struct TestRouter {
    router: Router,
    handler: RecordingHandler,
    serve: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl TestRouter {
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn handler(&self) -> &RecordingHandler {
        &self.handler
    }

    pub fn name(&self) -> &ServerName {
        self.router.name()
    }

    pub fn address(&self) -> &str {
        &self.router.identity().address
    }

    /// Stop the router and close its links, so its neighbours notice
    pub async fn shutdown(mut self) {
        self.router.stop().await;
        if let Some(serve) = self.serve.take() {
            let _ = serve.await;
        }
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.await;
        }
    }
}

impl std::ops::Deref for TestRouter {
    type Target = Router;

    fn deref(&self) -> &Router {
        &self.router
    }
}

impl Drop for TestRouter {
    fn drop(&mut self) {
        self.router.topology().stop();
        if let Some(handle) = self.serve.take() {
            handle.abort();
        }
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}
