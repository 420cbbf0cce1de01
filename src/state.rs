//! `ProxyState`: the per-service object composing the channel catalog, router, load
//! balancer, filter, traffic log and live hub, plus the shared HTTP client used to
//! reach upstreams.
//!
//! Grounded on the host crate's `state.rs` (`ProxyState` as an explicit, constructed
//! object rather than an ambient singleton — §9's "Global mutable state" note) and
//! `main.rs::run_server`'s client-construction policy (pool limits, timeouts).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::catalog::ChannelCatalog;
use crate::config::ServiceKind;
use crate::filter::RequestFilter;
use crate::lb::LoadBalancer;
use crate::live_hub::LiveHub;
use crate::router::Router;
use crate::traffic_log::TrafficLog;

/// Upper bound on concurrent upstream connections (§4.5): the keep-alive pool
/// below caps idle connections per host, but reqwest has no direct knob for a
/// hard concurrent-connection ceiling, so `ProxyState::connection_permits`
/// enforces it with a counting semaphore acquired around every upstream send.
pub const MAX_CONCURRENT_UPSTREAM_CONNECTIONS: usize = 200;

/// HTTP client pool policy (§4.5): bounded connections, 30s connect/write, no
/// read timeout (LLM generations can run for minutes).
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("failed to build upstream HTTP client")
}

pub struct ProxyState {
    pub service: ServiceKind,
    pub catalog: ChannelCatalog,
    pub router: Router,
    pub lb: LoadBalancer,
    pub filter: RequestFilter,
    pub traffic_log: TrafficLog,
    pub live_hub: LiveHub,
    pub http_client: reqwest::Client,
    /// Bounds in-flight upstream requests to `MAX_CONCURRENT_UPSTREAM_CONNECTIONS`.
    pub connection_permits: Arc<Semaphore>,
}

impl ProxyState {
    pub fn new(service: ServiceKind) -> Arc<Self> {
        Arc::new(Self {
            service,
            catalog: ChannelCatalog::for_service(service),
            router: Router::for_service(service),
            lb: LoadBalancer::for_service(service),
            filter: RequestFilter::new(),
            traffic_log: TrafficLog::for_service(service),
            live_hub: LiveHub::new(service.as_str()),
            http_client: build_http_client(),
            connection_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_UPSTREAM_CONNECTIONS)),
        })
    }

    pub fn log_limit(&self) -> u32 {
        crate::config::SystemConfig::load().normalized_log_limit()
    }
}
