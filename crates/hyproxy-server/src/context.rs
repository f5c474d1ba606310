//! Shared state handed to every session driver and to the transfer
//! coordinator.

use crate::auth::CredentialRelay;
use crate::backend::BackendConnector;
use crate::config::ProxyConfig;
use crate::health::BackendHealthCache;
use crate::session::SessionManager;
use crate::transfer::ReferralManager;
use hyproxy_core::{EventDispatcher, InterceptionPipeline, MessagingService, PacketRegistry, Scheduler};
use std::sync::Arc;
use tracing::info;

pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    pub registry: Arc<PacketRegistry>,
    pub pipeline: InterceptionPipeline,
    pub sessions: Arc<SessionManager>,
    pub scheduler: Scheduler,
    pub messaging: Arc<dyn MessagingService>,
    pub relay: CredentialRelay,
    pub connector: Arc<dyn BackendConnector>,
    pub health: Arc<BackendHealthCache>,
    pub referrals: Arc<ReferralManager>,
}

impl ProxyContext {
    pub fn dispatcher(&self) -> &EventDispatcher {
        self.pipeline.dispatcher()
    }

    /// Disconnect every player and stop background work.
    pub fn shutdown(&self, reason: &str) {
        let closed = self.sessions.close_all(reason);
        self.referrals.shutdown();
        self.scheduler.shutdown();
        self.dispatcher().shutdown();
        info!(sessions = closed, "proxy context shut down");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::auth::relay::fake::FakeSessionService;
    use crate::auth::RetryPolicy;
    use crate::backend::testing::FakeConnector;
    use crate::config::BackendConfig;
    use hyproxy_core::{LocalMessaging, MappingRegistry};
    use std::time::Duration;

    pub(crate) struct TestContext {
        pub ctx: Arc<ProxyContext>,
        pub service: Arc<FakeSessionService>,
        pub connector: Arc<FakeConnector>,
        pub messaging: Arc<LocalMessaging>,
    }

    pub(crate) fn backends() -> Vec<BackendConfig> {
        vec![
            BackendConfig::new("lobby", "127.0.0.1", 5520, true),
            BackendConfig::new("survival", "127.0.0.1", 5521, false),
            BackendConfig::new("creative", "127.0.0.1", 5522, false),
        ]
    }

    pub(crate) fn context_with(config: ProxyConfig) -> TestContext {
        let service = Arc::new(FakeSessionService::default());
        let connector = Arc::new(FakeConnector::default());
        let messaging = Arc::new(LocalMessaging::new("test-proxy"));
        let scheduler = Scheduler::new();
        let referrals = ReferralManager::with_cleanup(config.transfer.referral_expiry, &scheduler);
        let ctx = Arc::new(ProxyContext {
            registry: Arc::new(PacketRegistry::standard()),
            pipeline: InterceptionPipeline::new(
                Arc::new(MappingRegistry::with_defaults()),
                EventDispatcher::new(),
            ),
            sessions: Arc::new(SessionManager::new(config.max_connections)),
            scheduler,
            messaging: messaging.clone(),
            relay: CredentialRelay::new(
                service.clone(),
                RetryPolicy::new(2, Duration::from_millis(5)),
                Some("proxy-fp".into()),
            ),
            connector: connector.clone(),
            health: Arc::new(BackendHealthCache::new(
                connector.clone(),
                config.transfer.probe_timeout,
            )),
            referrals,
            config: Arc::new(config),
        });
        TestContext {
            ctx,
            service,
            connector,
            messaging,
        }
    }

    pub(crate) fn context() -> TestContext {
        let config = ProxyConfig {
            public_address: Some("play.example.com".into()),
            connection_timeout: Duration::from_secs(2),
            backends: backends(),
            ..Default::default()
        };
        context_with(config)
    }
}
