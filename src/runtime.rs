use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

use crate::actions::{ActionHandler, ActionRouter, NotificationHandler};
use crate::config::Config;
use crate::dispatch::FanOutDispatcher;
use crate::gateway_server::GatewayServer;
use crate::lifecycle::ConnectionLifecycle;
use crate::registry::{ConnectionRegistry, RegistryStore};
use crate::roster::{FileRosterLookup, RosterLookup};
use crate::security::key_cache::{key_source_from_config, KeySource};
use crate::security::{AuthorizationEngine, ClaimSettings, ClaimVerifier, KeyCache};
use crate::transport::{transport_from_config, LocalTransport};

/// Everything the listeners need, wired once per process.
pub struct Services {
    pub lifecycle: Arc<ConnectionLifecycle>,
    pub actions: Arc<ActionRouter>,
    pub local: LocalTransport,
}

impl Services {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = RegistryStore::open(config.registry.path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed opening connection registry {}",
                    config.registry.path.display()
                )
            })?;
        info!(
            "connection registry backend={} path={}",
            registry.backend_name(),
            config.registry.path.display()
        );
        Self::assemble(
            config,
            key_source_from_config(&config.auth)?,
            Arc::new(FileRosterLookup::new(config.roster.dir.clone())),
            Arc::new(registry),
            Arc::new(NotificationHandler),
        )
    }

    pub fn assemble(
        config: &Config,
        key_source: Arc<dyn KeySource>,
        roster: Arc<dyn RosterLookup>,
        registry: Arc<dyn ConnectionRegistry>,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<Self> {
        let keys = Arc::new(KeyCache::for_source(key_source, &config.auth));
        let verifier = ClaimVerifier::new(keys, ClaimSettings::from_config(&config.auth));
        let engine = Arc::new(AuthorizationEngine::new(verifier, roster));

        let local = LocalTransport::new();
        let transport = transport_from_config(&config.dispatch, &local)?;
        let dispatcher = Arc::new(FanOutDispatcher::new(
            registry.clone(),
            transport,
            Duration::from_millis(config.dispatch.delivery_timeout_ms),
        ));
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            engine.clone(),
            registry,
            config.auth.connect_roles.clone(),
        ));
        let actions = Arc::new(ActionRouter::new(
            &config.actions,
            engine,
            handler,
            dispatcher,
        ));
        Ok(Self {
            lifecycle,
            actions,
            local,
        })
    }
}

pub struct StaffingRuntime {
    config: Config,
}

impl StaffingRuntime {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting runtime (bind={}, http_bind={}, transport={:?}, registry={}, actions={})",
            self.config.server.bind,
            self.config.server.http_bind.as_deref().unwrap_or("-"),
            self.config.dispatch.transport,
            self.config.registry.path.display(),
            self.config.actions.len()
        );
        let services = Arc::new(Services::from_config(&self.config).await?);
        let server = GatewayServer::new(self.config.server.clone(), services);
        tokio::select! {
            res = server.run_forever() => res,
            _ = signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                Ok(())
            }
        }
    }
}
