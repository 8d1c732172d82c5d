use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{AuthError, LifecycleError};
use crate::registry::ConnectionRegistry;
use crate::security::{AuthorizationEngine, PathParams, Predicate};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub connection_handle: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub connection_handle: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Proof that a connection was authorized and registered. Consumed by
/// [`ConnectionLifecycle::release`] when the transport sees the peer leave.
#[derive(Debug)]
pub struct ConnectionGrant {
    connection_handle: String,
    channels: Vec<String>,
    subject_id: Option<String>,
    authorized_subject: String,
}

impl ConnectionGrant {
    pub fn connection_handle(&self) -> &str {
        &self.connection_handle
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.subject_id.as_deref()
    }

    pub fn authorized_subject(&self) -> &str {
        &self.authorized_subject
    }
}

pub struct ConnectionLifecycle {
    engine: Arc<AuthorizationEngine>,
    registry: Arc<dyn ConnectionRegistry>,
    gate: Predicate,
}

impl ConnectionLifecycle {
    pub fn new(
        engine: Arc<AuthorizationEngine>,
        registry: Arc<dyn ConnectionRegistry>,
        connect_roles: Vec<String>,
    ) -> Self {
        Self {
            engine,
            registry,
            gate: Predicate::RoleIn {
                roles: connect_roles,
            },
        }
    }

    pub async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<ConnectionGrant, LifecycleError> {
        let handle = request.connection_handle.trim().to_owned();
        let channels = normalize_channels(&request.channels);
        if handle.is_empty() || channels.is_empty() {
            return Err(LifecycleError::Rejected(AuthError::Unauthenticated));
        }
        let subject_id = request
            .subject_id
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let authorized = self
            .engine
            .authorize(request.token.as_deref(), &self.gate, &PathParams::new())
            .await
            .map_err(|err| {
                warn!("connect {handle} rejected ({})", err.kind());
                LifecycleError::Rejected(err)
            })?;

        let mut registered: Vec<&str> = Vec::with_capacity(channels.len());
        for channel in &channels {
            if let Err(err) = self
                .registry
                .register(channel, &handle, subject_id.as_deref())
                .await
            {
                self.roll_back(&handle, &registered).await;
                return Err(err.into());
            }
            registered.push(channel);
        }

        info!(
            "connection {handle} registered on [{}] for {} ({})",
            channels.join(", "),
            authorized.subject_id,
            authorized.role
        );
        Ok(ConnectionGrant {
            connection_handle: handle,
            channels,
            subject_id,
            authorized_subject: authorized.subject_id,
        })
    }

    /// Explicit disconnect trigger. Same gate as connect; channels default to
    /// nothing, so callers must name what they are leaving.
    pub async fn disconnect(&self, request: DisconnectRequest) -> Result<(), LifecycleError> {
        let handle = request.connection_handle.trim();
        let channels = normalize_channels(&request.channels);
        if handle.is_empty() || channels.is_empty() {
            return Err(LifecycleError::Rejected(AuthError::Unauthenticated));
        }
        self.engine
            .authorize(request.token.as_deref(), &self.gate, &PathParams::new())
            .await
            .map_err(|err| {
                warn!("disconnect {handle} rejected ({})", err.kind());
                LifecycleError::Rejected(err)
            })?;
        for channel in &channels {
            self.registry.unregister(channel, handle).await?;
        }
        info!("connection {handle} left [{}]", channels.join(", "));
        Ok(())
    }

    pub async fn release(&self, grant: ConnectionGrant) -> Result<(), LifecycleError> {
        let mut first_error = None;
        for channel in &grant.channels {
            if let Err(err) = self
                .registry
                .unregister(channel, &grant.connection_handle)
                .await
            {
                warn!(
                    "release of {} from {channel} failed: {err}",
                    grant.connection_handle
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => {
                info!("connection {} released", grant.connection_handle);
                Ok(())
            }
        }
    }

    async fn roll_back(&self, handle: &str, channels: &[&str]) {
        for channel in channels {
            if let Err(err) = self.registry.unregister(channel, handle).await {
                warn!("rollback of {handle} on {channel} failed: {err}");
            }
        }
    }
}

fn normalize_channels(raw: &[String]) -> Vec<String> {
    let mut channels: Vec<String> = Vec::with_capacity(raw.len());
    for channel in raw {
        let channel = channel.trim();
        if !channel.is_empty() && !channels.iter().any(|seen| seen == channel) {
            channels.push(channel.to_owned());
        }
    }
    channels
}
