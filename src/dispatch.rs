use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{DeliveryFailure, DispatchError};
use crate::registry::{ConnectionEntry, ConnectionRegistry};
use crate::transport::{DeliveryOutcome, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub channel: String,
    pub attempted: usize,
    pub delivered: usize,
    pub evicted: usize,
}

pub struct FanOutDispatcher {
    registry: Arc<dyn ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    delivery_timeout: Duration,
}

impl FanOutDispatcher {
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            delivery_timeout,
        }
    }

    /// Delivers `payload` to every connection on `channel`.
    ///
    /// The candidate set is read once. Every candidate gets exactly one
    /// attempt regardless of how the others fare; peers reported gone are
    /// evicted afterwards, and any other failure fails the whole call once
    /// all attempts have finished.
    pub async fn broadcast(
        &self,
        channel: &str,
        subject_filter: Option<&str>,
        payload: &Value,
    ) -> Result<DispatchReport, DispatchError> {
        let candidates = self
            .registry
            .list_by_channel(channel, subject_filter)
            .await?;
        let mut report = DispatchReport {
            channel: channel.to_owned(),
            attempted: candidates.len(),
            delivered: 0,
            evicted: 0,
        };
        if candidates.is_empty() {
            debug!("broadcast on {channel}: no connections");
            return Ok(report);
        }

        let body = payload.to_string();
        let outcomes = join_all(
            candidates
                .iter()
                .map(|entry| self.deliver(entry, body.as_str())),
        )
        .await;

        let mut failures = Vec::new();
        for (entry, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                DeliveryOutcome::Delivered => report.delivered += 1,
                DeliveryOutcome::Gone => {
                    if self.evict(entry).await {
                        report.evicted += 1;
                    }
                }
                DeliveryOutcome::Failed(detail) => failures.push(DeliveryFailure {
                    connection_handle: entry.connection_handle.clone(),
                    detail,
                }),
            }
        }

        if !failures.is_empty() {
            warn!(
                "broadcast on {channel}: {} of {} deliveries failed",
                failures.len(),
                report.attempted
            );
            return Err(DispatchError::DeliveryFailed {
                channel: channel.to_owned(),
                failures,
            });
        }
        info!(
            "broadcast on {channel}: delivered={} evicted={}",
            report.delivered, report.evicted
        );
        Ok(report)
    }

    async fn deliver(&self, entry: &ConnectionEntry, body: &str) -> DeliveryOutcome {
        let handle = entry.connection_handle.as_str();
        let outcome = match tokio::time::timeout(
            self.delivery_timeout,
            self.transport.send(handle, body),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::Failed(format!(
                "delivery timed out after {}ms",
                self.delivery_timeout.as_millis()
            )),
        };
        debug!("delivery to {handle} on {}: {outcome:?}", entry.channel);
        outcome
    }

    async fn evict(&self, entry: &ConnectionEntry) -> bool {
        match self
            .registry
            .unregister(&entry.channel, &entry.connection_handle)
            .await
        {
            Ok(()) => {
                info!(
                    "evicted gone connection {} from {}",
                    entry.connection_handle, entry.channel
                );
                true
            }
            Err(err) => {
                warn!(
                    "eviction of {} from {} failed: {err}",
                    entry.connection_handle, entry.channel
                );
                false
            }
        }
    }
}
