use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
#[cfg(test)]
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ActionBinding;
use crate::dispatch::{DispatchReport, FanOutDispatcher};
use crate::error::{ActionError, AuthError};
use crate::security::{
    missing_param, AuthorizationDecision, AuthorizationEngine, AuthorizedSubject, PathParams,
};

/// Inbound administrative request. `token` is the raw bearer token.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub path_parameters: PathParams,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub action: String,
    pub subject_id: String,
    pub notification: Value,
    pub dispatch: DispatchReport,
}

/// Domain storage behind an action. Returns the notification body to fan
/// out once the write has been committed.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn apply(
        &self,
        binding: &ActionBinding,
        subject: &AuthorizedSubject,
        params: &PathParams,
        payload: &Value,
    ) -> Result<Value>;
}

/// Builds the change notification for an applied action, attributed to the
/// caller. Domain storage lives outside this process, so nothing is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationHandler;

#[async_trait]
impl ActionHandler for NotificationHandler {
    async fn apply(
        &self,
        binding: &ActionBinding,
        subject: &AuthorizedSubject,
        params: &PathParams,
        payload: &Value,
    ) -> Result<Value> {
        Ok(json!({
            "type": "event",
            "event": binding.name,
            "channel": binding.channel,
            "pathParameters": params,
            "payload": payload,
            "by": subject.subject_id,
            "at": now_ms(),
        }))
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct AppliedAction {
    pub action: String,
    pub subject_id: String,
    pub path_parameters: PathParams,
    pub payload: Value,
}

/// Test handler that remembers every action it applied.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingHandler {
    applied: Mutex<Vec<AppliedAction>>,
}

#[cfg(test)]
impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn applied(&self) -> Vec<AppliedAction> {
        self.applied.lock().await.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ActionHandler for RecordingHandler {
    async fn apply(
        &self,
        binding: &ActionBinding,
        subject: &AuthorizedSubject,
        params: &PathParams,
        payload: &Value,
    ) -> Result<Value> {
        self.applied.lock().await.push(AppliedAction {
            action: binding.name.clone(),
            subject_id: subject.subject_id.clone(),
            path_parameters: params.clone(),
            payload: payload.clone(),
        });
        NotificationHandler
            .apply(binding, subject, params, payload)
            .await
    }
}

pub struct ActionRouter {
    bindings: HashMap<String, ActionBinding>,
    engine: Arc<AuthorizationEngine>,
    handler: Arc<dyn ActionHandler>,
    dispatcher: Arc<FanOutDispatcher>,
}

impl ActionRouter {
    pub fn new(
        bindings: &[ActionBinding],
        engine: Arc<AuthorizationEngine>,
        handler: Arc<dyn ActionHandler>,
        dispatcher: Arc<FanOutDispatcher>,
    ) -> Self {
        Self {
            bindings: bindings
                .iter()
                .map(|binding| (binding.name.clone(), binding.clone()))
                .collect(),
            engine,
            handler,
            dispatcher,
        }
    }

    pub fn action_names(&self) -> Vec<&str> {
        let mut names = self.bindings.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// Answers whether `token` may run action `name` against `params`
    /// without applying it. Unknown actions are denied.
    pub async fn decide(
        &self,
        name: &str,
        token: Option<&str>,
        params: &PathParams,
    ) -> AuthorizationDecision {
        let Some(binding) = self.bindings.get(name) else {
            warn!("authorization query for unknown action {name}");
            return AuthorizationDecision::deny();
        };
        if missing_param(&binding.all_required_params(), params).is_some() {
            return AuthorizationDecision::deny();
        }
        self.engine.decide(token, &binding.predicate, params).await
    }

    pub async fn execute(
        &self,
        name: &str,
        request: ActionRequest,
    ) -> Result<ActionOutcome, ActionError> {
        let binding = self
            .bindings
            .get(name)
            .ok_or_else(|| ActionError::UnknownAction(name.to_owned()))?;
        let params = request.path_parameters;

        if let Some(missing) = missing_param(&binding.all_required_params(), &params) {
            warn!("action {name} rejected: missing {missing}");
            return Err(ActionError::Rejected(AuthError::Unauthenticated));
        }
        let subject = self
            .engine
            .authorize(request.token.as_deref(), &binding.predicate, &params)
            .await
            .map_err(|err| {
                warn!("action {name} rejected ({})", err.kind());
                ActionError::Rejected(err)
            })?;

        let notification = self
            .handler
            .apply(binding, &subject, &params, &request.payload)
            .await
            .map_err(ActionError::Apply)?;

        let subject_filter = binding
            .subject_param
            .as_ref()
            .and_then(|param| params.get(param))
            .map(String::as_str);
        let dispatch = self
            .dispatcher
            .broadcast(&binding.channel, subject_filter, &notification)
            .await
            .map_err(|source| {
                warn!("action {name} committed but notification failed: {source}");
                ActionError::NotificationFailed {
                    action: name.to_owned(),
                    source,
                }
            })?;

        info!(
            "action {name} by {} fanned out to {} connection(s)",
            subject.subject_id, dispatch.delivered
        );
        Ok(ActionOutcome {
            action: name.to_owned(),
            subject_id: subject.subject_id,
            notification,
            dispatch,
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::{
        ActionHandler, ActionRequest, ActionRouter, NotificationHandler, RecordingHandler,
    };
    use crate::config::{
        Config, CHANNEL_ASSISTANCE_REQUESTS, CHANNEL_VENUE_STATUS, ROLE_CONTROL_ROOM_OPERATOR,
        ROLE_STEWARD,
    };
    use crate::dispatch::tests::{CountingRegistry, ScriptedTransport};
    use crate::dispatch::FanOutDispatcher;
    use crate::error::{ActionError, AuthError, DispatchError};
    use crate::registry::ConnectionRegistry;
    use crate::roster::InMemoryRosterLookup;
    use crate::security::claims::{ClaimSettings, ClaimVerifier};
    use crate::security::key_cache::KeyCache;
    use crate::security::testing::{claims_for, hs256_published_key, sign_hs256, StaticKeySource};
    use crate::security::{AuthorizationEngine, AuthorizedSubject, PathParams};
    use crate::transport::DeliveryOutcome;

    const SECRET: &[u8] = b"actions-secret";

    struct Harness {
        router: ActionRouter,
        handler: Arc<RecordingHandler>,
        registry: Arc<CountingRegistry>,
        transport: Arc<ScriptedTransport>,
    }

    fn harness() -> Harness {
        let source = Arc::new(StaticKeySource::new(vec![hs256_published_key("k1", SECRET)]));
        let verifier = ClaimVerifier::new(
            Arc::new(KeyCache::new(source, None)),
            ClaimSettings::default(),
        );
        let roster = Arc::new(InMemoryRosterLookup::new().with_event("E1", &[("P1", "alice")]));
        let engine = Arc::new(AuthorizationEngine::new(verifier, roster));
        let registry = Arc::new(CountingRegistry::new());
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Arc::new(FanOutDispatcher::new(
            registry.clone(),
            transport.clone(),
            Duration::from_millis(500),
        ));
        let handler = Arc::new(RecordingHandler::new());
        let router = ActionRouter::new(
            &Config::default().actions,
            engine,
            handler.clone(),
            dispatcher,
        );
        Harness {
            router,
            handler,
            registry,
            transport,
        }
    }

    fn token(subject: &str, role: &str) -> Option<String> {
        Some(sign_hs256("k1", SECRET, &claims_for(subject, role)))
    }

    fn params(pairs: &[(&str, &str)]) -> PathParams {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[tokio::test]
    async fn venue_status_update_fans_out_to_event_subscribers() {
        let h = harness();
        h.registry
            .register(CHANNEL_VENUE_STATUS, "c1", Some("E1"))
            .await
            .expect("c1");
        h.registry
            .register(CHANNEL_VENUE_STATUS, "c2", Some("E2"))
            .await
            .expect("c2");

        let outcome = h
            .router
            .execute(
                "venue-status.update",
                ActionRequest {
                    token: token("ops-1", ROLE_CONTROL_ROOM_OPERATOR),
                    path_parameters: params(&[("eventId", "E1"), ("venueId", "V3")]),
                    payload: json!({ "status": "High" }),
                },
            )
            .await
            .expect("execute");
        assert_eq!(outcome.subject_id, "ops-1");
        assert_eq!(outcome.dispatch.delivered, 1);
        assert_eq!(outcome.notification["by"], "ops-1");
        assert_eq!(outcome.notification["payload"]["status"], "High");
        assert_eq!(h.transport.received_by(), vec!["c1"]);
        let applied = h.handler.applied().await;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].action, "venue-status.update");
        assert_eq!(applied[0].subject_id, "ops-1");
        assert_eq!(applied[0].path_parameters["venueId"], "V3");
        assert_eq!(applied[0].payload["status"], "High");
    }

    #[tokio::test]
    async fn notification_handler_keeps_nothing_between_actions() -> anyhow::Result<()> {
        let config = Config::default();
        let binding = config
            .actions
            .iter()
            .find(|binding| binding.name == "venue-status.update")
            .ok_or_else(|| anyhow::anyhow!("venue-status.update binding"))?;
        let subject = AuthorizedSubject {
            subject_id: "ops-1".to_owned(),
            role: ROLE_CONTROL_ROOM_OPERATOR.to_owned(),
        };
        let handler = NotificationHandler;
        for i in 0..10_000 {
            let venue = format!("V{i}");
            let notification = handler
                .apply(
                    binding,
                    &subject,
                    &params(&[("eventId", "E1"), ("venueId", venue.as_str())]),
                    &json!({ "status": "High" }),
                )
                .await?;
            assert_eq!(notification["type"], "event");
            assert_eq!(notification["channel"], CHANNEL_VENUE_STATUS);
            assert_eq!(notification["pathParameters"]["venueId"], venue);
            assert_eq!(notification["by"], "ops-1");
        }
        assert_eq!(std::mem::size_of::<NotificationHandler>(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn rostered_steward_can_raise_assistance_for_own_position() {
        let h = harness();
        h.registry
            .register(CHANNEL_ASSISTANCE_REQUESTS, "ops-screen", Some("E1"))
            .await
            .expect("register");

        let ok = h
            .router
            .execute(
                "assistance-request.raise",
                ActionRequest {
                    token: token("alice", ROLE_STEWARD),
                    path_parameters: params(&[("eventId", "E1"), ("positionId", "P1")]),
                    payload: json!({ "note": "medical" }),
                },
            )
            .await
            .expect("allowed");
        assert_eq!(ok.subject_id, "alice");

        let denied = h
            .router
            .execute(
                "assistance-request.raise",
                ActionRequest {
                    token: token("alice", ROLE_STEWARD),
                    path_parameters: params(&[("eventId", "E1"), ("positionId", "P2")]),
                    payload: json!({}),
                },
            )
            .await
            .expect_err("denied");
        assert!(matches!(denied, ActionError::Rejected(AuthError::Denied)));
        assert_eq!(h.handler.applied().await.len(), 1);
    }

    #[tokio::test]
    async fn denial_takes_no_action() {
        let h = harness();
        let err = h
            .router
            .execute(
                "venue-status.update",
                ActionRequest {
                    token: token("s-1", ROLE_STEWARD),
                    path_parameters: params(&[("eventId", "E1"), ("venueId", "V3")]),
                    payload: json!({ "status": "High" }),
                },
            )
            .await
            .expect_err("denied");
        assert!(matches!(err, ActionError::Rejected(_)));
        assert!(!err.write_committed());
        assert!(h.handler.applied().await.is_empty());
    }

    #[tokio::test]
    async fn missing_binding_parameter_is_rejected_up_front() {
        let h = harness();
        let err = h
            .router
            .execute(
                "assistance-request.handle",
                ActionRequest {
                    token: token("ops-1", ROLE_CONTROL_ROOM_OPERATOR),
                    path_parameters: params(&[("eventId", "E1")]),
                    payload: json!({}),
                },
            )
            .await
            .expect_err("missing requestId");
        assert!(matches!(err, ActionError::Rejected(AuthError::Unauthenticated)));
    }

    #[tokio::test]
    async fn decide_answers_without_applying() {
        let h = harness();
        let staff = params(&[("username", "alice")]);
        let allowed = h
            .router
            .decide(
                "staff.availability.update",
                token("alice", ROLE_STEWARD).as_deref(),
                &staff,
            )
            .await;
        assert!(allowed.allowed);
        assert_eq!(allowed.subject_id.as_deref(), Some("alice"));

        let denied = h
            .router
            .decide(
                "staff.availability.update",
                token("bob", ROLE_STEWARD).as_deref(),
                &staff,
            )
            .await;
        assert!(!denied.allowed);
        assert!(denied.subject_id.is_none());

        let unknown = h
            .router
            .decide("venue.delete", token("alice", ROLE_STEWARD).as_deref(), &staff)
            .await;
        assert!(!unknown.allowed);
        assert!(h.handler.applied().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let h = harness();
        let err = h
            .router
            .execute("venue.delete", ActionRequest::default())
            .await
            .expect_err("unknown");
        assert!(matches!(err, ActionError::UnknownAction(name) if name == "venue.delete"));
    }

    #[tokio::test]
    async fn delivery_failure_reports_committed_write_as_failed() {
        let h = harness();
        h.registry
            .register(CHANNEL_VENUE_STATUS, "c1", Some("E1"))
            .await
            .expect("c1");
        h.registry
            .register(CHANNEL_VENUE_STATUS, "c2", Some("E1"))
            .await
            .expect("c2");
        h.transport
            .script("c2", DeliveryOutcome::Failed("status 500".to_owned()));

        let err = h
            .router
            .execute(
                "venue-status.update",
                ActionRequest {
                    token: token("ops-1", ROLE_CONTROL_ROOM_OPERATOR),
                    path_parameters: params(&[("eventId", "E1"), ("venueId", "V3")]),
                    payload: json!({ "status": "High" }),
                },
            )
            .await
            .expect_err("notification failure surfaces");
        assert!(err.write_committed());
        match &err {
            ActionError::NotificationFailed { action, source } => {
                assert_eq!(action, "venue-status.update");
                assert!(matches!(source, DispatchError::DeliveryFailed { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The write went through and the healthy peer was still notified.
        assert_eq!(h.handler.applied().await.len(), 1);
        assert_eq!(h.transport.received_by(), vec!["c1"]);
    }

    #[tokio::test]
    async fn gone_peer_does_not_fail_the_action() {
        let h = harness();
        h.registry
            .register(CHANNEL_VENUE_STATUS, "c1", Some("E1"))
            .await
            .expect("c1");
        h.transport.script("c1", DeliveryOutcome::Gone);
        let outcome = h
            .router
            .execute(
                "venue-status.update",
                ActionRequest {
                    token: token("ops-1", ROLE_CONTROL_ROOM_OPERATOR),
                    path_parameters: params(&[("eventId", "E1"), ("venueId", "V3")]),
                    payload: json!({ "status": "Low" }),
                },
            )
            .await
            .expect("gone is fine");
        assert_eq!(outcome.dispatch.evicted, 1);
        assert_eq!(h.registry.unregister_count("c1"), 1);
    }
}
