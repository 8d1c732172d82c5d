use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::claims::{ClaimVerifier, VerifiedClaims};
use crate::error::AuthError;
use crate::roster::RosterLookup;

pub type PathParams = HashMap<String, String>;

/// One authorization check, chosen per route when the action table is
/// configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// The caller's role claim is one of `roles` (exact match).
    RoleIn { roles: Vec<String> },
    /// Path parameter `param` equals the caller's subject identifier.
    SameSubject { param: String },
    /// The caller is rostered on event `event_param` at position
    /// `position_param`.
    SamePositionAssignment {
        event_param: String,
        position_param: String,
    },
}

impl Predicate {
    pub fn name(&self) -> &'static str {
        match self {
            Predicate::RoleIn { .. } => "role_in",
            Predicate::SameSubject { .. } => "same_subject",
            Predicate::SamePositionAssignment { .. } => "same_position_assignment",
        }
    }

    pub fn required_params(&self) -> Vec<String> {
        match self {
            Predicate::RoleIn { .. } => Vec::new(),
            Predicate::SameSubject { param } => vec![param.clone()],
            Predicate::SamePositionAssignment {
                event_param,
                position_param,
            } => vec![event_param.clone(), position_param.clone()],
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Predicate::RoleIn { roles } => {
                if roles.iter().all(|role| role.trim().is_empty()) {
                    return Err(anyhow!("role_in needs at least one role"));
                }
            }
            Predicate::SameSubject { param } => {
                if param.trim().is_empty() {
                    return Err(anyhow!("same_subject needs a path parameter name"));
                }
            }
            Predicate::SamePositionAssignment {
                event_param,
                position_param,
            } => {
                if event_param.trim().is_empty() || position_param.trim().is_empty() {
                    return Err(anyhow!(
                        "same_position_assignment needs event and position parameter names"
                    ));
                }
            }
        }
        Ok(())
    }

    pub async fn evaluate(
        &self,
        claims: &VerifiedClaims,
        params: &PathParams,
        roster: &dyn RosterLookup,
    ) -> bool {
        match self {
            Predicate::RoleIn { roles } => roles.iter().any(|role| role == claims.role()),
            Predicate::SameSubject { param } => params
                .get(param)
                .is_some_and(|value| value == claims.subject()),
            Predicate::SamePositionAssignment {
                event_param,
                position_param,
            } => {
                let (Some(event_id), Some(position_id)) =
                    (params.get(event_param), params.get(position_param))
                else {
                    return false;
                };
                match roster.get_event_roster(event_id).await {
                    Ok(Some(roster)) => roster.assigns(claims.subject(), position_id),
                    Ok(None) => {
                        debug!("roster lookup miss for event {event_id}");
                        false
                    }
                    Err(err) => {
                        warn!("roster lookup for event {event_id} failed: {err:#}");
                        false
                    }
                }
            }
        }
    }
}

/// First required parameter that is absent or blank.
pub fn missing_param<'a>(required: &'a [String], params: &PathParams) -> Option<&'a str> {
    required
        .iter()
        .find(|name| {
            params
                .get(name.as_str())
                .map(|value| value.trim().is_empty())
                .unwrap_or(true)
        })
        .map(String::as_str)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedSubject {
    pub subject_id: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
}

impl AuthorizationDecision {
    pub fn deny() -> Self {
        Self {
            allowed: false,
            subject_id: None,
        }
    }
}

pub struct AuthorizationEngine {
    verifier: ClaimVerifier,
    roster: Arc<dyn RosterLookup>,
}

impl AuthorizationEngine {
    pub fn new(verifier: ClaimVerifier, roster: Arc<dyn RosterLookup>) -> Self {
        Self { verifier, roster }
    }

    /// Parameter check, then token verification, then exactly one predicate.
    /// Any failure along the way is a denial.
    pub async fn authorize(
        &self,
        token: Option<&str>,
        predicate: &Predicate,
        params: &PathParams,
    ) -> Result<AuthorizedSubject, AuthError> {
        let required = predicate.required_params();
        if let Some(name) = missing_param(&required, params) {
            debug!("{} denied before verification: missing {name}", predicate.name());
            return Err(AuthError::Unauthenticated);
        }
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::Unauthenticated)?;

        let claims = self.verifier.verify(token).await?;
        if !predicate
            .evaluate(&claims, params, self.roster.as_ref())
            .await
        {
            debug!("{} denied subject {}", predicate.name(), claims.subject());
            return Err(AuthError::Denied);
        }
        Ok(AuthorizedSubject {
            subject_id: claims.subject().to_owned(),
            role: claims.role().to_owned(),
        })
    }

    /// Same pipeline as [`authorize`](Self::authorize), collapsed into the
    /// uniform allow/deny value callers hand back to clients.
    pub async fn decide(
        &self,
        token: Option<&str>,
        predicate: &Predicate,
        params: &PathParams,
    ) -> AuthorizationDecision {
        match self.authorize(token, predicate, params).await {
            Ok(subject) => AuthorizationDecision {
                allowed: true,
                subject_id: Some(subject.subject_id),
            },
            Err(err) => {
                warn!("authorization {} denied ({})", predicate.name(), err.kind());
                AuthorizationDecision::deny()
            }
        }
    }
}
