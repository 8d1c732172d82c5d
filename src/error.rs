use thiserror::Error;

/// Failure of the claim-verification / predicate pipeline.
///
/// Callers outside the security module must treat every variant as a
/// denial; the variants only exist so logs and tests can tell them apart.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("verification keys unavailable: {0}")]
    KeySourceUnavailable(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("denied")]
    Denied,
}

impl AuthError {
    /// Stable label for logs. Never includes token material.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::KeySourceUnavailable(_) => "key_source_unavailable",
            AuthError::Unauthenticated => "unauthenticated",
            AuthError::Denied => "denied",
        }
    }
}

#[derive(Debug, Error)]
#[error("connection registry failure: {0}")]
pub struct RegistryError(pub String);

impl RegistryError {
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        Self(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub connection_handle: String,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(
        "delivery failed on channel {channel} for {} connection(s): {}",
        .failures.len(),
        summarize_failures(.failures)
    )]
    DeliveryFailed {
        channel: String,
        failures: Vec<DeliveryFailure>,
    },
}

fn summarize_failures(failures: &[DeliveryFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.connection_handle, failure.detail))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("connection rejected")]
    Rejected(#[source] AuthError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("request rejected")]
    Rejected(#[source] AuthError),
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("action failed to apply: {0:#}")]
    Apply(anyhow::Error),
    /// The domain write behind `action` has already been committed; only
    /// the change notification failed to fan out.
    #[error("action `{action}` was committed but its notification failed: {source}")]
    NotificationFailed {
        action: String,
        #[source]
        source: DispatchError,
    },
}

impl ActionError {
    /// True when the underlying domain write went through even though the
    /// action as a whole is reported as failed.
    pub fn write_committed(&self) -> bool {
        matches!(self, ActionError::NotificationFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{ActionError, AuthError, DeliveryFailure, DispatchError};

    #[test]
    fn auth_error_messages_do_not_leak_reasons() {
        assert_eq!(AuthError::Unauthenticated.to_string(), "unauthenticated");
        assert_eq!(AuthError::Denied.to_string(), "denied");
        assert_eq!(AuthError::Denied.kind(), "denied");
    }

    #[test]
    fn delivery_failure_keeps_transport_detail() {
        let err = DispatchError::DeliveryFailed {
            channel: "venue-status".to_owned(),
            failures: vec![DeliveryFailure {
                connection_handle: "c9".to_owned(),
                detail: "status 500".to_owned(),
            }],
        };
        let text = err.to_string();
        assert!(text.contains("venue-status"), "unexpected: {text}");
        assert!(text.contains("c9: status 500"), "unexpected: {text}");
    }

    #[test]
    fn notification_failure_reports_committed_write() {
        let err = ActionError::NotificationFailed {
            action: "venue-status.update".to_owned(),
            source: DispatchError::DeliveryFailed {
                channel: "venue-status".to_owned(),
                failures: vec![],
            },
        };
        assert!(err.write_committed());
        assert!(err.to_string().contains("was committed"));
        assert!(!ActionError::Rejected(AuthError::Denied).write_committed());
    }
}
