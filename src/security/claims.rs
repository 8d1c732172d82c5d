use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::{Map, Value};
use tracing::debug;

use super::key_cache::KeyCache;
use crate::config::AuthConfig;
use crate::error::AuthError;

/// Claims of a bearer token whose signature has been checked. Only
/// [`ClaimVerifier::verify`] constructs this.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaims {
    subject: String,
    role: String,
    claims: Map<String, Value>,
}

impl VerifiedClaims {
    /// Any claim carried by the token, including ones this crate does not
    /// interpret itself.
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn role(&self) -> &str {
        &self.role
    }
}

#[derive(Debug, Clone)]
pub struct ClaimSettings {
    pub subject_claim: String,
    pub role_claim: String,
    pub enforce_expiry: bool,
}

impl ClaimSettings {
    pub fn from_config(auth: &AuthConfig) -> Self {
        Self {
            subject_claim: auth.subject_claim.trim().to_owned(),
            role_claim: auth.role_claim.trim().to_owned(),
            enforce_expiry: auth.enforce_expiry,
        }
    }
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            subject_claim: "sub".to_owned(),
            role_claim: "role".to_owned(),
            enforce_expiry: false,
        }
    }
}

pub struct ClaimVerifier {
    keys: Arc<KeyCache>,
    settings: ClaimSettings,
}

impl ClaimVerifier {
    pub fn new(keys: Arc<KeyCache>, settings: ClaimSettings) -> Self {
        Self { keys, settings }
    }

    /// Checks a compact JWS and returns its claims. Safe to call any number
    /// of times with the same token; the only side effect is a possible key
    /// cache fill.
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, AuthError> {
        let token = token.trim();
        let segments = token.split('.').collect::<Vec<_>>();
        let [header_b64, payload_b64, signature_b64] = segments.as_slice() else {
            debug!("token rejected: expected 3 segments, got {}", segments.len());
            return Err(AuthError::Unauthenticated);
        };
        if header_b64.is_empty() || payload_b64.is_empty() || signature_b64.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        let header = decode_json_object(header_b64).ok_or_else(|| {
            debug!("token rejected: header is not a base64url JSON object");
            AuthError::Unauthenticated
        })?;
        let kid = header
            .get("kid")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| {
                debug!("token rejected: header names no key id");
                AuthError::Unauthenticated
            })?;
        let alg = header.get("alg").and_then(Value::as_str).unwrap_or_default();

        let keys = self.keys.get_verification_keys().await?;
        let Some(entry) = keys.get(kid) else {
            debug!("token rejected: key id {kid} is not in the published set");
            return Err(AuthError::Unauthenticated);
        };
        if entry.key.algorithm() != alg {
            debug!(
                "token rejected: alg {alg} does not match key {kid} ({})",
                entry.key.algorithm()
            );
            return Err(AuthError::Unauthenticated);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Unauthenticated)?;
        let signing_input = format!("{header_b64}.{payload_b64}");
        if !entry.key.verify(signing_input.as_bytes(), &signature) {
            debug!("token rejected: signature mismatch for key {kid}");
            return Err(AuthError::Unauthenticated);
        }

        let claims = decode_json_object(payload_b64).ok_or_else(|| {
            debug!("token rejected: claims are not a JSON object");
            AuthError::Unauthenticated
        })?;
        self.build_claims(claims)
    }

    fn build_claims(&self, claims: Map<String, Value>) -> Result<VerifiedClaims, AuthError> {
        let subject = claims
            .get(&self.settings.subject_claim)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                debug!("token rejected: missing subject claim");
                AuthError::Unauthenticated
            })?
            .to_owned();
        let role = claims
            .get(&self.settings.role_claim)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                debug!("token rejected: missing role claim");
                AuthError::Unauthenticated
            })?
            .to_owned();

        let verified = VerifiedClaims {
            subject,
            role,
            claims,
        };
        if self.settings.enforce_expiry {
            let expired = match verified.claim("exp") {
                Some(Value::Number(exp)) => exp.as_f64().is_some_and(|exp| exp <= now_secs()),
                Some(_) => true,
                None => false,
            };
            if expired {
                debug!("token rejected: expired");
                return Err(AuthError::Unauthenticated);
            }
        }

        Ok(verified)
    }
}

/// Pulls the token out of an `Authorization` header value. A bare token
/// without a scheme is accepted as well.
pub fn extract_bearer(header_value: &str) -> Option<&str> {
    let trimmed = header_value.trim();
    if trimmed.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = match trimmed.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        Some(_) => return None,
        None => trimmed,
    };
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn decode_json_object(segment: &str) -> Option<Map<String, Value>> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
