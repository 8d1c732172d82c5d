use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// One entry of a published JSON Web Key Set, restricted to the fields
/// needed to derive a verification key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedKey {
    pub kid: String,
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublishedKeySet {
    #[serde(default)]
    keys: Vec<PublishedKey>,
}

#[derive(Clone)]
pub enum VerificationKey {
    Hs256(Vec<u8>),
    Ed25519(VerifyingKey),
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationKey::Hs256(_) => f.write_str("Hs256(..)"),
            VerificationKey::Ed25519(key) => write!(f, "Ed25519({:?})", key.as_bytes()),
        }
    }
}

impl VerificationKey {
    pub fn algorithm(&self) -> &'static str {
        match self {
            VerificationKey::Hs256(_) => "HS256",
            VerificationKey::Ed25519(_) => "EdDSA",
        }
    }

    pub fn verify(&self, signing_input: &[u8], signature: &[u8]) -> bool {
        match self {
            VerificationKey::Hs256(secret) => {
                let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
                    return false;
                };
                mac.update(signing_input);
                mac.verify_slice(signature).is_ok()
            }
            VerificationKey::Ed25519(key) => {
                let Ok(signature) = Signature::from_slice(signature) else {
                    return false;
                };
                key.verify(signing_input, &signature).is_ok()
            }
        }
    }
}

/// The published key as fetched, next to the key derived from it.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub raw: PublishedKey,
    pub key: VerificationKey,
}

pub type KeySet = HashMap<String, KeyEntry>;

#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch_published_keys(&self) -> Result<Vec<PublishedKey>>;
}

pub struct HttpKeySource {
    url: String,
    http: reqwest::Client,
}

impl HttpKeySource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed building key endpoint http client")?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch_published_keys(&self) -> Result<Vec<PublishedKey>> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("key endpoint request to {} failed", self.url))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("key endpoint body read failed")?;
        if !status.is_success() {
            return Err(anyhow!(
                "key endpoint {} returned status {}",
                self.url,
                status.as_u16()
            ));
        }
        parse_published_keys(&body)
    }
}

/// Reads a key set document from local disk; for air-gapped deployments.
pub struct FileKeySource {
    path: PathBuf,
}

impl FileKeySource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl KeySource for FileKeySource {
    async fn fetch_published_keys(&self) -> Result<Vec<PublishedKey>> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed reading key set {}", self.path.display()))?;
        parse_published_keys(&body)
    }
}

pub fn key_source_from_config(auth: &AuthConfig) -> Result<Arc<dyn KeySource>> {
    let url = Url::parse(auth.jwks_url.trim()).context("auth.jwks_url is not a valid URL")?;
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("auth.jwks_url file URL has no usable path"))?;
            Ok(Arc::new(FileKeySource::new(path)))
        }
        "http" | "https" => Ok(Arc::new(HttpKeySource::new(
            url.as_str(),
            Duration::from_millis(auth.key_fetch_timeout_ms.max(100)),
        )?)),
        other => Err(anyhow!("unsupported key source scheme `{other}`")),
    }
}

fn parse_published_keys(body: &str) -> Result<Vec<PublishedKey>> {
    let set: PublishedKeySet =
        serde_json::from_str(body).context("key set document is not valid JWKS JSON")?;
    Ok(set.keys)
}

pub fn derive_verification_key(published: &PublishedKey) -> Result<VerificationKey> {
    match published.kty.as_str() {
        "oct" => {
            if let Some(alg) = published.alg.as_deref() {
                if alg != "HS256" {
                    return Err(anyhow!("unsupported oct algorithm `{alg}`"));
                }
            }
            let secret = published
                .k
                .as_deref()
                .ok_or_else(|| anyhow!("oct key is missing `k`"))?;
            let secret = URL_SAFE_NO_PAD
                .decode(secret.trim_end_matches('='))
                .context("oct key `k` is not base64url")?;
            if secret.is_empty() {
                return Err(anyhow!("oct key `k` is empty"));
            }
            Ok(VerificationKey::Hs256(secret))
        }
        "OKP" => {
            if published.crv.as_deref() != Some("Ed25519") {
                return Err(anyhow!("unsupported OKP curve {:?}", published.crv));
            }
            if let Some(alg) = published.alg.as_deref() {
                if alg != "EdDSA" {
                    return Err(anyhow!("unsupported OKP algorithm `{alg}`"));
                }
            }
            let x = published
                .x
                .as_deref()
                .ok_or_else(|| anyhow!("OKP key is missing `x`"))?;
            let bytes = URL_SAFE_NO_PAD
                .decode(x.trim_end_matches('='))
                .context("OKP key `x` is not base64url")?;
            let bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("Ed25519 public key must be 32 bytes"))?;
            let key = VerifyingKey::from_bytes(&bytes).context("invalid Ed25519 public key")?;
            Ok(VerificationKey::Ed25519(key))
        }
        other => Err(anyhow!("unsupported key type `{other}`")),
    }
}

struct CachedKeys {
    keys: Arc<KeySet>,
    fetched_at: Instant,
}

/// Memoizes the published key set for as long as the process stays warm.
///
/// The whole set is swapped at once on refresh; a cold cache produces the
/// same answers as a warm one, only after one extra fetch.
pub struct KeyCache {
    source: Arc<dyn KeySource>,
    ttl: Option<Duration>,
    state: RwLock<Option<CachedKeys>>,
}

impl KeyCache {
    pub fn new(source: Arc<dyn KeySource>, ttl: Option<Duration>) -> Self {
        Self {
            source,
            ttl: ttl.filter(|ttl| !ttl.is_zero()),
            state: RwLock::new(None),
        }
    }

    pub fn from_config(auth: &AuthConfig) -> Result<Self> {
        Ok(Self::for_source(key_source_from_config(auth)?, auth))
    }

    /// Wraps `source` with the expiry configured in `auth`; a zero TTL keeps
    /// keys for the life of the process.
    pub fn for_source(source: Arc<dyn KeySource>, auth: &AuthConfig) -> Self {
        let ttl = Duration::from_secs(auth.key_cache_ttl_secs);
        Self::new(source, Some(ttl))
    }

    pub async fn get_verification_keys(&self) -> Result<Arc<KeySet>, AuthError> {
        {
            let guard = self.state.read().await;
            if let Some(cached) = guard.as_ref() {
                if !self.is_stale(cached) {
                    return Ok(cached.keys.clone());
                }
                debug!("verification key cache expired, refreshing");
            }
        }
        self.refresh().await
    }

    /// Fetches the full key set and replaces the cached one. On failure the
    /// previous set is discarded so a broken source can never be papered
    /// over by stale keys.
    pub async fn refresh(&self) -> Result<Arc<KeySet>, AuthError> {
        let fetched = match self.source.fetch_published_keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("verification key fetch failed: {err:#}");
                self.invalidate().await;
                return Err(AuthError::KeySourceUnavailable(format!("{err:#}")));
            }
        };

        let mut keys = KeySet::with_capacity(fetched.len());
        for published in fetched {
            let kid = published.kid.trim();
            if kid.is_empty() {
                warn!("skipping published key without kid");
                continue;
            }
            match derive_verification_key(&published) {
                Ok(key) => {
                    keys.insert(
                        kid.to_owned(),
                        KeyEntry {
                            raw: published.clone(),
                            key,
                        },
                    );
                }
                Err(err) => warn!("skipping published key {kid}: {err:#}"),
            }
        }

        let keys = Arc::new(keys);
        let mut guard = self.state.write().await;
        *guard = Some(CachedKeys {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        info!("verification key cache loaded {} key(s)", keys.len());
        Ok(keys)
    }

    pub async fn invalidate(&self) {
        let mut guard = self.state.write().await;
        *guard = None;
    }

    fn is_stale(&self, cached: &CachedKeys) -> bool {
        self.ttl.is_some_and(|ttl| cached.fetched_at.elapsed() >= ttl)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{
        derive_verification_key, key_source_from_config, KeyCache, KeySource, PublishedKey,
    };
    use crate::config::AuthConfig;
    use crate::error::AuthError;
    use crate::security::testing::{ed25519_published_key, hs256_published_key, StaticKeySource};

    #[tokio::test]
    async fn fetches_once_per_warm_lifetime() {
        let source = Arc::new(StaticKeySource::new(vec![hs256_published_key(
            "kid-a", b"secret-a",
        )]));
        let cache = KeyCache::new(source.clone(), None);

        let first = cache.get_verification_keys().await.expect("keys");
        let second = cache.get_verification_keys().await.expect("keys");
        assert!(first.contains_key("kid-a"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_full_refetch() {
        let source = Arc::new(StaticKeySource::new(vec![hs256_published_key(
            "kid-a", b"secret-a",
        )]));
        let cache = KeyCache::new(source.clone(), None);
        cache.get_verification_keys().await.expect("keys");

        source.replace(vec![hs256_published_key("kid-b", b"secret-b")]);
        cache.invalidate().await;
        let keys = cache.get_verification_keys().await.expect("keys");
        assert!(!keys.contains_key("kid-a"), "old set must be replaced wholesale");
        assert!(keys.contains_key("kid-b"));
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn ttl_expiry_triggers_refetch() {
        let source = Arc::new(StaticKeySource::new(vec![hs256_published_key(
            "kid-a", b"secret-a",
        )]));
        let cache = KeyCache::new(source.clone(), Some(Duration::from_millis(20)));
        cache.get_verification_keys().await.expect("keys");
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.get_verification_keys().await.expect("keys");
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn configured_ttl_applies_to_any_source() {
        let source = Arc::new(StaticKeySource::new(vec![hs256_published_key(
            "kid-a", b"secret-a",
        )]));
        let forever = KeyCache::for_source(source.clone(), &AuthConfig::default());
        assert_eq!(forever.ttl, None);
        forever.get_verification_keys().await.expect("keys");
        forever.get_verification_keys().await.expect("keys");
        assert_eq!(source.fetch_count(), 1);

        let auth = AuthConfig {
            key_cache_ttl_secs: 300,
            ..AuthConfig::default()
        };
        let expiring = KeyCache::for_source(source, &auth);
        assert_eq!(expiring.ttl, Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn fetch_failure_is_key_source_unavailable_and_drops_old_set() {
        let source = Arc::new(StaticKeySource::new(vec![hs256_published_key(
            "kid-a", b"secret-a",
        )]));
        let cache = KeyCache::new(source.clone(), None);
        cache.get_verification_keys().await.expect("keys");

        source.fail_next_fetches(true);
        let err = cache.refresh().await.expect_err("fetch should fail");
        assert!(matches!(err, AuthError::KeySourceUnavailable(_)));

        let err = cache
            .get_verification_keys()
            .await
            .expect_err("no stale fallback");
        assert!(matches!(err, AuthError::KeySourceUnavailable(_)));
    }

    #[tokio::test]
    async fn unusable_keys_are_dropped_from_the_set() {
        let source = Arc::new(StaticKeySource::new(vec![
            hs256_published_key("kid-a", b"secret-a"),
            PublishedKey {
                kid: "kid-rsa".to_owned(),
                kty: "RSA".to_owned(),
                alg: Some("RS256".to_owned()),
                crv: None,
                x: None,
                k: None,
            },
            ed25519_published_key("kid-ed", [9_u8; 32]),
        ]));
        let cache = KeyCache::new(source, None);
        let keys = cache.get_verification_keys().await.expect("keys");
        assert_eq!(keys.len(), 2);
        assert!(!keys.contains_key("kid-rsa"));
        assert_eq!(keys["kid-ed"].key.algorithm(), "EdDSA");
    }

    #[test]
    fn rejects_algorithm_mismatch_in_published_key() {
        let mut published = hs256_published_key("kid-a", b"secret");
        published.alg = Some("HS512".to_owned());
        assert!(derive_verification_key(&published).is_err());
    }

    #[tokio::test]
    async fn file_key_source_reads_jwks_document() {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "staffing-rt-jwks-{}.json",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let doc = serde_json::json!({ "keys": [hs256_published_key("kid-file", b"file-secret")] });
        tokio::fs::write(&path, doc.to_string()).await.expect("write");

        let auth = AuthConfig {
            jwks_url: url::Url::from_file_path(&path).expect("file url").to_string(),
            ..AuthConfig::default()
        };
        let source = key_source_from_config(&auth).expect("source");
        let keys = source.fetch_published_keys().await.expect("fetch");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid, "kid-file");
        let _ = tokio::fs::remove_file(path).await;
    }
}
