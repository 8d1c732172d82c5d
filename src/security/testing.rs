//! Fixtures shared by the security, dispatch and server tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use hmac::Mac;
use serde_json::{json, Value};

use super::key_cache::{KeySource, PublishedKey};

type HmacSha256 = hmac::Hmac<sha2::Sha256>;

pub struct StaticKeySource {
    keys: Mutex<Vec<PublishedKey>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl StaticKeySource {
    pub fn new(keys: Vec<PublishedKey>) -> Self {
        Self {
            keys: Mutex::new(keys),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn replace(&self, keys: Vec<PublishedKey>) {
        *self.keys.lock().expect("key fixture lock") = keys;
    }

    pub fn fail_next_fetches(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch_published_keys(&self) -> Result<Vec<PublishedKey>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("key endpoint unreachable"));
        }
        Ok(self.keys.lock().expect("key fixture lock").clone())
    }
}

pub fn hs256_published_key(kid: &str, secret: &[u8]) -> PublishedKey {
    PublishedKey {
        kid: kid.to_owned(),
        kty: "oct".to_owned(),
        alg: Some("HS256".to_owned()),
        crv: None,
        x: None,
        k: Some(URL_SAFE_NO_PAD.encode(secret)),
    }
}

pub fn ed25519_published_key(kid: &str, seed: [u8; 32]) -> PublishedKey {
    let verifying = SigningKey::from_bytes(&seed).verifying_key();
    PublishedKey {
        kid: kid.to_owned(),
        kty: "OKP".to_owned(),
        alg: Some("EdDSA".to_owned()),
        crv: Some("Ed25519".to_owned()),
        x: Some(URL_SAFE_NO_PAD.encode(verifying.as_bytes())),
        k: None,
    }
}

pub fn claims_for(subject: &str, role: &str) -> Value {
    json!({ "sub": subject, "role": role })
}

fn signing_input(header: &Value, claims: &Value) -> String {
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

pub fn sign_hs256(kid: &str, secret: &[u8], claims: &Value) -> String {
    let input = signing_input(&json!({ "alg": "HS256", "typ": "JWT", "kid": kid }), claims);
    let mut mac = HmacSha256::new_from_slice(secret).expect("mac");
    mac.update(input.as_bytes());
    let signature = mac.finalize().into_bytes();
    format!("{input}.{}", URL_SAFE_NO_PAD.encode(signature))
}

pub fn sign_ed25519(kid: &str, seed: [u8; 32], claims: &Value) -> String {
    let input = signing_input(&json!({ "alg": "EdDSA", "typ": "JWT", "kid": kid }), claims);
    let signature = SigningKey::from_bytes(&seed).sign(input.as_bytes());
    format!("{input}.{}", URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}

pub fn unsigned_with_header(header: &Value, claims: &Value) -> String {
    format!("{}.c2ln", signing_input(header, claims))
}
