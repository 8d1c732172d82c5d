use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::security::predicates::Predicate;

pub const ROLE_ADMINISTRATOR: &str = "Administrator";
pub const ROLE_CONTROL_ROOM_OPERATOR: &str = "Control Room Operator";
pub const ROLE_STEWARD: &str = "Steward";

pub const CHANNEL_ASSISTANCE_REQUESTS: &str = "assistance-requests";
pub const CHANNEL_VENUE_STATUS: &str = "venue-status";
pub const CHANNEL_STAFF_UPDATES: &str = "staff-updates";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub roster: RosterConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default = "default_actions")]
    pub actions: Vec<ActionBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    #[serde(default)]
    pub http_bind: Option<String>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            http_bind: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwks_url")]
    pub jwks_url: String,
    #[serde(default = "default_key_fetch_timeout_ms")]
    pub key_fetch_timeout_ms: u64,
    /// Zero keeps the fetched key set for the lifetime of the process.
    #[serde(default)]
    pub key_cache_ttl_secs: u64,
    #[serde(default = "default_subject_claim")]
    pub subject_claim: String,
    #[serde(default = "default_role_claim")]
    pub role_claim: String,
    #[serde(default)]
    pub enforce_expiry: bool,
    #[serde(default = "default_connect_roles")]
    pub connect_roles: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwks_url: default_jwks_url(),
            key_fetch_timeout_ms: default_key_fetch_timeout_ms(),
            key_cache_ttl_secs: 0,
            subject_claim: default_subject_claim(),
            role_claim: default_role_claim(),
            enforce_expiry: false,
            connect_roles: default_connect_roles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    #[serde(default = "default_roster_dir")]
    pub dir: PathBuf,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            dir: default_roster_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Local,
    Callback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_transport_mode")]
    pub transport: TransportMode,
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: default_delivery_timeout_ms(),
            transport: default_transport_mode(),
            callback_url: None,
        }
    }
}

/// Binds one administrative action to the predicate that gates it and the
/// channel its change notification fans out on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBinding {
    pub name: String,
    pub channel: String,
    /// Path parameter whose value scopes the broadcast to one subject.
    #[serde(default)]
    pub subject_param: Option<String>,
    pub predicate: Predicate,
    /// Extra path parameters the action needs beyond those its predicate reads.
    #[serde(default)]
    pub required_params: Vec<String>,
}

impl ActionBinding {
    pub fn all_required_params(&self) -> Vec<String> {
        let mut params = self.predicate.required_params();
        for extra in self
            .required_params
            .iter()
            .chain(self.subject_param.iter())
        {
            if !params.iter().any(|existing| existing == extra) {
                params.push(extra.clone());
            }
        }
        params
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            registry: RegistryConfig::default(),
            roster: RosterConfig::default(),
            dispatch: DispatchConfig::default(),
            actions: default_actions(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, bind: Option<&str>, http_bind: Option<&str>) {
        if let Some(bind) = bind {
            self.server.bind = bind.to_owned();
        }
        if let Some(http_bind) = http_bind {
            self.server.http_bind = normalize_optional(http_bind);
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("STAFFING_RT_SERVER_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_HTTP_BIND") {
            self.server.http_bind = normalize_optional(&v);
        }
        if let Ok(v) = env::var("STAFFING_RT_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.server.handshake_timeout_ms = n.max(500);
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_OUTBOUND_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.server.outbound_queue_capacity = n.max(8);
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_JWKS_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.auth.jwks_url = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_KEY_FETCH_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.auth.key_fetch_timeout_ms = n.max(100);
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_KEY_CACHE_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.auth.key_cache_ttl_secs = n;
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_SUBJECT_CLAIM") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.auth.subject_claim = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_ROLE_CLAIM") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.auth.role_claim = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_ENFORCE_EXPIRY") {
            self.auth.enforce_expiry = parse_bool(&v);
        }
        if let Ok(v) = env::var("STAFFING_RT_CONNECT_ROLES") {
            self.auth.connect_roles = split_csv(&v);
        }
        if let Ok(v) = env::var("STAFFING_RT_REGISTRY_PATH") {
            self.registry.path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("STAFFING_RT_ROSTER_DIR") {
            self.roster.dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("STAFFING_RT_DELIVERY_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.dispatch.delivery_timeout_ms = n.max(100);
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_TRANSPORT") {
            if let Some(mode) = parse_transport_mode(&v) {
                self.dispatch.transport = mode;
            }
        }
        if let Ok(v) = env::var("STAFFING_RT_CALLBACK_URL") {
            self.dispatch.callback_url = normalize_optional(&v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if self
            .server
            .http_bind
            .as_deref()
            .is_some_and(|bind| bind.trim().is_empty())
        {
            anyhow::bail!("server.http_bind must not be empty when provided");
        }
        if self.server.handshake_timeout_ms == 0 {
            anyhow::bail!("server.handshake_timeout_ms must be > 0");
        }
        if self.server.outbound_queue_capacity == 0 {
            anyhow::bail!("server.outbound_queue_capacity must be > 0");
        }
        validate_url_scheme("auth.jwks_url", &self.auth.jwks_url, &["http", "https", "file"])?;
        if self.auth.key_fetch_timeout_ms == 0 {
            anyhow::bail!("auth.key_fetch_timeout_ms must be > 0");
        }
        if self.auth.subject_claim.trim().is_empty() {
            anyhow::bail!("auth.subject_claim must not be empty");
        }
        if self.auth.role_claim.trim().is_empty() {
            anyhow::bail!("auth.role_claim must not be empty");
        }
        if self.auth.connect_roles.is_empty() {
            anyhow::bail!("auth.connect_roles must list at least one role");
        }
        if self.registry.path.as_os_str().is_empty() {
            anyhow::bail!("registry.path must not be empty");
        }
        if self.dispatch.delivery_timeout_ms == 0 {
            anyhow::bail!("dispatch.delivery_timeout_ms must be > 0");
        }
        if self.dispatch.transport == TransportMode::Callback {
            let callback_url = self
                .dispatch
                .callback_url
                .as_deref()
                .map(str::trim)
                .unwrap_or_default();
            if callback_url.is_empty() {
                anyhow::bail!(
                    "dispatch.transport=callback requires dispatch.callback_url or STAFFING_RT_CALLBACK_URL"
                );
            }
            validate_url_scheme("dispatch.callback_url", callback_url, &["http", "https"])?;
        }

        let mut seen = Vec::with_capacity(self.actions.len());
        for binding in &self.actions {
            let name = binding.name.trim();
            if name.is_empty() {
                anyhow::bail!("actions[].name must not be empty");
            }
            if seen.contains(&name) {
                anyhow::bail!("action `{name}` is declared more than once");
            }
            seen.push(name);
            if binding.channel.trim().is_empty() {
                anyhow::bail!("action `{name}` must name a broadcast channel");
            }
            binding
                .predicate
                .validate()
                .with_context(|| format!("action `{name}` has an invalid predicate"))?;
            if binding
                .subject_param
                .as_deref()
                .is_some_and(|param| param.trim().is_empty())
            {
                anyhow::bail!("action `{name}` subject_param must not be empty when provided");
            }
        }
        Ok(())
    }
}

fn validate_url_scheme(field: &str, raw: &str, allowed: &[&str]) -> Result<()> {
    let parsed = Url::parse(raw.trim()).with_context(|| format!("{field} is not a valid URL"))?;
    if !allowed.contains(&parsed.scheme()) {
        anyhow::bail!(
            "{field} must use one of {} (got `{}`)",
            allowed.join(", "),
            parsed.scheme()
        );
    }
    Ok(())
}

fn normalize_optional(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_transport_mode(s: &str) -> Option<TransportMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "local" | "websocket" | "ws" => Some(TransportMode::Local),
        "callback" | "http" => Some(TransportMode::Callback),
        _ => None,
    }
}

fn default_actions() -> Vec<ActionBinding> {
    let control_room = vec![
        ROLE_ADMINISTRATOR.to_owned(),
        ROLE_CONTROL_ROOM_OPERATOR.to_owned(),
    ];
    vec![
        ActionBinding {
            name: "assistance-request.raise".to_owned(),
            channel: CHANNEL_ASSISTANCE_REQUESTS.to_owned(),
            subject_param: Some("eventId".to_owned()),
            predicate: Predicate::SamePositionAssignment {
                event_param: "eventId".to_owned(),
                position_param: "positionId".to_owned(),
            },
            required_params: Vec::new(),
        },
        ActionBinding {
            name: "assistance-request.handle".to_owned(),
            channel: CHANNEL_ASSISTANCE_REQUESTS.to_owned(),
            subject_param: Some("eventId".to_owned()),
            predicate: Predicate::RoleIn {
                roles: control_room.clone(),
            },
            required_params: vec!["requestId".to_owned()],
        },
        ActionBinding {
            name: "venue-status.update".to_owned(),
            channel: CHANNEL_VENUE_STATUS.to_owned(),
            subject_param: Some("eventId".to_owned()),
            predicate: Predicate::RoleIn {
                roles: control_room,
            },
            required_params: vec!["venueId".to_owned()],
        },
        ActionBinding {
            name: "staff.availability.update".to_owned(),
            channel: CHANNEL_STAFF_UPDATES.to_owned(),
            subject_param: None,
            predicate: Predicate::SameSubject {
                param: "username".to_owned(),
            },
            required_params: Vec::new(),
        },
    ]
}

fn default_server_bind() -> String {
    "127.0.0.1:18790".to_owned()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_jwks_url() -> String {
    "http://127.0.0.1:18792/.well-known/jwks.json".to_owned()
}

fn default_key_fetch_timeout_ms() -> u64 {
    3_000
}

fn default_subject_claim() -> String {
    "sub".to_owned()
}

fn default_role_claim() -> String {
    "role".to_owned()
}

fn default_connect_roles() -> Vec<String> {
    vec![
        ROLE_ADMINISTRATOR.to_owned(),
        ROLE_CONTROL_ROOM_OPERATOR.to_owned(),
        ROLE_STEWARD.to_owned(),
    ]
}

fn default_registry_path() -> PathBuf {
    PathBuf::from(".staffing-rt/connections.json")
}

fn default_roster_dir() -> PathBuf {
    PathBuf::from(".staffing-rt/rosters")
}

fn default_delivery_timeout_ms() -> u64 {
    3_000
}

fn default_transport_mode() -> TransportMode {
    TransportMode::Local
}
