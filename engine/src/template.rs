use crate::adapter::{EngineKind, EngineUser, ServerTls};
use crate::error::{EngineError, Result};
use crate::settings::{EngineSettings, LimiterSettings};
use crate::store::{SettingsStore, UserRecord};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// A server template as stored by the panel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateDocument {
    #[serde(rename = "_name", default)]
    pub name: String,
    #[serde(rename = "_description", default)]
    pub description: String,
    #[serde(default)]
    pub core: Option<String>,
    #[serde(default)]
    pub server: Map<String, Value>,
    /// Per-user rate in bytes per second.
    #[serde(default)]
    pub user_limit: Option<u64>,
    /// Rate for traffic that matches no user.
    #[serde(default)]
    pub default_limit: Option<u64>,
}

impl TemplateDocument {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| malformed("template", e))
    }

    pub fn engine_kind(&self) -> EngineKind {
        match self.core.as_deref() {
            Some("xray") => EngineKind::Xray,
            _ => EngineKind::SingBox,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    None,
    Reality,
    Certificate,
}

/// TLS flavour of a server object (`tls.enabled`, `tls.reality.enabled`).
pub fn tls_mode(server: &Map<String, Value>) -> TlsMode {
    let Some(tls) = server.get("tls").and_then(Value::as_object) else {
        return TlsMode::None;
    };
    let enabled = |obj: &Map<String, Value>| obj.get("enabled").and_then(Value::as_bool) == Some(true);
    let reality = tls
        .get("reality")
        .and_then(Value::as_object)
        .is_some_and(enabled);
    if reality {
        TlsMode::Reality
    } else if enabled(tls) {
        TlsMode::Certificate
    } else {
        TlsMode::None
    }
}

/// Decodes a settings value that should hold a JSON object. Older rows store
/// the object serialised a second time as a JSON string.
pub fn decode_object(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).map_err(|e| malformed("settings value", e))? {
        Value::Object(map) => Ok(map),
        Value::String(inner) => match serde_json::from_str::<Value>(&inner)
            .map_err(|e| malformed("settings value", e))?
        {
            Value::Object(map) => Ok(map),
            other => Err(EngineError::Configuration(format!(
                "expected a JSON object, found {}",
                other
            ))),
        },
        other => Err(EngineError::Configuration(format!(
            "expected a JSON object, found {}",
            other
        ))),
    }
}

fn malformed(what: &str, e: serde_json::Error) -> EngineError {
    EngineError::Configuration(format!("malformed {}: {}", what, e))
}

/// Decodes a settings value holding text: a JSON string or the raw bytes.
pub fn decode_text(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(text)) => text,
        _ => raw.trim().to_string(),
    }
}

/// Everything `Refresh` derives from the stored settings.
#[derive(Debug, Clone)]
pub struct PreparedSettings {
    pub template: TemplateDocument,
    pub server: Map<String, Value>,
    pub users: Vec<EngineUser>,
    pub tls: Option<ServerTls>,
    /// Bytes per second keyed by identity.
    pub limits: HashMap<String, u64>,
    /// The only stored user, when there is exactly one.
    pub sole_user: Option<String>,
}

/// Reads settings, template and users and turns them into engine inputs.
///
/// `Ok(None)` means no template has been selected yet.
pub async fn prepare(
    store: &dyn SettingsStore,
    engine: &EngineSettings,
    limiter: &LimiterSettings,
) -> Result<Option<PreparedSettings>> {
    let Some(slug) = store
        .setting("template")
        .await?
        .map(|raw| decode_text(&raw))
        .filter(|slug| !slug.is_empty())
    else {
        debug!("No template selected, nothing to prepare");
        return Ok(None);
    };

    let raw_template = store
        .template(&slug)
        .await?
        .ok_or_else(|| EngineError::Configuration(format!("template '{}' not found", slug)))?;
    let template = TemplateDocument::parse(&raw_template)?;

    let server = match store.setting("server").await? {
        Some(raw) if !raw.trim().is_empty() => decode_object(&raw)?,
        _ => return Err(EngineError::Configuration("server settings missing".to_string())),
    };

    let stored = store.users().await?;
    let peers = store.peer_identities().await?;
    let users = engine_users(&template.server, &stored, &peers);
    let limits = rate_limits(&template, &stored, &peers, &limiter.default_identity);

    let tls = if tls_mode(&template.server) == TlsMode::Certificate {
        let server_name = server_name(store).await?;
        Some(load_tls(engine, server_name)?)
    } else {
        None
    };

    let sole_user = match stored.as_slice() {
        [only] => Some(only.username.clone()),
        _ => None,
    };

    info!(
        "Prepared template '{}' for {} with {} users and {} limits",
        slug,
        template.engine_kind(),
        users.len(),
        limits.len()
    );

    Ok(Some(PreparedSettings {
        template,
        server,
        users,
        tls,
        limits,
        sole_user,
    }))
}

/// Builds inbound credentials for stored users and federated peers.
pub fn engine_users(
    template_server: &Map<String, Value>,
    stored: &[UserRecord],
    peers: &[String],
) -> Vec<EngineUser> {
    let server_type = template_server
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let flow = template_server
        .get("flow")
        .and_then(Value::as_str)
        .filter(|flow| !flow.is_empty());

    let credentials = |name: &str, secret: &str, peer: bool| {
        let mut user = EngineUser {
            name: name.to_string(),
            ..Default::default()
        };
        match server_type {
            "vless" => {
                user.uuid = Some(secret.to_string());
                user.flow = flow.map(str::to_string);
            }
            "vmess" => {
                user.uuid = Some(secret.to_string());
                user.alter_id = Some(0);
            }
            "tuic" => {
                user.uuid = Some(secret.to_string());
                if !peer {
                    user.password = Some(secret.to_string());
                }
            }
            _ => user.password = Some(secret.to_string()),
        }
        user
    };

    stored
        .iter()
        .map(|u| credentials(&u.username, &u.uuid, false))
        .chain(peers.iter().map(|id| credentials(id, id, true)))
        .collect()
}

/// Per-identity rates: a user's own limit wins over the template's.
pub fn rate_limits(
    template: &TemplateDocument,
    stored: &[UserRecord],
    peers: &[String],
    default_identity: &str,
) -> HashMap<String, u64> {
    let template_limit = template.user_limit.filter(|l| *l > 0);
    let mut limits = HashMap::new();

    for user in stored {
        if let Some(limit) = user.speed_limit.filter(|l| *l > 0).or(template_limit) {
            limits.insert(user.username.clone(), limit);
            if !user.uuid.is_empty() {
                limits.insert(user.uuid.clone(), limit);
            }
        }
    }
    if let Some(limit) = template_limit {
        for peer in peers {
            limits.entry(peer.clone()).or_insert(limit);
        }
    }
    if let Some(limit) = template.default_limit.filter(|l| *l > 0) {
        limits.insert(default_identity.to_string(), limit);
    }
    limits
}

async fn server_name(store: &dyn SettingsStore) -> Result<String> {
    for key in ["letsencrypt_domain", "ip"] {
        if let Some(name) = store
            .setting(key)
            .await?
            .map(|raw| decode_text(&raw))
            .filter(|name| !name.is_empty())
        {
            return Ok(name);
        }
    }
    Err(EngineError::Configuration(
        "neither letsencrypt_domain nor ip is set".to_string(),
    ))
}

fn load_tls(engine: &EngineSettings, server_name: String) -> Result<ServerTls> {
    let read_lines = |path: &str, what: &str| -> Result<Vec<String>> {
        if !Path::new(path).exists() {
            return Err(EngineError::Configuration(format!("{} not found at {}", what, path)));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(content.split('\n').map(str::to_string).collect())
    };

    Ok(ServerTls {
        server_name,
        certificate: read_lines(&engine.certificate_path, "certificate")?,
        key: read_lines(&engine.private_key_path, "private key")?,
    })
}
