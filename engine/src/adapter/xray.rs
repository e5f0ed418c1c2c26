use super::process::{ProcessInstance, write_document};
use super::{
    EngineAdapter, EngineDocument, EngineInstance, EngineKind, EngineUser, RelayBinding,
    ServerTls, StatsSample, StatsSource, relay_tag, split_host_port,
};
use crate::error::{EngineError, Result};
use crate::relay::{DispatchRelay, generate_token};
use crate::settings::{EngineSettings, LimiterSettings};
use async_trait::async_trait;
use common::Traffic;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;

const DEFAULT_REALITY_DEST: &str = "www.microsoft.com";

/// Xray driven as a child process, statistics from its gRPC stats service
/// through the `xray api` command.
pub struct XrayAdapter {
    settings: EngineSettings,
    default_identity: String,
}

impl XrayAdapter {
    pub fn new(settings: EngineSettings, limits: &LimiterSettings) -> Self {
        Self {
            settings,
            default_identity: limits.default_identity.clone(),
        }
    }

    fn proxy_inbound(
        &self,
        server: &Map<String, Value>,
        users: &[EngineUser],
        tls: Option<&ServerTls>,
    ) -> Value {
        let port = server
            .get("listen_port")
            .and_then(Value::as_u64)
            .unwrap_or(443);
        let clients: Vec<Value> = users
            .iter()
            .map(|user| {
                let mut client = Map::new();
                client.insert("id".to_string(), json!(user.secret().unwrap_or_default()));
                if let Some(flow) = &user.flow {
                    client.insert("flow".to_string(), json!(flow));
                }
                client.insert("email".to_string(), json!(user.name));
                Value::Object(client)
            })
            .collect();

        let mut stream = Map::new();
        match server.get("transport").and_then(Value::as_object) {
            Some(transport) => {
                let network = transport
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("tcp");
                stream.insert("network".to_string(), json!(network));
                if network == "xhttp" {
                    let path = transport
                        .get("path")
                        .and_then(Value::as_str)
                        .unwrap_or("/xhttp");
                    stream.insert("xhttpSettings".to_string(), json!({"path": path}));
                }
            }
            None => {
                stream.insert("network".to_string(), json!("tcp"));
            }
        }

        let server_tls = server.get("tls").and_then(Value::as_object);
        let reality = server_tls
            .and_then(|t| t.get("reality"))
            .and_then(Value::as_object)
            .filter(|r| r.get("enabled").and_then(Value::as_bool).unwrap_or(true));
        if let Some(reality) = reality {
            stream.insert("security".to_string(), json!("reality"));
            stream.insert(
                "realitySettings".to_string(),
                reality_settings(server_tls, reality),
            );
        } else if let Some(tls) = tls {
            stream.insert("security".to_string(), json!("tls"));
            stream.insert(
                "tlsSettings".to_string(),
                json!({
                    "serverName": tls.server_name,
                    "certificates": [{"certificate": tls.certificate, "key": tls.key}]
                }),
            );
        } else {
            stream.insert("security".to_string(), json!("none"));
        }

        json!({
            "tag": "proxy",
            "listen": "0.0.0.0",
            "port": port,
            "protocol": "vless",
            "settings": {"clients": clients, "decryption": "none"},
            "streamSettings": stream,
        })
    }

    fn api_inbound(&self) -> Result<Value> {
        let (host, port) = split_host_port(&self.settings.xray_api_addr)?;
        Ok(json!({
            "tag": "api",
            "listen": host,
            "port": port,
            "protocol": "dokodemo-door",
            "settings": {"address": host},
        }))
    }

    fn relay_outbound(&self, identity: &str, binding: &RelayBinding) -> Result<Value> {
        let (host, port) = split_host_port(&binding.addr)?;
        Ok(json!({
            "tag": relay_tag(identity),
            "protocol": "socks",
            "settings": {
                "servers": [{
                    "address": host,
                    "port": port,
                    "users": [{"user": identity, "pass": binding.token}]
                }]
            }
        }))
    }
}

fn reality_settings(server_tls: Option<&Map<String, Value>>, reality: &Map<String, Value>) -> Value {
    let handshake = reality.get("handshake").and_then(Value::as_object);
    let dest = match handshake.and_then(|h| h.get("server")).and_then(Value::as_str) {
        Some(host) => {
            let port = handshake
                .and_then(|h| h.get("server_port"))
                .and_then(Value::as_u64)
                .unwrap_or(443);
            format!("{}:{}", host, port)
        }
        None => format!("{}:443", DEFAULT_REALITY_DEST),
    };
    let server_name = server_tls
        .and_then(|t| t.get("server_name"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_REALITY_DEST);
    let short_ids: Vec<Value> = match reality.get("short_id") {
        Some(Value::Array(ids)) => ids.clone(),
        Some(Value::String(id)) => vec![json!(id)],
        _ => vec![json!("")],
    };
    json!({
        "show": false,
        "dest": dest,
        "xver": 0,
        "serverNames": [server_name],
        "privateKey": reality.get("private_key").cloned().unwrap_or(Value::Null),
        "shortIds": short_ids,
    })
}

#[async_trait]
impl EngineAdapter for XrayAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Xray
    }

    fn build_config(
        &self,
        server: &Map<String, Value>,
        users: &[EngineUser],
        tls: Option<&ServerTls>,
    ) -> Result<EngineDocument> {
        let relay = self.settings.accounting_relay.then(|| RelayBinding {
            addr: self.settings.relay_addr.clone(),
            token: generate_token(),
        });

        let mut rules = vec![json!({"type": "field", "inboundTag": ["api"], "outboundTag": "api"})];
        // the first outbound is the default route
        let mut outbounds = Vec::new();
        if let Some(binding) = &relay {
            outbounds.push(self.relay_outbound(&self.default_identity, binding)?);
        }
        outbounds.push(json!({"tag": "direct", "protocol": "freedom"}));
        if let Some(binding) = &relay {
            // the relay speaks TCP CONNECT only
            rules.push(json!({"type": "field", "network": "udp", "outboundTag": "direct"}));
            for user in users {
                outbounds.push(self.relay_outbound(&user.name, binding)?);
                rules.push(json!({
                    "type": "field",
                    "network": "tcp",
                    "user": [user.name],
                    "outboundTag": relay_tag(&user.name),
                }));
            }
        }

        let body = json!({
            "log": {"loglevel": "info"},
            "api": {"tag": "api", "services": ["StatsService"]},
            "stats": {},
            "policy": {
                "levels": {"0": {"statsUserUplink": true, "statsUserDownlink": true}},
                "system": {"statsInboundUplink": true, "statsInboundDownlink": true}
            },
            "inbounds": [self.proxy_inbound(server, users, tls), self.api_inbound()?],
            "outbounds": outbounds,
            "routing": {"rules": rules},
        });
        Ok(EngineDocument {
            kind: EngineKind::Xray,
            body,
            relay,
        })
    }

    async fn launch(&self, document: &EngineDocument) -> Result<Box<dyn EngineInstance>> {
        let path = write_document(&self.settings.data_dir, document).await?;
        Ok(Box::new(ProcessInstance::new(
            EngineKind::Xray,
            self.settings.xray_binary.clone(),
            vec!["run".to_string(), "-c".to_string(), path.display().to_string()],
            self.settings.startup_grace(),
            Arc::new(XrayStats::new(
                self.settings.xray_binary.clone(),
                self.settings.xray_api_addr.clone(),
            )),
            document.relay.as_ref().map(DispatchRelay::new),
        )))
    }
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default)]
    stat: Vec<StatEntry>,
}

#[derive(Debug, Deserialize)]
struct StatEntry {
    name: String,
    #[serde(default)]
    value: Value,
}

impl StatEntry {
    fn value(&self) -> u64 {
        match &self.value {
            Value::Number(n) => n.as_u64().unwrap_or(0),
            Value::String(s) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

/// Parses `xray api statsquery` output.
///
/// The total is the proxy inbound's counters when present, otherwise the sum
/// of the per-user counters.
pub fn parse_stats_query(output: &[u8]) -> Result<StatsSample> {
    let query: StatsQuery = serde_json::from_slice(output)?;
    let mut users: HashMap<String, Traffic> = HashMap::new();
    let mut inbound: Option<Traffic> = None;

    for entry in &query.stat {
        let parts: Vec<&str> = entry.name.split(">>>").collect();
        let [scope, name, "traffic", direction] = parts.as_slice() else {
            continue;
        };
        let slot = match *scope {
            "user" => users.entry(name.to_string()).or_default(),
            "inbound" if *name == "proxy" => inbound.get_or_insert_with(Traffic::default),
            _ => continue,
        };
        match *direction {
            "uplink" => slot.up = slot.up.saturating_add(entry.value()),
            "downlink" => slot.down = slot.down.saturating_add(entry.value()),
            _ => {}
        }
    }

    let total = inbound.unwrap_or_else(|| {
        users
            .values()
            .fold(Traffic::default(), |sum, traffic| sum + *traffic)
    });
    Ok(StatsSample {
        total,
        connections: Vec::new(),
        user_counters: users,
    })
}

/// Queries the stats service with `xray api statsquery`.
pub struct XrayStats {
    binary: String,
    server: String,
}

impl XrayStats {
    pub fn new(binary: String, server: String) -> Self {
        Self { binary, server }
    }
}

#[async_trait]
impl StatsSource for XrayStats {
    async fn sample(&self) -> Result<StatsSample> {
        let output = Command::new(&self.binary)
            .arg("api")
            .arg("statsquery")
            .arg(format!("--server={}", self.server))
            .output()
            .await
            .map_err(|e| EngineError::Stats(format!("failed to run {}: {}", self.binary, e)))?;
        if !output.status.success() {
            return Err(EngineError::Stats(format!(
                "statsquery exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_stats_query(&output.stdout)
    }
}
