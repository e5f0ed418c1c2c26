use super::process::{ProcessInstance, write_document};
use super::{
    ConnectionEntry, EngineAdapter, EngineDocument, EngineInstance, EngineKind, EngineUser,
    RelayBinding, ServerTls, StatsSample, StatsSource, relay_tag, split_host_port,
};
use crate::error::{EngineError, Result};
use crate::relay::{DispatchRelay, generate_token};
use crate::settings::{EngineSettings, LimiterSettings};
use async_trait::async_trait;
use bytes::Bytes;
use common::Traffic;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// sing-box driven as a child process, statistics from its Clash API.
pub struct SingBoxAdapter {
    settings: EngineSettings,
    default_identity: String,
}

impl SingBoxAdapter {
    pub fn new(settings: EngineSettings, limits: &LimiterSettings) -> Self {
        Self {
            settings,
            default_identity: limits.default_identity.clone(),
        }
    }

    fn inbound(
        &self,
        server: &Map<String, Value>,
        users: &[EngineUser],
        tls: Option<&ServerTls>,
    ) -> Result<Map<String, Value>> {
        let mut inbound = server.clone();
        inbound.remove("flow");
        inbound.entry("tag").or_insert_with(|| json!("proxy-in"));

        if let Some(reality) = inbound
            .get_mut("tls")
            .and_then(|tls| tls.get_mut("reality"))
            .and_then(Value::as_object_mut)
        {
            if let Some(key) = reality.get("private_key").and_then(Value::as_str) {
                let trimmed = key.trim_end_matches('=').to_string();
                reality.insert("private_key".to_string(), json!(trimmed));
            }
            reality.remove("public_key");
        }

        inbound.insert("users".to_string(), serde_json::to_value(users)?);

        if let Some(tls) = tls {
            if let Some(block) = inbound.get_mut("tls").and_then(Value::as_object_mut) {
                block.insert("enabled".to_string(), json!(true));
                block.insert("server_name".to_string(), json!(tls.server_name));
                block.insert("certificate".to_string(), json!(tls.certificate));
                block.insert("key".to_string(), json!(tls.key));
            }
        }
        Ok(inbound)
    }

    fn relay_outbounds(
        &self,
        users: &[EngineUser],
        binding: &RelayBinding,
    ) -> Result<(Vec<Value>, Vec<Value>)> {
        let (host, port) = split_host_port(&binding.addr)?;
        let outbound = |identity: &str| {
            json!({
                "type": "socks",
                "tag": relay_tag(identity),
                "server": host,
                "server_port": port,
                "version": "5",
                "username": identity,
                "password": binding.token,
            })
        };

        let mut outbounds: Vec<Value> = users.iter().map(|u| outbound(&u.name)).collect();
        outbounds.push(outbound(&self.default_identity));
        // The relay speaks TCP CONNECT only, UDP goes out directly.
        let rules = std::iter::once(json!({"network": ["udp"], "outbound": "direct"}))
            .chain(users.iter().map(|u| {
                json!({"network": ["tcp"], "auth_user": [u.name], "outbound": relay_tag(&u.name)})
            }))
            .collect();
        Ok((outbounds, rules))
    }
}

#[async_trait]
impl EngineAdapter for SingBoxAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::SingBox
    }

    fn build_config(
        &self,
        server: &Map<String, Value>,
        users: &[EngineUser],
        tls: Option<&ServerTls>,
    ) -> Result<EngineDocument> {
        let inbound = self.inbound(server, users, tls)?;
        let mut outbounds = vec![json!({"type": "direct", "tag": "direct"})];

        let relay = self.settings.accounting_relay.then(|| RelayBinding {
            addr: self.settings.relay_addr.clone(),
            token: generate_token(),
        });
        let route = match &relay {
            Some(binding) => {
                let (relay_outbounds, rules) = self.relay_outbounds(users, binding)?;
                outbounds.extend(relay_outbounds);
                json!({"rules": rules, "final": relay_tag(&self.default_identity)})
            }
            None => json!({"final": "direct"}),
        };

        let body = json!({
            "log": {"level": "info"},
            "inbounds": [inbound],
            "outbounds": outbounds,
            "route": route,
            "experimental": {
                "clash_api": {"external_controller": self.settings.clash_api_addr}
            }
        });
        Ok(EngineDocument {
            kind: EngineKind::SingBox,
            body,
            relay,
        })
    }

    async fn launch(&self, document: &EngineDocument) -> Result<Box<dyn EngineInstance>> {
        let path = write_document(&self.settings.data_dir, document).await?;
        Ok(Box::new(ProcessInstance::new(
            EngineKind::SingBox,
            self.settings.singbox_binary.clone(),
            vec!["run".to_string(), "-c".to_string(), path.display().to_string()],
            self.settings.startup_grace(),
            Arc::new(ClashStats::new(self.settings.clash_api_addr.clone())),
            document.relay.as_ref().map(DispatchRelay::new),
        )))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClashSnapshot {
    #[serde(default)]
    upload_total: u64,
    #[serde(default)]
    download_total: u64,
    #[serde(default)]
    connections: Option<Vec<ConnectionEntry>>,
}

/// Reads `/connections` from the Clash API.
pub struct ClashStats {
    addr: String,
}

impl ClashStats {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }

    async fn fetch(&self) -> Result<Bytes> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| EngineError::Stats(format!("connect {}: {}", self.addr, e)))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| EngineError::Stats(format!("handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Clash API connection error: {}", e);
            }
        });

        let req = Request::builder()
            .uri("/connections")
            .header(hyper::header::HOST, self.addr.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(|e| EngineError::Stats(e.to_string()))?;
        let res = sender
            .send_request(req)
            .await
            .map_err(|e| EngineError::Stats(format!("request failed: {}", e)))?;
        if !res.status().is_success() {
            return Err(EngineError::Stats(format!("Clash API returned {}", res.status())));
        }
        let body = res
            .collect()
            .await
            .map_err(|e| EngineError::Stats(format!("reading body failed: {}", e)))?;
        Ok(body.to_bytes())
    }
}

pub fn parse_snapshot(body: &[u8]) -> Result<StatsSample> {
    let snapshot: ClashSnapshot = serde_json::from_slice(body)?;
    Ok(StatsSample {
        total: Traffic::new(snapshot.upload_total, snapshot.download_total),
        connections: snapshot.connections.unwrap_or_default(),
        ..Default::default()
    })
}

#[async_trait]
impl StatsSource for ClashStats {
    async fn sample(&self) -> Result<StatsSample> {
        let body = self.fetch().await?;
        parse_snapshot(&body)
    }
}
