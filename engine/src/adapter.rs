pub mod process;
pub mod singbox;
pub mod xray;

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use common::Traffic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub use singbox::SingBoxAdapter;
pub use xray::XrayAdapter;

/// Any bidirectional byte stream an engine hands over for one connection.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    SingBox,
    Xray,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::SingBox => "singbox",
            EngineKind::Xray => "xray",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials of one user as an inbound expects them.
///
/// Which fields are set depends on the inbound protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineUser {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,
}

impl EngineUser {
    /// The single secret an engine that only knows one credential field uses.
    pub fn secret(&self) -> Option<&str> {
        self.uuid.as_deref().or(self.password.as_deref())
    }
}

/// Certificate material for non-REALITY TLS inbounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTls {
    pub server_name: String,
    pub certificate: Vec<String>,
    pub key: Vec<String>,
}

/// Where the engine sends per-user traffic for accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayBinding {
    pub addr: String,
    pub token: String,
}

/// An engine-native configuration ready to be launched.
#[derive(Debug, Clone)]
pub struct EngineDocument {
    pub kind: EngineKind,
    pub body: Value,
    pub relay: Option<RelayBinding>,
}

/// One open connection as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    pub id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
}

impl ConnectionEntry {
    pub fn traffic(&self) -> Traffic {
        Traffic::new(self.upload, self.download)
    }

    /// The owning user, if the engine attached one.
    pub fn identity(&self) -> Option<&str> {
        ["inboundUser", "user", "username", "name"]
            .iter()
            .filter_map(|key| self.metadata.get(*key).and_then(Value::as_str))
            .find(|value| !value.is_empty())
    }
}

/// Normalised counters read from an engine in one poll.
///
/// All values are cumulative since the engine started.
#[derive(Debug, Clone, Default)]
pub struct StatsSample {
    pub total: Traffic,
    pub connections: Vec<ConnectionEntry>,
    /// Per-user counters keyed by identity, for engines that keep them.
    pub user_counters: HashMap<String, Traffic>,
}

#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn sample(&self) -> Result<StatsSample>;
}

/// Decorates the engine side of a connection before bytes flow through it.
pub trait ConnectionInterceptor: Send + Sync {
    fn intercept(&self, identity: &str, stream: BoxedStream) -> BoxedStream;
}

/// Extension point an instance exposes on its connection-dispatch path.
pub trait DispatchHook: Send + Sync {
    fn install(&self, interceptor: Arc<dyn ConnectionInterceptor>);
}

/// One launched engine. Created stopped, serving after `start`.
#[async_trait]
pub trait EngineInstance: Send + Sync {
    fn kind(&self) -> EngineKind;

    async fn start(&mut self, cancel: CancellationToken) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    fn stats_source(&self) -> Arc<dyn StatsSource>;

    fn dispatch_hook(&self) -> Option<Arc<dyn DispatchHook>> {
        None
    }
}

/// Everything engine specific: configuration schema, process handling,
/// statistics API and hook installation.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn build_config(
        &self,
        server: &Map<String, Value>,
        users: &[EngineUser],
        tls: Option<&ServerTls>,
    ) -> Result<EngineDocument>;

    async fn launch(&self, document: &EngineDocument) -> Result<Box<dyn EngineInstance>>;

    fn install_accounting(
        &self,
        instance: &dyn EngineInstance,
        interceptor: Arc<dyn ConnectionInterceptor>,
    ) -> Result<()> {
        match instance.dispatch_hook() {
            Some(hook) => {
                hook.install(interceptor);
                Ok(())
            }
            None => Err(EngineError::Hook(format!(
                "{} instance exposes no dispatch hook",
                instance.kind()
            ))),
        }
    }

    async fn shutdown(&self, mut instance: Box<dyn EngineInstance>) -> Result<()> {
        instance.close().await
    }
}

/// Splits `host:port` for config fields that want them apart.
pub(crate) fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| EngineError::Configuration(format!("address '{}' has no port", addr)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| EngineError::Configuration(format!("invalid port in '{}': {}", addr, e)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Outbound tag used for a user's relay route.
pub(crate) fn relay_tag(identity: &str) -> String {
    format!("relay-{}", identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_prefers_inbound_user() {
        let entry: ConnectionEntry = serde_json::from_value(json!({
            "id": "c1",
            "metadata": {"inboundUser": "alice", "user": "bob"},
            "upload": 10,
            "download": 20
        }))
        .unwrap();
        assert_eq!(entry.identity(), Some("alice"));
        assert_eq!(entry.traffic(), Traffic::new(10, 20));
    }

    #[test]
    fn empty_metadata_values_are_skipped() {
        let entry: ConnectionEntry = serde_json::from_value(json!({
            "id": "c1",
            "metadata": {"inboundUser": "", "name": "carol"}
        }))
        .unwrap();
        assert_eq!(entry.identity(), Some("carol"));

        let anonymous = ConnectionEntry {
            id: "c2".to_string(),
            ..Default::default()
        };
        assert_eq!(anonymous.identity(), None);
    }

    #[test]
    fn split_host_port_handles_ipv6() {
        assert_eq!(
            split_host_port("127.0.0.1:9090").unwrap(),
            ("127.0.0.1".to_string(), 9090)
        );
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(split_host_port("localhost").is_err());
    }
}
