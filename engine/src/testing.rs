//! In-memory collaborators for unit tests.

use crate::adapter::{
    BoxedStream, ConnectionInterceptor, DispatchHook, EngineAdapter, EngineDocument, EngineInstance,
    EngineKind, EngineUser, ServerTls, StatsSample, StatsSource,
};
use crate::error::{EngineError, Result};
use crate::store::{SettingsStore, UserRecord};
use async_trait::async_trait;
use common::Traffic;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MemoryStore {
    settings: Mutex<HashMap<String, String>>,
    templates: Mutex<HashMap<String, String>>,
    users: Mutex<Vec<UserRecord>>,
    peers: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn set_setting(&self, key: &str, value: &str) {
        self.settings.lock().insert(key.to_string(), value.to_string());
    }

    pub fn set_template(&self, slug: &str, content: &str) {
        self.templates.lock().insert(slug.to_string(), content.to_string());
    }

    pub fn add_user(&self, user: UserRecord) {
        self.users.lock().push(user);
    }

    pub fn set_peers(&self, peers: &[&str]) {
        *self.peers.lock() = peers.iter().map(|p| p.to_string()).collect();
    }

    pub fn fail_identity(&self, identity: &str) {
        self.failing.lock().insert(identity.to_string());
    }

    pub fn heal_identity(&self, identity: &str) {
        self.failing.lock().remove(identity);
    }

    pub fn traffic_of(&self, username: &str) -> Option<Traffic> {
        self.users
            .lock()
            .iter()
            .find(|u| u.username == username)
            .map(|u| Traffic::new(u.upload as u64, u.download as u64))
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.settings.lock().get(key).cloned())
    }

    async fn template(&self, slug: &str) -> Result<Option<String>> {
        Ok(self.templates.lock().get(slug).cloned())
    }

    async fn users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.users.lock().clone())
    }

    async fn peer_identities(&self) -> Result<Vec<String>> {
        Ok(self.peers.lock().clone())
    }

    async fn add_traffic(&self, identity: &str, traffic: Traffic) -> Result<bool> {
        if self.failing.lock().contains(identity) {
            return Err(EngineError::Store(format!("write for {} failed", identity)));
        }
        let mut users = self.users.lock();
        match users
            .iter_mut()
            .find(|u| u.uuid == identity || u.username == identity)
        {
            Some(user) => {
                user.upload += traffic.up as i64;
                user.download += traffic.down as i64;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct FakeStats {
    sample: Mutex<StatsSample>,
}

impl FakeStats {
    pub fn set(&self, sample: StatsSample) {
        *self.sample.lock() = sample;
    }
}

#[async_trait]
impl StatsSource for FakeStats {
    async fn sample(&self) -> Result<StatsSample> {
        Ok(self.sample.lock().clone())
    }
}

/// Dispatch path of the fake engine: hands out in-memory connections.
#[derive(Default)]
pub struct FakeHook {
    interceptor: RwLock<Option<Arc<dyn ConnectionInterceptor>>>,
}

impl FakeHook {
    /// Opens a connection for `identity`; returns the client end and the
    /// engine end as the interceptor decorated it.
    pub fn connect(&self, identity: &str) -> (DuplexStream, BoxedStream) {
        let (client, engine_side) = tokio::io::duplex(64 * 1024);
        let engine_side: BoxedStream = Box::new(engine_side);
        let engine_side = match self.interceptor.read().as_ref() {
            Some(interceptor) => interceptor.intercept(identity, engine_side),
            None => engine_side,
        };
        (client, engine_side)
    }

    pub fn is_installed(&self) -> bool {
        self.interceptor.read().is_some()
    }
}

impl DispatchHook for FakeHook {
    fn install(&self, interceptor: Arc<dyn ConnectionInterceptor>) {
        *self.interceptor.write() = Some(interceptor);
    }
}

/// Shared knobs and observations of the fake engine.
#[derive(Default)]
pub struct FakeEngine {
    pub live: AtomicUsize,
    pub launches: AtomicUsize,
    pub fail_launch: AtomicBool,
    pub fail_start: AtomicBool,
    pub without_hook: AtomicBool,
    pub stats: Arc<FakeStats>,
    pub last_hook: Mutex<Option<Arc<FakeHook>>>,
    pub last_document: Mutex<Option<Value>>,
}

pub struct FakeAdapter {
    kind: EngineKind,
    pub engine: Arc<FakeEngine>,
}

impl FakeAdapter {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            engine: Arc::new(FakeEngine::default()),
        }
    }
}

#[async_trait]
impl EngineAdapter for FakeAdapter {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn build_config(
        &self,
        server: &Map<String, Value>,
        users: &[EngineUser],
        _tls: Option<&ServerTls>,
    ) -> Result<EngineDocument> {
        Ok(EngineDocument {
            kind: self.kind,
            body: json!({"server": server, "users": users}),
            relay: None,
        })
    }

    async fn launch(&self, document: &EngineDocument) -> Result<Box<dyn EngineInstance>> {
        if self.engine.fail_launch.load(Ordering::SeqCst) {
            return Err(EngineError::Launch("fake launch failure".to_string()));
        }
        self.engine.launches.fetch_add(1, Ordering::SeqCst);
        *self.engine.last_document.lock() = Some(document.body.clone());
        let hook = if self.engine.without_hook.load(Ordering::SeqCst) {
            None
        } else {
            let hook = Arc::new(FakeHook::default());
            *self.engine.last_hook.lock() = Some(hook.clone());
            Some(hook)
        };
        self.engine.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInstance {
            kind: self.kind,
            engine: self.engine.clone(),
            hook,
            closed: false,
        }))
    }
}

pub struct FakeInstance {
    kind: EngineKind,
    engine: Arc<FakeEngine>,
    hook: Option<Arc<FakeHook>>,
    closed: bool,
}

#[async_trait]
impl EngineInstance for FakeInstance {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn start(&mut self, _cancel: CancellationToken) -> Result<()> {
        if self.engine.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Launch("fake start failure".to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.engine.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stats_source(&self) -> Arc<dyn StatsSource> {
        self.engine.stats.clone()
    }

    fn dispatch_hook(&self) -> Option<Arc<dyn DispatchHook>> {
        self.hook.clone().map(|hook| hook as Arc<dyn DispatchHook>)
    }
}
