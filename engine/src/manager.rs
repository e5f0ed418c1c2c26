use crate::accounting::TrafficAccountingLayer;
use crate::adapter::{EngineAdapter, EngineDocument, EngineInstance, EngineKind};
use crate::error::{EngineError, Result};
use crate::monitor::{ActiveEngine, ActiveEngineReceiver};
use crate::settings::{EngineSettings, LimiterSettings};
use crate::store::SettingsStore;
use crate::template;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Output of `refresh`: everything needed to start an engine.
#[derive(Debug, Clone)]
pub struct PreparedEngine {
    pub kind: EngineKind,
    pub document: EngineDocument,
    pub limits: HashMap<String, u64>,
    pub fallback_identity: Option<String>,
}

struct RunningEngine {
    instance: Box<dyn EngineInstance>,
    adapter: Arc<dyn EngineAdapter>,
    cancel: CancellationToken,
    layer: Option<Arc<TrafficAccountingLayer>>,
    generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub generation: Option<u64>,
    pub kind: Option<EngineKind>,
    /// Whether per-user accounting is attached to the running engine.
    pub accounting: bool,
}

/// Owns the single engine instance of the process.
///
/// `start`, `restart` and `kill` are serialised by one lock; the instance
/// and its generation are published together through a watch channel.
pub struct EngineManager {
    store: Arc<dyn SettingsStore>,
    adapters: HashMap<EngineKind, Arc<dyn EngineAdapter>>,
    settings: EngineSettings,
    limiter: LimiterSettings,
    prepared: parking_lot::Mutex<Option<Arc<PreparedEngine>>>,
    running: tokio::sync::Mutex<Option<RunningEngine>>,
    generation: AtomicU64,
    active: watch::Sender<Option<Arc<ActiveEngine>>>,
}

impl EngineManager {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        adapters: Vec<Arc<dyn EngineAdapter>>,
        settings: EngineSettings,
        limiter: LimiterSettings,
    ) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.kind(), adapter))
            .collect();
        let (active, _) = watch::channel(None);
        Self {
            store,
            adapters,
            settings,
            limiter,
            prepared: parking_lot::Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            active,
        }
    }

    fn adapter(&self, kind: EngineKind) -> Result<Arc<dyn EngineAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| EngineError::Configuration(format!("no adapter for engine {}", kind)))
    }

    /// Re-reads the stored settings and synthesises the engine document.
    /// The running instance is left alone.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<()> {
        let Some(prepared) =
            template::prepare(self.store.as_ref(), &self.settings, &self.limiter).await?
        else {
            *self.prepared.lock() = None;
            return Ok(());
        };

        let kind = prepared.template.engine_kind();
        let adapter = self.adapter(kind)?;
        let document = adapter.build_config(&prepared.server, &prepared.users, prepared.tls.as_ref())?;
        *self.prepared.lock() = Some(Arc::new(PreparedEngine {
            kind,
            document,
            limits: prepared.limits,
            fallback_identity: prepared.sole_user,
        }));
        info!("Refreshed {} configuration", kind);
        Ok(())
    }

    pub fn prepared(&self) -> Option<Arc<PreparedEngine>> {
        self.prepared.lock().clone()
    }

    /// Replaces whatever runs with a fresh instance of the prepared
    /// configuration. Does nothing when nothing has been prepared.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let Some(prepared) = self.prepared() else {
            debug!("Nothing prepared, not starting an engine");
            return Ok(());
        };
        let mut running = self.running.lock().await;
        self.kill_locked(&mut running).await;

        let adapter = self.adapter(prepared.kind)?;
        let mut instance = adapter.launch(&prepared.document).await?;

        let layer = Arc::new(TrafficAccountingLayer::new(&self.limiter, &prepared.limits));
        let layer = match adapter.install_accounting(instance.as_ref(), layer.clone()) {
            Ok(()) => Some(layer),
            Err(e) => {
                warn!("Accounting unavailable, running without per-user attribution: {}", e);
                None
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        if let Err(e) = instance.start(cancel.clone()).await {
            cancel.cancel();
            if let Err(close_err) = adapter.shutdown(instance).await {
                warn!("Failed to tear down {} after launch error: {}", prepared.kind, close_err);
            }
            return Err(e);
        }

        self.active.send_replace(Some(Arc::new(ActiveEngine {
            generation,
            kind: prepared.kind,
            stats: instance.stats_source(),
            layer: layer.clone(),
            fallback_identity: prepared.fallback_identity.clone(),
            cancel: cancel.clone(),
        })));
        *running = Some(RunningEngine {
            instance,
            adapter,
            cancel,
            layer,
            generation,
        });
        info!("Engine {} started as generation {}", prepared.kind, generation);
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.start().await
    }

    /// Stops the running instance, if any.
    #[instrument(skip(self))]
    pub async fn kill(&self) {
        let mut running = self.running.lock().await;
        self.kill_locked(&mut running).await;
    }

    async fn kill_locked(&self, running: &mut Option<RunningEngine>) {
        let Some(engine) = running.take() else {
            return;
        };
        self.active.send_replace(None);
        engine.cancel.cancel();
        let kind = engine.instance.kind();
        if let Err(e) = engine.adapter.shutdown(engine.instance).await {
            warn!("Failed to shut down {}: {}", kind, e);
        }
        info!("Engine {} generation {} stopped", kind, engine.generation);
        // bound ports need a moment before the next instance binds them
        tokio::time::sleep(self.settings.settle_delay()).await;
    }

    pub fn is_running(&self) -> bool {
        self.active.borrow().is_some()
    }

    pub fn status(&self) -> EngineStatus {
        match self.active.borrow().as_ref() {
            Some(engine) => EngineStatus {
                running: true,
                generation: Some(engine.generation),
                kind: Some(engine.kind),
                accounting: engine.layer.is_some(),
            },
            None => EngineStatus {
                running: false,
                generation: None,
                kind: None,
                accounting: false,
            },
        }
    }

    /// Pushes the prepared limits into the live accounting layer without a
    /// restart. Returns false when no layer is running.
    pub async fn apply_limits(&self) -> bool {
        let Some(prepared) = self.prepared() else {
            return false;
        };
        let running = self.running.lock().await;
        match running.as_ref().and_then(|engine| engine.layer.as_ref()) {
            Some(layer) => {
                layer.update_limits(&prepared.limits);
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> ActiveEngineReceiver {
        self.active.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::BroadcastHub;
    use crate::monitor::Monitor;
    use crate::settings::{HubSettings, MonitorSettings};
    use crate::store::UserRecord;
    use crate::testing::{FakeAdapter, FakeEngine, MemoryStore};
    use common::Traffic;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    const MIB: usize = 1024 * 1024;

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        store.set_setting("template", "\"basic\"");
        store.set_setting("server", r#"{"listen_port": 443}"#);
        store.set_template(
            "basic",
            r#"{"_name": "Basic", "core": "singbox", "server": {"type": "vless"}}"#,
        );
        store.add_user(UserRecord {
            id: 1,
            uuid: "u-alice".to_string(),
            username: "alice".to_string(),
            speed_limit: Some(MIB as u64),
            ..Default::default()
        });
        store.add_user(UserRecord {
            id: 2,
            uuid: "u-bob".to_string(),
            username: "bob".to_string(),
            ..Default::default()
        });
        store
    }

    fn manager(store: Arc<MemoryStore>) -> (EngineManager, Arc<FakeEngine>) {
        let adapter = FakeAdapter::new(EngineKind::SingBox);
        let engine = adapter.engine.clone();
        let settings = EngineSettings {
            settle_delay_ms: 0,
            ..Default::default()
        };
        let manager = EngineManager::new(
            store,
            vec![Arc::new(adapter)],
            settings,
            LimiterSettings::default(),
        );
        (manager, engine)
    }

    fn live(engine: &FakeEngine) -> usize {
        engine.live.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn start_without_refresh_is_a_no_op() {
        let (manager, engine) = manager(store());
        manager.start().await.unwrap();
        assert!(!manager.is_running());
        assert_eq!(engine.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_template_prepares_nothing() {
        let store = Arc::new(MemoryStore::default());
        let (manager, _) = manager(store);
        manager.refresh().await.unwrap();
        assert!(manager.prepared().is_none());
    }

    #[tokio::test]
    async fn missing_template_is_a_configuration_error() {
        let store = store();
        store.set_setting("template", "\"missing\"");
        let (manager, engine) = manager(store);
        let err = manager.refresh().await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        manager.start().await.unwrap();
        assert_eq!(live(&engine), 0);
    }

    #[tokio::test]
    async fn refresh_does_not_touch_the_running_engine() {
        let store = store();
        let (manager, engine) = manager(store.clone());
        manager.refresh().await.unwrap();
        manager.start().await.unwrap();

        store.add_user(UserRecord {
            uuid: "u-carol".to_string(),
            username: "carol".to_string(),
            ..Default::default()
        });
        manager.refresh().await.unwrap();
        assert_eq!(engine.launches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().generation, Some(1));

        let document = engine.last_document.lock().clone().unwrap();
        assert_eq!(document["users"].as_array().unwrap().len(), 2);
        let prepared = manager.prepared().unwrap();
        assert_eq!(prepared.document.body["users"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn at_most_one_instance_across_transitions() {
        let (manager, engine) = manager(store());
        manager.refresh().await.unwrap();

        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert_eq!(live(&engine), 1);
        assert_eq!(manager.status().generation, Some(1));

        manager.restart().await.unwrap();
        assert_eq!(live(&engine), 1);
        assert_eq!(manager.status().generation, Some(2));

        manager.start().await.unwrap();
        assert_eq!(live(&engine), 1);
        assert_eq!(manager.status().generation, Some(3));

        manager.kill().await;
        assert!(!manager.is_running());
        assert_eq!(live(&engine), 0);

        manager.kill().await;
        assert_eq!(live(&engine), 0);
        assert_eq!(engine.launches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn launch_failure_leaves_nothing_running() {
        let (manager, engine) = manager(store());
        manager.refresh().await.unwrap();
        manager.start().await.unwrap();

        engine.fail_launch.store(true, Ordering::SeqCst);
        let err = manager.restart().await.unwrap_err();
        assert!(matches!(err, EngineError::Launch(_)));
        assert!(!manager.is_running());
        assert_eq!(live(&engine), 0);
    }

    #[tokio::test]
    async fn start_failure_tears_the_instance_down() {
        let (manager, engine) = manager(store());
        manager.refresh().await.unwrap();
        engine.fail_start.store(true, Ordering::SeqCst);

        assert!(manager.start().await.is_err());
        assert!(!manager.is_running());
        assert_eq!(live(&engine), 0);
        assert_eq!(engine.launches.load(Ordering::SeqCst), 1);

        engine.fail_start.store(false, Ordering::SeqCst);
        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert_eq!(live(&engine), 1);
    }

    #[tokio::test]
    async fn missing_hook_runs_degraded() {
        let (manager, engine) = manager(store());
        engine.without_hook.store(true, Ordering::SeqCst);
        manager.refresh().await.unwrap();
        manager.start().await.unwrap();

        let status = manager.status();
        assert!(status.running);
        assert!(!status.accounting);
        assert!(manager.subscribe().borrow().as_ref().unwrap().layer.is_none());
        assert!(!manager.apply_limits().await);
    }

    #[tokio::test]
    async fn kill_cancels_the_active_generation() {
        let (manager, _) = manager(store());
        manager.refresh().await.unwrap();
        manager.start().await.unwrap();

        let mut active = manager.subscribe();
        let engine = active.borrow_and_update().clone().unwrap();
        assert_eq!(engine.fallback_identity, None);

        manager.kill().await;
        assert!(engine.cancel.is_cancelled());
        assert!(active.borrow_and_update().is_none());
    }

    #[tokio::test]
    async fn limits_follow_user_settings() {
        let store = store();
        let (manager, engine) = manager(store.clone());
        manager.refresh().await.unwrap();
        manager.start().await.unwrap();

        let layer = manager
            .subscribe()
            .borrow()
            .as_ref()
            .and_then(|engine| engine.layer.clone())
            .unwrap();
        assert_eq!(layer.get_limiter("alice").unwrap().bytes_per_second(), MIB as u64);
        assert_eq!(layer.get_limiter("u-alice").unwrap().bytes_per_second(), MIB as u64);
        assert!(layer.get_limiter("bob").is_none());
        assert!(engine.last_hook.lock().as_ref().unwrap().is_installed());

        store.set_template(
            "basic",
            r#"{"core": "singbox", "server": {"type": "vless"}, "user_limit": 2048}"#,
        );
        manager.refresh().await.unwrap();
        assert!(manager.apply_limits().await);
        assert_eq!(layer.get_limiter("bob").unwrap().bytes_per_second(), 2048);
        assert_eq!(layer.get_limiter("alice").unwrap().bytes_per_second(), MIB as u64);
    }

    async fn push(mut client: tokio::io::DuplexStream, bytes: usize) {
        let chunk = vec![7u8; 32 * 1024];
        let mut left = bytes;
        while left > 0 {
            let n = left.min(chunk.len());
            client.write_all(&chunk[..n]).await.unwrap();
            left -= n;
        }
        client.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn two_users_end_to_end() {
        let store = store();
        let (manager, engine) = manager(store.clone());
        let hub = BroadcastHub::spawn(&HubSettings::default(), CancellationToken::new());
        let shutdown = CancellationToken::new();
        let monitor = Monitor::new(
            store.clone(),
            hub,
            MonitorSettings::default(),
            manager.subscribe(),
        )
        .spawn(shutdown.clone());

        manager.refresh().await.unwrap();
        manager.start().await.unwrap();
        let started = Instant::now();
        let hook = engine.last_hook.lock().clone().unwrap();

        let (alice_client, mut alice_engine) = hook.connect("alice");
        let (bob_client, mut bob_engine) = hook.connect("bob");
        tokio::spawn(push(alice_client, 2 * MIB));
        tokio::spawn(push(bob_client, 3 * MIB));

        let alice = tokio::spawn(async move {
            let mut received = Vec::new();
            alice_engine.read_to_end(&mut received).await.unwrap();
            (received.len(), Instant::now())
        });
        let mut received = Vec::new();
        bob_engine.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 3 * MIB);

        let (alice_bytes, alice_done) = alice.await.unwrap();
        assert_eq!(alice_bytes, 2 * MIB);
        let elapsed = alice_done - started;
        // 1 MiB/s with a 512 KiB burst
        assert!(elapsed >= Duration::from_millis(1_490), "{:?}", elapsed);
        let allowed = MIB as f64 * elapsed.as_secs_f64() + 512.0 * 1024.0;
        assert!(alice_bytes as f64 <= allowed * 1.01);
        assert!(elapsed < Duration::from_secs(10));

        // the tenth tick flushes
        tokio::time::sleep_until(started + Duration::from_millis(10_500)).await;
        assert_eq!(store.traffic_of("alice"), Some(Traffic::new(2 * MIB as u64, 0)));
        assert_eq!(store.traffic_of("bob"), Some(Traffic::new(3 * MIB as u64, 0)));

        manager.kill().await;
        shutdown.cancel();
        monitor.await.unwrap();
    }
}
