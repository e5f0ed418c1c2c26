mod accumulator;
mod delta;

pub use accumulator::{FlushReport, TrafficAccumulator};
pub use delta::DeltaTracker;

use crate::accounting::TrafficAccountingLayer;
use crate::adapter::{ConnectionEntry, EngineKind, StatsSample, StatsSource};
use crate::hub::BroadcastHub;
use crate::settings::MonitorSettings;
use crate::store::SettingsStore;
use common::Traffic;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What the monitor needs to know about the running engine.
pub struct ActiveEngine {
    pub generation: u64,
    pub kind: EngineKind,
    pub stats: Arc<dyn StatsSource>,
    /// Installed accounting layer, `None` in degraded mode.
    pub layer: Option<Arc<TrafficAccountingLayer>>,
    /// Identity for unattributed connections when exactly one user exists.
    pub fallback_identity: Option<String>,
    pub cancel: CancellationToken,
}

pub type ActiveEngineReceiver = watch::Receiver<Option<Arc<ActiveEngine>>>;

#[derive(Debug, Serialize)]
struct SpeedEvent {
    up: f64,
    down: f64,
}

#[derive(Debug, Serialize)]
struct ConnectionsEvent<'a> {
    connections: &'a [ConnectionEntry],
}

/// Bookkeeping of one engine generation.
#[derive(Default)]
pub struct GenerationState {
    total: Traffic,
    connections: DeltaTracker<String>,
    counters: DeltaTracker<String>,
    pub accumulator: TrafficAccumulator,
    ticks: u32,
}

impl GenerationState {
    /// Folds one sample into the state and returns the global delta.
    ///
    /// With an accounting layer its counters are the only per-user source,
    /// otherwise connection metadata and engine counters are used.
    pub fn absorb(
        &mut self,
        sample: &StatsSample,
        layer_counters: Option<&HashMap<String, Traffic>>,
        fallback_identity: Option<&str>,
    ) -> Traffic {
        let total_delta = sample.total.saturating_delta(self.total);
        self.total = sample.total;

        match layer_counters {
            Some(counters) => self.absorb_layer(counters),
            None => {
                for conn in sample.connections.iter().filter(|c| !c.id.is_empty()) {
                    let delta = self.connections.observe(&conn.id, conn.traffic());
                    match conn.identity().or(fallback_identity) {
                        Some(identity) => self.accumulator.add(identity, delta),
                        None => debug!("Connection {} has no owner, counted globally only", conn.id),
                    }
                }
                for (identity, current) in &sample.user_counters {
                    let delta = self.counters.observe(identity, *current);
                    self.accumulator.add(identity, delta);
                }
            }
        }

        self.connections.sweep();
        self.counters.sweep();
        total_delta
    }

    /// Folds cumulative accounting-layer counters into the accumulator.
    pub fn absorb_layer(&mut self, counters: &HashMap<String, Traffic>) {
        for (identity, current) in counters {
            let delta = self.counters.observe(identity, *current);
            self.accumulator.add(identity, delta);
        }
    }
}

/// Polls the active engine every tick, publishes metrics and periodically
/// commits per-user traffic.
pub struct Monitor {
    store: Arc<dyn SettingsStore>,
    hub: BroadcastHub,
    settings: MonitorSettings,
    active: ActiveEngineReceiver,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        hub: BroadcastHub,
        settings: MonitorSettings,
        active: ActiveEngineReceiver,
    ) -> Self {
        Self {
            store,
            hub,
            settings,
            active,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Follows engine generations until `shutdown` fires. Only one
    /// generation is ever monitored at a time.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let current = self.active.borrow_and_update().clone();
            if let Some(engine) = current {
                self.run_generation(engine, &shutdown).await;
            }
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = self.active.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Monitor stopped");
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active
            .borrow()
            .as_ref()
            .is_some_and(|engine| engine.generation == generation)
    }

    #[instrument(skip_all, fields(generation = engine.generation, kind = %engine.kind))]
    async fn run_generation(&mut self, engine: Arc<ActiveEngine>, shutdown: &CancellationToken) {
        info!("Monitoring engine generation");
        let period = self.settings.tick_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let fallback = if self.settings.single_user_fallback {
            engine.fallback_identity.clone()
        } else {
            None
        };
        let mut state = GenerationState::default();

        loop {
            tokio::select! {
                _ = engine.cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                changed = self.active.changed() => {
                    if changed.is_err() || !self.is_current(engine.generation) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if !self.is_current(engine.generation) {
                        break;
                    }
                    self.tick(&engine, &mut state, fallback.as_deref(), period).await;
                }
            }
        }

        if let Some(layer) = &engine.layer {
            state.absorb_layer(&layer.snapshot());
        }
        let report = state.accumulator.flush(self.store.as_ref()).await;
        info!(
            "Generation ended, final flush committed {} users ({} failed)",
            report.committed, report.failed
        );
    }

    async fn tick(
        &self,
        engine: &ActiveEngine,
        state: &mut GenerationState,
        fallback: Option<&str>,
        period: Duration,
    ) {
        match engine.stats.sample().await {
            Ok(sample) => {
                let layer_counters = engine.layer.as_ref().map(|layer| layer.snapshot());
                let delta = state.absorb(&sample, layer_counters.as_ref(), fallback);
                self.publish(&sample, delta, period);
            }
            Err(e) => warn!("Failed to poll engine statistics: {}", e),
        }

        state.ticks += 1;
        if state.ticks >= self.settings.flush_every_ticks.max(1) {
            state.ticks = 0;
            let report = state.accumulator.flush(self.store.as_ref()).await;
            if report.committed + report.failed > 0 {
                debug!(
                    "Flushed traffic: {} committed, {} unknown, {} failed",
                    report.committed, report.unknown, report.failed
                );
            }
        }
    }

    fn publish(&self, sample: &StatsSample, delta: Traffic, period: Duration) {
        let secs = period.as_secs_f64();
        let mbps = |bytes: u64| bytes as f64 * 8.0 / 1_000_000.0 / secs;
        self.hub.broadcast(
            "speed",
            &SpeedEvent {
                up: mbps(delta.up),
                down: mbps(delta.down),
            },
        );
        self.hub.broadcast("traffic", &sample.total);
        self.hub.broadcast(
            "connections",
            &ConnectionsEvent {
                connections: &sample.connections,
            },
        );
    }
}
