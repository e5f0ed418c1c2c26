mod metered_stream;

pub use metered_stream::MeteredStream;

use crate::adapter::{BoxedStream, ConnectionInterceptor, ProxyStream};
use crate::settings::LimiterSettings;
use common::{BandwidthLimiter, BurstBand, Traffic};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Cumulative byte counters of one identity.
#[derive(Debug, Default)]
pub struct UserCounters {
    up: AtomicU64,
    down: AtomicU64,
}

impl UserCounters {
    pub fn add_up(&self, bytes: u64) {
        self.up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_down(&self, bytes: u64) {
        self.down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn traffic(&self) -> Traffic {
        Traffic::new(self.up.load(Ordering::Relaxed), self.down.load(Ordering::Relaxed))
    }
}

type LimiterMap = HashMap<String, BandwidthLimiter>;

/// The current limiter set, shared with every metered stream.
///
/// The set is replaced as a whole on every update, so readers always see
/// one consistent generation of limits.
#[derive(Debug)]
pub struct LimiterTable {
    limiters: RwLock<Arc<LimiterMap>>,
    default_identity: String,
}

impl LimiterTable {
    /// The identity's limiter, else the default bucket's, else none.
    pub fn get(&self, identity: &str) -> Option<BandwidthLimiter> {
        let limiters = self.limiters.read();
        limiters
            .get(identity)
            .or_else(|| limiters.get(&self.default_identity))
            .cloned()
    }

    fn replace(&self, limiters: LimiterMap) {
        *self.limiters.write() = Arc::new(limiters);
    }
}

/// Per-user metering and rate limiting of proxied connections.
///
/// Counters live apart from the limiters and survive limit updates.
pub struct TrafficAccountingLayer {
    table: Arc<LimiterTable>,
    counters: DashMap<String, Arc<UserCounters>>,
    band: BurstBand,
}

impl TrafficAccountingLayer {
    pub fn new(settings: &LimiterSettings, limits: &HashMap<String, u64>) -> Self {
        let band = settings.band();
        Self {
            table: Arc::new(LimiterTable {
                limiters: RwLock::new(Arc::new(build_limiters(limits, band))),
                default_identity: settings.default_identity.clone(),
            }),
            counters: DashMap::new(),
            band,
        }
    }

    /// Meters `stream` as traffic of `identity`.
    pub fn wrap_connection<S: ProxyStream>(&self, identity: &str, stream: S) -> MeteredStream<S> {
        let identity = if identity.is_empty() {
            self.table.default_identity.as_str()
        } else {
            identity
        };
        debug!("Metering connection of {}", identity);
        MeteredStream::new(
            stream,
            self.table.clone(),
            identity.to_string(),
            self.counters_for(identity),
        )
    }

    pub fn get_limiter(&self, identity: &str) -> Option<BandwidthLimiter> {
        self.table.get(identity)
    }

    /// Replaces every limiter at once. Live connections pick the new ones up
    /// on their next read or write.
    pub fn update_limits(&self, limits: &HashMap<String, u64>) {
        let rebuilt = build_limiters(limits, self.band);
        info!("Updating rate limits for {} identities", rebuilt.len());
        self.table.replace(rebuilt);
    }

    pub fn counters_for(&self, identity: &str) -> Arc<UserCounters> {
        if let Some(counters) = self.counters.get(identity) {
            return counters.clone();
        }
        self.counters
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    /// Cumulative traffic of every identity seen so far.
    pub fn snapshot(&self) -> HashMap<String, Traffic> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().traffic()))
            .collect()
    }
}

impl ConnectionInterceptor for TrafficAccountingLayer {
    fn intercept(&self, identity: &str, stream: BoxedStream) -> BoxedStream {
        Box::new(self.wrap_connection(identity, stream))
    }
}

fn build_limiters(limits: &HashMap<String, u64>, band: BurstBand) -> LimiterMap {
    limits
        .iter()
        .filter(|(_, rate)| **rate > 0)
        .map(|(identity, rate)| (identity.clone(), BandwidthLimiter::with_band(*rate, band)))
        .collect()
}
