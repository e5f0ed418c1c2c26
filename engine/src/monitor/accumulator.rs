use crate::store::SettingsStore;
use common::Traffic;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub committed: usize,
    pub unknown: usize,
    pub failed: usize,
}

/// Unflushed per-user traffic since the last commit.
#[derive(Debug, Default)]
pub struct TrafficAccumulator {
    pending: HashMap<String, Traffic>,
}

impl TrafficAccumulator {
    pub fn add(&mut self, identity: &str, delta: Traffic) {
        if delta.is_zero() {
            return;
        }
        *self.pending.entry(identity.to_string()).or_default() += delta;
    }

    pub fn get(&self, identity: &str) -> Option<Traffic> {
        self.pending.get(identity).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Commits every pending amount. Failed writes stay pending for the
    /// next flush; identities the store does not know are discarded.
    pub async fn flush(&mut self, store: &dyn SettingsStore) -> FlushReport {
        let mut report = FlushReport::default();
        let pending: Vec<(String, Traffic)> = self
            .pending
            .iter()
            .filter(|(_, traffic)| !traffic.is_zero())
            .map(|(identity, traffic)| (identity.clone(), *traffic))
            .collect();

        for (identity, traffic) in pending {
            match store.add_traffic(&identity, traffic).await {
                Ok(true) => {
                    self.pending.remove(&identity);
                    report.committed += 1;
                }
                Ok(false) => {
                    debug!("Discarding traffic of unknown identity {}", identity);
                    self.pending.remove(&identity);
                    report.unknown += 1;
                }
                Err(e) => {
                    warn!("Failed to flush traffic of {}: {}", identity, e);
                    report.failed += 1;
                }
            }
        }
        self.pending.retain(|_, traffic| !traffic.is_zero());
        report
    }
}
