use crate::error::Result;
use async_trait::async_trait;
use common::Traffic;
use serde::{Deserialize, Serialize};

/// A configured user as the persistence layer stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub uuid: String,
    pub username: String,
    pub upload: i64,
    pub download: i64,
    /// Bytes per second, `None` or zero for unlimited.
    pub speed_limit: Option<u64>,
}

/// Read access to settings/users and write access to traffic totals.
///
/// Values are returned as stored; decoding is the caller's job.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Raw value of a settings row.
    async fn setting(&self, key: &str) -> Result<Option<String>>;

    /// Raw JSON content of the template with the given slug.
    async fn template(&self, slug: &str) -> Result<Option<String>>;

    async fn users(&self) -> Result<Vec<UserRecord>>;

    /// Identities announced by successfully synced federated links.
    async fn peer_identities(&self) -> Result<Vec<String>>;

    /// Adds to the persisted totals of the user whose uuid or username is
    /// `identity`. Returns `false` when no such user exists.
    async fn add_traffic(&self, identity: &str, traffic: Traffic) -> Result<bool>;
}
