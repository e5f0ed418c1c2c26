use sea_orm::entity::prelude::*;

/// A federated peer panel whose users may use this server.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "links")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub local_code: String,
    pub link: String,
    pub last_sync_status: String,
    /// JSON array of identities synced from the peer.
    pub users: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
