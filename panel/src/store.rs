use crate::entity::{link, setting, template, user};
use crate::error::Result;
use async_trait::async_trait;
use common::Traffic;
use engine::{EngineError, SettingsStore, UserRecord};
use sea_orm::sea_query::Expr;
use sea_orm::*;
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL,
        username TEXT NOT NULL,
        upload INTEGER NOT NULL DEFAULT 0,
        download INTEGER NOT NULL DEFAULT 0,
        speed_limit INTEGER,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL UNIQUE,
        value TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS templates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        slug TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        content TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        local_code TEXT NOT NULL DEFAULT '',
        link TEXT NOT NULL DEFAULT '',
        last_sync_status TEXT NOT NULL DEFAULT '',
        users TEXT
    )
    "#,
];

fn store_error(e: DbErr) -> EngineError {
    EngineError::Store(e.to_string())
}

/// SQLite persistence of users, settings, templates and peer links.
pub struct SqliteStore {
    db: DatabaseConnection,
}

impl SqliteStore {
    #[instrument(skip(database_path))]
    pub async fn open<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let database_path = database_path.as_ref();
        if let Some(parent) = database_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let database_url = format!("sqlite:{}?mode=rwc", database_path.display());
        let store = Self::connect(ConnectOptions::new(database_url)).await?;
        info!("Connected to SQLite database: {}", database_path.display());
        Ok(store)
    }

    pub async fn connect(mut options: ConnectOptions) -> Result<Self> {
        options.sqlx_logging(false);
        let db = Database::connect(options).await?;
        for sql in SCHEMA {
            db.execute(Statement::from_string(db.get_database_backend(), sql.to_string()))
                .await?;
        }
        Ok(Self { db })
    }

    #[instrument(skip(self))]
    pub async fn list_users(&self) -> Result<Vec<user::Model>> {
        Ok(user::Entity::find()
            .order_by_asc(user::Column::Id)
            .all(&self.db)
            .await?)
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn setting(&self, key: &str) -> engine::Result<Option<String>> {
        let found = setting::Entity::find()
            .filter(setting::Column::Key.eq(key))
            .one(&self.db)
            .await
            .map_err(store_error)?;
        Ok(found.and_then(|s| s.value))
    }

    async fn template(&self, slug: &str) -> engine::Result<Option<String>> {
        let found = template::Entity::find()
            .filter(template::Column::Slug.eq(slug))
            .one(&self.db)
            .await
            .map_err(store_error)?;
        Ok(found.and_then(|t| t.content))
    }

    async fn users(&self) -> engine::Result<Vec<UserRecord>> {
        let users = user::Entity::find()
            .order_by_asc(user::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_error)?;
        Ok(users
            .into_iter()
            .map(|u| UserRecord {
                id: u.id,
                uuid: u.uuid,
                username: u.username,
                upload: u.upload,
                download: u.download,
                speed_limit: u.speed_limit.filter(|l| *l > 0).map(|l| l as u64),
            })
            .collect())
    }

    /// Identities of every successfully synced peer, deduplicated.
    async fn peer_identities(&self) -> engine::Result<Vec<String>> {
        let links = link::Entity::find()
            .filter(link::Column::LastSyncStatus.eq("success"))
            .all(&self.db)
            .await
            .map_err(store_error)?;

        let mut identities: Vec<String> = Vec::new();
        for link in links {
            let Some(raw) = link.users.filter(|raw| !raw.trim().is_empty()) else {
                continue;
            };
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(users) => {
                    for user in users {
                        if !user.is_empty() && !identities.contains(&user) {
                            identities.push(user);
                        }
                    }
                }
                Err(e) => debug!("Ignoring unreadable users of link {}: {}", link.id, e),
            }
        }
        Ok(identities)
    }

    async fn add_traffic(&self, identity: &str, traffic: Traffic) -> engine::Result<bool> {
        let result = user::Entity::update_many()
            .col_expr(
                user::Column::Upload,
                Expr::col(user::Column::Upload).add(traffic.up as i64),
            )
            .col_expr(
                user::Column::Download,
                Expr::col(user::Column::Download).add(traffic.down as i64),
            )
            .col_expr(
                user::Column::UpdatedAt,
                Expr::value(chrono::Utc::now().naive_utc()),
            )
            .filter(
                Condition::any()
                    .add(user::Column::Uuid.eq(identity))
                    .add(user::Column::Username.eq(identity)),
            )
            .exec(&self.db)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected > 0)
    }
}

#[cfg(test)]
impl SqliteStore {
    pub async fn in_memory() -> Self {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1);
        Self::connect(options).await.unwrap()
    }

    pub async fn insert_user(&self, username: &str, uuid: &str, speed_limit: Option<i64>) {
        let now = chrono::Utc::now().naive_utc();
        user::ActiveModel {
            uuid: Set(uuid.to_string()),
            username: Set(username.to_string()),
            upload: Set(0),
            download: Set(0),
            speed_limit: Set(speed_limit),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .unwrap();
    }

    pub async fn put_setting(&self, key: &str, value: &str) {
        setting::ActiveModel {
            key: Set(key.to_string()),
            value: Set(Some(value.to_string())),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .unwrap();
    }

    pub async fn put_template(&self, slug: &str, content: &str) {
        template::ActiveModel {
            slug: Set(slug.to_string()),
            name: Set(slug.to_string()),
            description: Set(String::new()),
            content: Set(Some(content.to_string())),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .unwrap();
    }

    pub async fn put_link(&self, status: &str, users: &str) {
        link::ActiveModel {
            local_code: Set("code".to_string()),
            link: Set("https://peer.example.com".to_string()),
            last_sync_status: Set(status.to_string()),
            users: Set(Some(users.to_string())),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_and_templates_are_read_raw() {
        let store = SqliteStore::in_memory().await;
        store.put_setting("template", "\"basic\"").await;
        store.put_template("basic", r#"{"core":"xray"}"#).await;

        assert_eq!(
            store.setting("template").await.unwrap().as_deref(),
            Some("\"basic\"")
        );
        assert!(store.setting("server").await.unwrap().is_none());
        assert_eq!(
            store.template("basic").await.unwrap().as_deref(),
            Some(r#"{"core":"xray"}"#)
        );
        assert!(store.template("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn users_map_to_records() {
        let store = SqliteStore::in_memory().await;
        store.insert_user("alice", "u-1", Some(1024)).await;
        store.insert_user("bob", "u-2", Some(0)).await;

        let users = store.users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].username, "alice");
        assert_eq!(users[0].speed_limit, Some(1024));
        assert_eq!(users[1].speed_limit, None);
    }

    #[tokio::test]
    async fn traffic_is_added_by_uuid_or_username() {
        let store = SqliteStore::in_memory().await;
        store.insert_user("alice", "u-1", None).await;

        assert!(store.add_traffic("alice", Traffic::new(100, 50)).await.unwrap());
        assert!(store.add_traffic("u-1", Traffic::new(1, 2)).await.unwrap());
        assert!(!store.add_traffic("mallory", Traffic::new(9, 9)).await.unwrap());

        let users = store.list_users().await.unwrap();
        assert_eq!(users[0].upload, 101);
        assert_eq!(users[0].download, 52);
    }

    #[tokio::test]
    async fn only_synced_links_contribute_peers() {
        let store = SqliteStore::in_memory().await;
        store.put_link("success", r#"["carol", "dave"]"#).await;
        store.put_link("success", r#"["dave", ""]"#).await;
        store.put_link("failed", r#"["eve"]"#).await;
        store.put_link("success", "not json").await;

        let peers = store.peer_identities().await.unwrap();
        assert_eq!(peers, vec!["carol".to_string(), "dave".to_string()]);
    }
}
