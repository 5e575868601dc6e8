mod connection;
mod embedder;
mod errors;
mod in_memory;
mod records;
mod schema;
mod scoring;
mod transcript;

use libsql::{Builder, Connection, Database};
use types::{MemoryConfig, MemoryError};

use connection::{StoreLocation, ensure_local_parent_directory};
use errors::connection_error;
use schema::{
    enable_foreign_keys, enable_wal_mode, ensure_migration_bookkeeping, run_pending_migrations,
    verify_required_schema,
};

pub use embedder::HashingEmbedder;
pub use in_memory::InMemoryStore;

/// libsql-backed store for transcripts, tool-call rows and memory records.
///
/// Implements both [`types::TranscriptStore`] and [`types::MemoryStore`] over
/// one database. Every connection it hands out has foreign keys enabled.
pub struct LibsqlStore {
    db: Database,
}

impl LibsqlStore {
    /// Opens the configured store, or `None` when durable memory is disabled.
    pub async fn from_config(config: &MemoryConfig) -> Result<Option<Self>, MemoryError> {
        let Some(location) = StoreLocation::from_config(config)? else {
            return Ok(None);
        };
        Self::open(location).await.map(Some)
    }

    pub async fn new_local(db_path: impl Into<String>) -> Result<Self, MemoryError> {
        Self::open(StoreLocation::Local {
            db_path: db_path.into(),
        })
        .await
    }

    pub async fn new_remote(
        url: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Result<Self, MemoryError> {
        Self::open(StoreLocation::Remote {
            url: url.into(),
            auth_token: auth_token.into(),
        })
        .await
    }

    async fn open(location: StoreLocation) -> Result<Self, MemoryError> {
        let description = location.describe();
        let is_local = matches!(location, StoreLocation::Local { .. });
        let db = match location {
            StoreLocation::Local { db_path } => {
                ensure_local_parent_directory(&db_path)?;
                Builder::new_local(db_path)
                    .build()
                    .await
                    .map_err(|error| connection_error(error.to_string()))?
            }
            StoreLocation::Remote { url, auth_token } => Builder::new_remote(url, auth_token)
                .build()
                .await
                .map_err(|error| connection_error(error.to_string()))?,
        };

        let store = Self { db };
        store.initialize(is_local).await?;
        tracing::info!(store = %description, "transcript store ready");
        Ok(store)
    }

    async fn initialize(&self, is_local: bool) -> Result<(), MemoryError> {
        let conn = self.connect().await?;
        if is_local {
            enable_wal_mode(&conn).await?;
        }
        ensure_migration_bookkeeping(&conn).await?;
        run_pending_migrations(&conn).await?;
        verify_required_schema(&conn).await?;
        Ok(())
    }

    pub(crate) async fn connect(&self) -> Result<Connection, MemoryError> {
        let conn = self
            .db
            .connect()
            .map_err(|error| connection_error(error.to_string()))?;
        enable_foreign_keys(&conn).await?;
        Ok(conn)
    }
}
