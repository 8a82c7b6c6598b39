use crate::memory::InMemoryApprovalStorage;
use crate::traits::ApprovalStorage;
use crate::{StorageError, StorageResult};
use std::sync::Arc;

/// Storage backend selection for the approval engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageConfig {
    /// Keep requests and confirmations in process memory only.
    #[default]
    Memory,
    /// Persist requests and confirmations in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }

    /// Open the configured backend, creating the schema where needed.
    pub async fn bootstrap(&self) -> StorageResult<Arc<dyn ApprovalStorage>> {
        match self {
            Self::Memory => Ok(Arc::new(InMemoryApprovalStorage::new())),
            #[cfg(feature = "postgres")]
            Self::Postgres {
                database_url,
                max_connections,
            } => {
                let storage = crate::postgres::PostgresApprovalStorage::connect(
                    database_url,
                    *max_connections,
                )
                .await?;
                storage.init_schema().await?;
                Ok(Arc::new(storage))
            }
            #[cfg(not(feature = "postgres"))]
            Self::Postgres { .. } => Err(StorageError::Backend(
                "postgres storage requested but approval-store was built without the `postgres` feature"
                    .to_string(),
            )),
        }
    }
}
